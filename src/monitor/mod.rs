//! Host resource monitoring
//!
//! # Components
//!
//! - `MetricsSource`: where readings come from (`SysinfoSource` in production)
//! - `SampleRing`: bounded window of readings with a trend
//! - `ResourceMonitor`: owned sampler with `start`/`stop`, feeding the
//!   concurrency controller, the session stats and threshold warnings

mod resource;
mod sampler;

pub use resource::{suggested_concurrency, ResourceMetrics, ResourceMonitor};
pub use sampler::{MetricsSource, ResourceSample, SampleRing, SysinfoSource, TREND_SPAN};
