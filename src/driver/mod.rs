//! Cycle driver and single-instance lock
//!
//! # Components
//!
//! - `RunLock`: exclusive `run.lock` marker with owner liveness checks
//! - `Checkpoint`: the phase the driver is in, written at each transition
//! - `CycleDriver`: runs the pipeline passes under the lock, once or on a
//!   fixed period until cancelled

mod checkpoint;
mod cycle;
mod lock;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, Phase};
pub use cycle::{CycleDriver, CycleOutcome, CycleReport, Locked};
pub use lock::{LockAttempt, LockMarker, LivenessCheck, RunLock, RunLockGuard, SysinfoLiveness};
