//! Output module for session reporting
//!
//! This module handles:
//! - Session statistics and the persisted stats ring
//! - Best-effort notifications of cycle summaries and warnings
//! - Progress bars for the fetch passes

pub mod notify;
pub mod progress;
pub mod stats;

pub use notify::{build_notifier, LogNotifier, Notifier, NotifyLevel, TelegramNotifier};
pub use progress::{LogBridge, ProgressReporter};
pub use stats::{format_report, load_sessions, SessionStats, StatsCollector};

use crate::storage::{DataStore, StorageResult};

/// Prints the most recent session report to stdout
pub async fn print_latest_report(store: &DataStore) -> StorageResult<()> {
    let sessions = load_sessions(store).await?;
    match sessions.first() {
        Some(latest) => {
            println!("{}", format_report(latest));
            println!("Sessions on record: {}", sessions.len());
        }
        None => println!("No statistics available"),
    }
    Ok(())
}
