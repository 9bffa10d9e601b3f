//! Storage module for persisting harvest records
//!
//! This module owns every file under the data directory:
//! - JSON layout and atomic writes (`DataStore`)
//! - Per-target failure lists (`FailureTracker`)
//! - The single writer that advances a target's cursor (`ProgressWriter`)
//! - Offline reconciliation of cursors against item files (`verify_target`)

mod failures;
mod files;
mod verify;
mod writer;

pub use failures::FailureTracker;
pub use files::{parse_item_file_name, read_json, write_json, DataStore};
pub use verify::{reconcile, verify_target, Reconciliation, VerifyReport};
pub use writer::{ProgressHandle, ProgressSender, ProgressWriter, WriterSnapshot};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error at {path}: {source}")]
    Serialization {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("No detail record for target: {0}")]
    MissingDetail(String),

    #[error("Progress writer for {0} has stopped")]
    WriterClosed(String),
}

impl StorageError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn serialization(path: &Path, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
