//! Driver checkpoint (`checkpoint.json`)

use crate::storage::{read_json, write_json, DataStore, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline phase the driver is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Listing,
    Details,
    Items,
    Idle,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Listing => "listing",
            Phase::Details => "details",
            Phase::Items => "items",
            Phase::Idle => "idle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub phase: Phase,
    pub cycle_started: Option<DateTime<Utc>>,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
}

/// Records a phase transition
pub async fn save_checkpoint(
    store: &DataStore,
    phase: Phase,
    cycle_started: Option<DateTime<Utc>>,
) -> StorageResult<Checkpoint> {
    let checkpoint = Checkpoint {
        phase,
        cycle_started,
        pid: std::process::id(),
        updated_at: Utc::now(),
    };
    write_json(&store.checkpoint_path(), &checkpoint).await?;
    tracing::debug!("Checkpoint: {}", phase);
    Ok(checkpoint)
}

pub async fn load_checkpoint(store: &DataStore) -> StorageResult<Option<Checkpoint>> {
    read_json(&store.checkpoint_path()).await
}
