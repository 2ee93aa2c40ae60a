use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding all persisted state files.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
    /// Bounded in-memory ring for the webhook delivery log.
    #[serde(default = "d_delivery_log_cap")]
    pub delivery_log_cap: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
            delivery_log_cap: d_delivery_log_cap(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
fn d_delivery_log_cap() -> usize {
    1_000
}
