/// Synchroniser configuration.
/// Reads sync.json from ~/.config/teamboard/sync.json (or platform equivalent).
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Upper bound for a single store write before it counts as failed.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// How long opening a collection waits for the initial snapshot.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Pending echo fingerprints older than this are dropped.
    #[serde(default = "default_echo_ttl_secs")]
    pub echo_ttl_secs: u64,
    /// Re-insert into the source bucket when the target write of a
    /// cross-bucket move fails.
    #[serde(default = "default_true")]
    pub compensate_relocation: bool,
    /// Size of a newly created table section.
    #[serde(default = "default_table_size")]
    pub table_rows: usize,
    #[serde(default = "default_table_size")]
    pub table_cols: usize,
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_open_timeout_ms() -> u64 {
    10_000
}

fn default_echo_ttl_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_table_size() -> usize {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            echo_ttl_secs: default_echo_ttl_secs(),
            compensate_relocation: default_true(),
            table_rows: default_table_size(),
            table_cols: default_table_size(),
        }
    }
}

impl SyncConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn echo_ttl(&self) -> Duration {
        Duration::from_secs(self.echo_ttl_secs)
    }
}

/// Default config path: ~/.config/teamboard/sync.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("teamboard")
        .join("sync.json")
}

/// Load config from path. Returns defaults if the file is missing or broken.
pub fn load_config(path: &Path) -> SyncConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!(
                "[teamboard.config] Failed to parse config {}: {}",
                path.display(),
                e
            );
            SyncConfig::default()
        }),
        Err(_) => {
            log::info!(
                "[teamboard.config] No config at {}, using defaults",
                path.display()
            );
            SyncConfig::default()
        }
    }
}
