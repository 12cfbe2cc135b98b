//! Terminal configuration and operator session context.
//!
//! Configuration is plain data handed to the context at startup; the engine
//! never reads credentials on its own. The operator session is bound by the
//! host once a cashier signs in — order creation without a bound session is
//! the one fatal error in the crate (§ error taxonomy).

use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_cache_file() -> String {
    "cache.db".to_string()
}

fn default_backup_file() -> String {
    "cache-backup.db".to_string()
}

/// Static configuration of one terminal.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Base URL of the remote transactional store, e.g. `https://pos.example.com`.
    pub remote_url: String,
    pub api_key: String,
    pub terminal_id: String,
    pub branch_id: String,
    /// Directory holding the cache database, backup database and log files.
    pub data_dir: PathBuf,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
    #[serde(default = "default_backup_file")]
    pub backup_file: String,
}

impl TerminalConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read terminal config {}", path.display()))?;
        let config: TerminalConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse terminal config {}", path.display()))?;
        Ok(config)
    }
}

/// The operator identity bound to the terminal for the current shift.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub staff_id: String,
    pub staff_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.json");
        std::fs::write(
            &path,
            r#"{
                "remote_url": "https://pos.example.com",
                "api_key": "key-123",
                "terminal_id": "term-1",
                "branch_id": "branch-1",
                "data_dir": "/tmp/tillsync"
            }"#,
        )
        .unwrap();

        let config = TerminalConfig::load(&path).unwrap();
        assert_eq!(config.sync_interval_secs, 30);
        assert_eq!(config.cache_file, "cache.db");
        assert_eq!(config.backup_file, "cache-backup.db");
    }

    #[test]
    fn test_load_config_missing_file_has_context() {
        let err = TerminalConfig::load(Path::new("/nonexistent/terminal.json")).unwrap_err();
        assert!(err.to_string().contains("terminal config"));
    }
}
