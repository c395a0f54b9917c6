//! Node configuration.
//!
//! [`NodeConfig`] carries the data directory, logging options, scheduler tick
//! interval, reorg bound and the nested [`DownloadConfig`]. It is assembled
//! from built-in defaults, an optional TOML file, and `BLOCKSYNC__*`
//! environment variables (later sources win), then validated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use blocksync_core::constants::MAX_REORG_DEPTH;
use blocksync_download::DownloadConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix of environment variables that override configuration values.
/// Nested keys are separated by `__`, e.g. `BLOCKSYNC__DOWNLOAD__BATCH_SIZE`.
pub const ENV_PREFIX: &str = "BLOCKSYNC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "debug", "blocksync_download=trace").
    pub log_level: String,
    /// Log output format: "text" or "json".
    pub log_format: String,
    /// Upper bound on the time between two scheduler passes.
    pub tick_interval_ms: u64,
    /// Maximum number of blocks unwound when loading outputs for a block on
    /// an alternate branch.
    pub max_reorg_depth: usize,
    pub download: DownloadConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blocksync");

        Self {
            data_dir,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            tick_interval_ms: 1_000,
            max_reorg_depth: MAX_REORG_DEPTH,
            download: DownloadConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Layer defaults, the TOML file at `path` (when given) and the
    /// environment, then validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&NodeConfig::default())
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml).required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let cfg: NodeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject limits the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let download = &self.download;
        if download.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid("download.max_concurrent_downloads must be > 0".into()));
        }
        if download.max_concurrent_downloads_per_peer == 0 {
            return Err(ConfigError::Invalid(
                "download.max_concurrent_downloads_per_peer must be > 0".into(),
            ));
        }
        if download.max_concurrent_downloads_per_peer > download.max_concurrent_downloads {
            return Err(ConfigError::Invalid(format!(
                "download.max_concurrent_downloads_per_peer ({}) exceeds max_concurrent_downloads ({})",
                download.max_concurrent_downloads_per_peer, download.max_concurrent_downloads
            )));
        }
        if download.batch_size == 0 {
            return Err(ConfigError::Invalid("download.batch_size must be > 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be > 0".into()));
        }
        if self.max_reorg_depth == 0 {
            return Err(ConfigError::Invalid("max_reorg_depth must be > 0".into()));
        }
        Ok(())
    }

    /// Path to the RocksDB pending-block directory.
    pub fn pending_blocks_path(&self) -> PathBuf {
        self.data_dir.join("pending_blocks")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_log_level_is_info() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.log_format, "text");
    }

    #[test]
    fn default_data_dir_ends_with_blocksync() {
        let cfg = NodeConfig::default();
        assert!(
            cfg.data_dir.ends_with("blocksync"),
            "data_dir should end with 'blocksync': {:?}",
            cfg.data_dir
        );
    }

    #[test]
    fn default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
        assert_eq!(NodeConfig::default().max_reorg_depth, 288);
    }

    #[test]
    fn pending_blocks_path_appends_directory() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/blocksync-test"),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.pending_blocks_path(), PathBuf::from("/tmp/blocksync-test/pending_blocks"));
    }

    #[test]
    fn tick_interval_in_millis() {
        let cfg = NodeConfig {
            tick_interval_ms: 250,
            ..NodeConfig::default()
        };
        assert_eq!(cfg.tick_interval(), Duration::from_millis(250));
    }

    #[test]
    fn zero_global_cap_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.download.max_concurrent_downloads = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn per_peer_cap_above_global_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.download.max_concurrent_downloads = 2;
        cfg.download.max_concurrent_downloads_per_peer = 3;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn zero_tick_interval_rejected() {
        let cfg = NodeConfig {
            tick_interval_ms: 0,
            ..NodeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocksync.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\ntick_interval_ms = 50\n\n[download]\nmax_concurrent_downloads = 16\nalternate_chain_download = false"
        )
        .unwrap();

        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.tick_interval_ms, 50);
        assert_eq!(cfg.download.max_concurrent_downloads, 16);
        assert!(!cfg.download.alternate_chain_download);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.download.max_concurrent_downloads_per_peer, 2);
        assert_eq!(cfg.max_reorg_depth, 288);
    }

    #[test]
    fn load_rejects_invalid_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[download]\nmax_concurrent_downloads_per_peer = 0\n").unwrap();
        assert!(matches!(NodeConfig::load(Some(&path)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = NodeConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
