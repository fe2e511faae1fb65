//! Config loading and persistence.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Limits;
use crate::oplog::OpLogError;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub sweep: SweepConfig,
    pub oplog: OplogConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Background sweep period in milliseconds.
    pub interval_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OplogConfig {
    /// Name of the out-of-band notify channel.
    pub channel: String,
    /// Watcher fallback poll period when no notification arrives.
    pub poll_interval_ms: u64,
    /// Steady-state trim check period (jitter applied per wake).
    pub trim_interval_ms: u64,
    /// Operations younger than this are never trimmed.
    pub trim_min_age_ms: u64,
    pub notify_backoff_base_ms: u64,
    pub notify_backoff_max_ms: u64,
    pub notify_max_attempts: u32,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            channel: "ripple_ops".to_string(),
            poll_interval_ms: 5_000,
            trim_interval_ms: 30_000,
            trim_min_age_ms: 600_000,
            notify_backoff_base_ms: 250,
            notify_backoff_max_ms: 5_000,
            notify_max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a replica read waits for a resync before giving up.
    pub read_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            read_timeout_ms: 5_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.oplog.channel.is_empty() {
            return Err(config_error("oplog.channel must not be empty".to_string()));
        }
        if self.sweep.interval_ms == 0 {
            return Err(config_error("sweep.interval_ms must be > 0".to_string()));
        }
        if self.oplog.poll_interval_ms == 0 {
            return Err(config_error(
                "oplog.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.oplog.notify_backoff_base_ms > self.oplog.notify_backoff_max_ms {
            return Err(config_error(
                "oplog.notify_backoff_base_ms exceeds notify_backoff_max_ms".to_string(),
            ));
        }
        if self.replication.backoff_base_ms > self.replication.backoff_max_ms {
            return Err(config_error(
                "replication.backoff_base_ms exceeds backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    let cfg: Config = toml::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_or_init(path: &Path) -> Config {
    if path.exists() {
        match load(path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(cfg)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| config_error("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), data)
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> Error {
    Error::OpLog(OpLogError::ConfigInvalid { reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.oplog.channel = "custom_ops".to_string();
        cfg.oplog.poll_interval_ms = 123;
        cfg.replication.backoff_max_ms = 777;

        write_config(&path, &cfg).expect("write config");
        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.oplog.channel, "custom_ops");
        assert_eq!(loaded.oplog.poll_interval_ms, 123);
        assert_eq!(loaded.replication.backoff_max_ms, 777);
        assert_eq!(loaded.limits, Limits::default());
    }

    #[test]
    fn load_or_init_writes_defaults_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let cfg = load_or_init(&path);
        assert!(path.exists());
        assert_eq!(cfg.oplog.channel, "ripple_ops");

        let reloaded = load_or_init(&path);
        assert_eq!(reloaded.sweep.interval_ms, cfg.sweep.interval_ms);
    }

    #[test]
    fn validation_rejects_inverted_backoff() {
        let mut cfg = Config::default();
        cfg.oplog.notify_backoff_base_ms = 10_000;
        assert!(cfg.validate().is_err());
    }
}
