//! Configuration for the Kira engine, loaded from `kira.toml`.
//!
//! Every section carries `#[serde(default)]` so a missing or partial
//! file degrades to sensible defaults instead of failing startup.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root directory of the Markdown vault.
    pub root: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: "./vault".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// IANA zone used for civil day/week windows (storage stays UTC).
    pub timezone: String,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Per-entity advisory lock acquisition budget.
    pub lock_timeout_secs: u64,
    /// Normalized title similarity above which two entities are reported
    /// as near-duplicates.  Advisory only.
    pub near_duplicate_threshold: f64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 10,
            near_duplicate_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Grace buffer that absorbs mildly out-of-order arrival.  Clamped
    /// to the 3–10s range at load time.
    pub grace_secs: u64,
    /// Delivery attempts before an event is dead-lettered.
    pub max_attempts: u32,
    /// Initial retry backoff; doubles per attempt with ±20% jitter.
    pub retry_initial_ms: u64,
    /// Wall-clock budget per handler invocation.
    pub handler_budget_secs: u64,
    /// How long `drain()` waits for in-flight handlers on shutdown.
    pub drain_deadline_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            grace_secs: 5,
            max_attempts: 5,
            retry_initial_ms: 1_000,
            handler_budget_secs: 60,
            drain_deadline_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Days a fingerprint is remembered before TTL purge.
    pub ttl_days: i64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Label for the mirrored remote (ledger key prefix, envelope source).
    pub source: String,
    pub pull_interval_secs: u64,
    /// Tie-break rank when latest-wins timestamps are equal; lower wins.
    pub source_priority: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: "calendar".to_string(),
            pull_interval_secs: 300,
            source_priority: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    /// Local hour (in `time.timezone`) at which the daily rollup runs.
    pub daily_hour: u8,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self { daily_hour: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub time: TimeConfig,
    pub host: HostConfig,
    pub bus: BusConfig,
    pub idempotency: IdempotencyConfig,
    pub sync: SyncConfig,
    pub rollup: RollupConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("KIRA_VAULT_ROOT") {
            if !value.is_empty() {
                config.vault.root = value;
            }
        }

        config.bus.grace_secs = config.bus.grace_secs.clamp(3, 10);
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_expectations() {
        let config = AppConfig::default();
        assert_eq!(config.host.lock_timeout_secs, 10);
        assert_eq!(config.bus.grace_secs, 5);
        assert_eq!(config.bus.max_attempts, 5);
        assert_eq!(config.idempotency.ttl_days, 30);
        assert_eq!(config.time.timezone, "UTC");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("kira.toml")).unwrap();
        assert_eq!(config.vault.root, "./vault");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kira.toml");
        fs::write(&path, "[time]\ntimezone = \"Europe/Brussels\"\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.time.timezone, "Europe/Brussels");
        assert_eq!(config.host.lock_timeout_secs, 10);
    }

    #[test]
    fn grace_is_clamped_to_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kira.toml");
        fs::write(&path, "[bus]\ngrace_secs = 60\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.bus.grace_secs, 10);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kira.toml");
        let mut config = AppConfig::default();
        config.sync.enabled = true;
        config.sync.source = "caldav".to_string();
        config.save_to(&path).unwrap();
        let back = AppConfig::load_from(&path).unwrap();
        assert!(back.sync.enabled);
        assert_eq!(back.sync.source, "caldav");
    }
}
