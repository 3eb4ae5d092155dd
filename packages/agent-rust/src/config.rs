//! Media-agent configuration and hot-reloadable operator overrides.
//!
//! [`AgentConfig`] is the base configuration, read once from an optional JSON
//! file. [`ConfigHandle`] layers operator overrides (keyed by the setting
//! names operators already use) on top and publishes the effective
//! configuration through an `ArcSwap`, so the scheduler and index processes
//! pick up a change on their next read without a restart.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::wait::PollBudget;

/// Operator setting names accepted by [`ConfigHandle::apply_override`].
pub mod settings {
    pub const PRUNE_PROCESS_INTERVAL_MINS: &str = "MM_CONFIG_PRUNE_PROCESS_INTERVAL_MINS";
    pub const MAINTENANCE_INTERVAL_MINUTES: &str = "MMS2_CONFIG_MM_MAINTAINENCE_INTERVAL_MINUTES";
    pub const MARK_AND_SWEEP_INTERVAL_SECONDS: &str = "DDBMarkAndSweepRunIntervalSeconds";
    pub const DISABLE_PHASE3: &str = "DedupPrunerDisablePhase3";
    pub const AF_DIFF_BATCH_SIZE: &str = "SIDBAfDiffBatchSize";

    /// Every accepted setting name.
    pub const ALL: [&str; 5] = [
        PRUNE_PROCESS_INTERVAL_MINS,
        MAINTENANCE_INTERVAL_MINUTES,
        MARK_AND_SWEEP_INTERVAL_SECONDS,
        DISABLE_PHASE3,
        AF_DIFF_BATCH_SIZE,
    ];
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Pruning cadence and phase-3 controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PruningConfig {
    /// Maintenance scheduler tick (`MM_CONFIG_PRUNE_PROCESS_INTERVAL_MINS`).
    pub prune_interval_minutes: u64,
    /// Cadence of store-age evaluation for scheduled resync.
    pub maintenance_interval_minutes: u64,
    /// Agent-wide mark-and-sweep interval (`DDBMarkAndSweepRunIntervalSeconds`).
    pub mark_and_sweep_interval_secs: u64,
    /// When set, zero-ref records accumulate and are never drained.
    pub disable_phase3: bool,
    /// Upper bound on zero-ref records reclaimed per partition per tick.
    pub zero_ref_drain_batch: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            prune_interval_minutes: 60,
            maintenance_interval_minutes: 60,
            mark_and_sweep_interval_secs: 7 * 24 * 3600,
            disable_phase3: false,
            zero_ref_drain_batch: 100_000,
        }
    }
}

impl PruningConfig {
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_minutes.max(1) * 60)
    }

    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_minutes * 60)
    }

    #[must_use]
    pub fn mark_and_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.mark_and_sweep_interval_secs)
    }
}

/// Resync and reconstruction thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResyncConfig {
    /// Archive files per AF-diff request (`SIDBAfDiffBatchSize`).
    pub af_diff_batch_size: usize,
    /// Stores not resynced for this many days are queued for validation.
    pub resync_age_threshold_days: u64,
    /// Regular reconstruction is only trusted for stores younger than this.
    pub reconstruction_validity_days: u64,
    /// Run Regular reconstruction for partitions marked for recovery.
    pub auto_reconstruct_marked_offline: bool,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            af_diff_batch_size: 500,
            resync_age_threshold_days: 30,
            reconstruction_validity_days: 45,
            auto_reconstruct_marked_offline: true,
        }
    }
}

/// Budgets for the bounded waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WaitConfig {
    pub index_shutdown_step_secs: u64,
    pub index_shutdown_timeout_secs: u64,
    pub distributor_poll_secs: u64,
    pub distributor_poll_attempts: u32,
    pub pruning_poll_secs: u64,
    pub pruning_poll_attempts: u32,
    pub zero_ref_poll_attempts: u32,
    /// Scheduler cycles to wait for a resync before giving up.
    pub resync_poll_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            index_shutdown_step_secs: 30,
            index_shutdown_timeout_secs: 600,
            distributor_poll_secs: 300,
            distributor_poll_attempts: 12,
            pruning_poll_secs: 300,
            pruning_poll_attempts: 10,
            zero_ref_poll_attempts: 10,
            resync_poll_attempts: 3,
        }
    }
}

impl WaitConfig {
    #[must_use]
    pub fn index_shutdown(&self) -> PollBudget {
        PollBudget::within(
            Duration::from_secs(self.index_shutdown_step_secs),
            Duration::from_secs(self.index_shutdown_timeout_secs),
        )
    }

    #[must_use]
    pub fn distributor_change(&self) -> PollBudget {
        PollBudget::new(
            Duration::from_secs(self.distributor_poll_secs),
            self.distributor_poll_attempts,
        )
    }

    #[must_use]
    pub fn pruning(&self) -> PollBudget {
        PollBudget::new(
            Duration::from_secs(self.pruning_poll_secs),
            self.pruning_poll_attempts,
        )
    }

    #[must_use]
    pub fn zero_ref_drain(&self) -> PollBudget {
        PollBudget::new(
            Duration::from_secs(self.pruning_poll_secs),
            self.zero_ref_poll_attempts,
        )
    }
}

/// Partition index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexConfig {
    /// How often a running index process checks that its path still exists.
    pub path_probe_interval_secs: u64,
    /// Reject partitions whose path is not an absolute, volume-backed path.
    pub require_volume_backed_paths: bool,
    pub task_channel_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path_probe_interval_secs: 30,
            require_volume_backed_paths: false,
            task_channel_capacity: 256,
        }
    }
}

impl IndexConfig {
    #[must_use]
    pub fn path_probe_interval(&self) -> Duration {
        Duration::from_secs(self.path_probe_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// Top-level configuration of one media agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Name of this host; partitions are owned by exactly one media agent.
    pub media_agent: String,
    pub pruning: PruningConfig,
    pub resync: ResyncConfig,
    pub waits: WaitConfig,
    pub index: IndexConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            media_agent: "ma1".to_string(),
            pruning: PruningConfig::default(),
            resync: ResyncConfig::default(),
            waits: WaitConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Parse` if it is not valid JSON for this schema.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Applies one operator setting to this configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownSetting` for unrecognized keys and
    /// `ConfigError::InvalidValue` for values that do not parse or are out
    /// of range.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let trimmed = value.trim();
        match key {
            settings::PRUNE_PROCESS_INTERVAL_MINS => {
                let minutes: u64 = trimmed.parse().map_err(|_| invalid())?;
                if minutes == 0 {
                    return Err(invalid());
                }
                self.pruning.prune_interval_minutes = minutes;
            }
            settings::MAINTENANCE_INTERVAL_MINUTES => {
                self.pruning.maintenance_interval_minutes =
                    trimmed.parse().map_err(|_| invalid())?;
            }
            settings::MARK_AND_SWEEP_INTERVAL_SECONDS => {
                self.pruning.mark_and_sweep_interval_secs =
                    trimmed.parse().map_err(|_| invalid())?;
            }
            settings::DISABLE_PHASE3 => {
                self.pruning.disable_phase3 = parse_flag(trimmed).ok_or_else(invalid)?;
            }
            settings::AF_DIFF_BATCH_SIZE => {
                let size: usize = trimmed.parse().map_err(|_| invalid())?;
                if size == 0 {
                    return Err(invalid());
                }
                self.resync.af_diff_batch_size = size;
            }
            _ => {
                return Err(ConfigError::UnknownSetting {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ConfigHandle
// ---------------------------------------------------------------------------

/// Shared, hot-reloadable view of the effective configuration.
#[derive(Debug)]
pub struct ConfigHandle {
    base: AgentConfig,
    overrides: Mutex<BTreeMap<String, String>>,
    current: ArcSwap<AgentConfig>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(base: AgentConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(base.clone()),
            base,
            overrides: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builds a handle from an optional JSON file, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => AgentConfig::from_file(path)?,
            None => AgentConfig::default(),
        };
        Ok(Self::new(base))
    }

    /// Snapshot of the effective configuration.
    #[must_use]
    pub fn current(&self) -> Arc<AgentConfig> {
        self.current.load_full()
    }

    /// Sets an operator override and publishes the new configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the key is unknown or the value invalid;
    /// the effective configuration is left unchanged.
    pub fn apply_override(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut overrides = self.overrides.lock();
        // Validate against a scratch copy first.
        let mut candidate = (**self.current.load()).clone();
        candidate.apply_setting(key, value)?;

        overrides.insert(key.to_string(), value.to_string());
        self.current.store(Arc::new(candidate));
        info!(setting = key, value, "operator override applied");
        Ok(())
    }

    /// Removes an override, restoring the base value for that setting.
    ///
    /// Returns `false` if no override was set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownSetting` for unrecognized keys.
    pub fn remove_override(&self, key: &str) -> Result<bool, ConfigError> {
        if !settings::ALL.contains(&key) {
            return Err(ConfigError::UnknownSetting {
                key: key.to_string(),
            });
        }
        let mut overrides = self.overrides.lock();
        if overrides.remove(key).is_none() {
            return Ok(false);
        }
        let mut rebuilt = self.base.clone();
        for (k, v) in overrides.iter() {
            rebuilt.apply_setting(k, v)?;
        }
        self.current.store(Arc::new(rebuilt));
        info!(setting = key, "operator override removed");
        Ok(true)
    }

    /// Currently applied overrides.
    #[must_use]
    pub fn overrides(&self) -> BTreeMap<String, String> {
        self.overrides.lock().clone()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(AgentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_operator_documentation() {
        let config = AgentConfig::default();
        assert_eq!(config.pruning.prune_interval(), Duration::from_secs(3600));
        assert_eq!(config.resync.af_diff_batch_size, 500);
        assert!(!config.pruning.disable_phase3);
        assert_eq!(
            config.waits.index_shutdown(),
            PollBudget::new(Duration::from_secs(30), 20)
        );
        assert_eq!(config.waits.distributor_change().max_attempts, 12);
    }

    #[test]
    fn override_is_visible_to_new_snapshots_only() {
        let handle = ConfigHandle::default();
        let before = handle.current();

        handle
            .apply_override(settings::PRUNE_PROCESS_INTERVAL_MINS, "2")
            .unwrap();

        assert_eq!(before.pruning.prune_interval_minutes, 60);
        assert_eq!(handle.current().pruning.prune_interval_minutes, 2);
    }

    #[test]
    fn disable_phase3_accepts_numeric_and_word_forms() {
        let handle = ConfigHandle::default();
        handle.apply_override(settings::DISABLE_PHASE3, "1").unwrap();
        assert!(handle.current().pruning.disable_phase3);
        handle.apply_override(settings::DISABLE_PHASE3, "false").unwrap();
        assert!(!handle.current().pruning.disable_phase3);
    }

    #[test]
    fn invalid_override_leaves_config_untouched() {
        let handle = ConfigHandle::default();
        let err = handle
            .apply_override(settings::AF_DIFF_BATCH_SIZE, "zero")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(handle
            .apply_override(settings::AF_DIFF_BATCH_SIZE, "0")
            .is_err());
        assert_eq!(handle.current().resync.af_diff_batch_size, 500);
        assert!(handle.overrides().is_empty());
    }

    #[test]
    fn unknown_setting_is_rejected() {
        let handle = ConfigHandle::default();
        assert!(matches!(
            handle.apply_override("NotASetting", "1"),
            Err(ConfigError::UnknownSetting { .. })
        ));
        assert!(handle.remove_override("NotASetting").is_err());
    }

    #[test]
    fn remove_override_restores_base_and_keeps_others() {
        let handle = ConfigHandle::default();
        handle
            .apply_override(settings::AF_DIFF_BATCH_SIZE, "10")
            .unwrap();
        handle
            .apply_override(settings::MARK_AND_SWEEP_INTERVAL_SECONDS, "120")
            .unwrap();

        assert!(handle.remove_override(settings::AF_DIFF_BATCH_SIZE).unwrap());
        assert!(!handle.remove_override(settings::AF_DIFF_BATCH_SIZE).unwrap());

        let config = handle.current();
        assert_eq!(config.resync.af_diff_batch_size, 500);
        assert_eq!(config.pruning.mark_and_sweep_interval_secs, 120);
    }

    #[test]
    fn from_file_fills_missing_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mediaAgent":"ma7","pruning":{{"pruneIntervalMinutes":5}}}}"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.media_agent, "ma7");
        assert_eq!(config.pruning.prune_interval_minutes, 5);
        assert_eq!(config.pruning.mark_and_sweep_interval_secs, 604_800);
        assert_eq!(config.resync, ResyncConfig::default());
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let handle = ConfigHandle::load(None).unwrap();
        assert_eq!(*handle.current(), AgentConfig::default());
    }

    #[test]
    fn from_file_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = AgentConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
