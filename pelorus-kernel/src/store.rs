/**
 * CONFIG STORE - Versioned holder of the active cruise definition
 *
 * ROLE:
 * Exactly one definition is active at a time. It is held as an immutable
 * Arc snapshot and swapped atomically on reload, so readers never observe a
 * partially-applied definition. Every snapshot carries a version number;
 * mode changes computed against a superseded version are rejected instead of
 * being silently applied to the new definition.
 */

use crate::cruise::CruiseDefinition;
use crate::pipeline::LoggerConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown mode: {0}")]
    UnknownMode(String),
    #[error("unknown logger: {0}")]
    UnknownLogger(String),
    #[error("unknown config: {0}")]
    UnknownConfig(String),
    #[error("config '{config}' is not selectable for logger '{logger}'")]
    ConfigNotForLogger { logger: String, config: String },
    #[error("definition version {requested} superseded by {current}")]
    StaleDefinition { requested: u64, current: u64 },
}

/// Immutable view of the active definition at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub active_mode: String,
    pub definition: Arc<CruiseDefinition>,
}

/// Resolved target for one logger: the config name plus its content, so the
/// manager can compare by content across reloads, not just by name.
#[derive(Debug, Clone)]
pub struct LoggerTarget {
    pub config_name: String,
    pub config: LoggerConfig,
}

struct Inner {
    version: u64,
    active_mode: String,
    definition: Arc<CruiseDefinition>,
}

pub struct ConfigStore {
    inner: Mutex<Inner>,
}

impl ConfigStore {
    pub fn new(definition: CruiseDefinition) -> Self {
        let active_mode = definition.default_mode.clone();
        Self {
            inner: Mutex::new(Inner {
                version: 1,
                active_mode,
                definition: Arc::new(definition),
            }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            version: inner.version,
            active_mode: inner.active_mode.clone(),
            definition: inner.definition.clone(),
        }
    }

    /// Replaces the active definition atomically and bumps the version.
    /// The active mode carries over when the new definition still has it,
    /// otherwise it falls back to the new default.
    pub fn replace(&self, definition: CruiseDefinition) -> Snapshot {
        let mut inner = self.inner.lock();
        if !definition.modes.contains_key(&inner.active_mode) {
            inner.active_mode = definition.default_mode.clone();
        }
        inner.version += 1;
        inner.definition = Arc::new(definition);
        Snapshot {
            version: inner.version,
            active_mode: inner.active_mode.clone(),
            definition: inner.definition.clone(),
        }
    }

    /// Computes the per-logger target configs for a mode and records it as
    /// active. `version` must match the snapshot the caller planned against.
    pub fn set_mode(
        &self,
        version: u64,
        mode: &str,
    ) -> Result<HashMap<String, LoggerTarget>, StoreError> {
        let mut inner = self.inner.lock();
        if inner.version != version {
            return Err(StoreError::StaleDefinition {
                requested: version,
                current: inner.version,
            });
        }
        let targets = resolve_mode(&inner.definition, mode)?;
        inner.active_mode = mode.to_string();
        Ok(targets)
    }

    /// Resolves a single logger's target config without touching the active
    /// mode, for manual per-logger overrides.
    pub fn resolve_logger_config(
        &self,
        version: u64,
        logger: &str,
        config_name: &str,
    ) -> Result<LoggerTarget, StoreError> {
        let inner = self.inner.lock();
        if inner.version != version {
            return Err(StoreError::StaleDefinition {
                requested: version,
                current: inner.version,
            });
        }
        let def = &inner.definition;
        let selectable = def
            .loggers
            .get(logger)
            .ok_or_else(|| StoreError::UnknownLogger(logger.to_string()))?;
        let config = def
            .configs
            .get(config_name)
            .ok_or_else(|| StoreError::UnknownConfig(config_name.to_string()))?;
        if !selectable.iter().any(|c| c == config_name) {
            return Err(StoreError::ConfigNotForLogger {
                logger: logger.to_string(),
                config: config_name.to_string(),
            });
        }
        Ok(LoggerTarget {
            config_name: config_name.to_string(),
            config: config.clone(),
        })
    }
}

/// Resolves every logger's target for a mode from a definition snapshot.
pub fn resolve_mode(
    definition: &CruiseDefinition,
    mode: &str,
) -> Result<HashMap<String, LoggerTarget>, StoreError> {
    let assignments = definition
        .modes
        .get(mode)
        .ok_or_else(|| StoreError::UnknownMode(mode.to_string()))?;
    let mut targets = HashMap::new();
    for (logger, config_name) in assignments {
        let config = definition
            .configs
            .get(config_name)
            .ok_or_else(|| StoreError::UnknownConfig(config_name.clone()))?;
        targets.insert(
            logger.clone(),
            LoggerTarget {
                config_name: config_name.clone(),
                config: config.clone(),
            },
        );
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cruise::tests::sample_definition;

    #[test]
    fn test_snapshot_round_trips_definition() {
        let def = sample_definition();
        let store = ConfigStore::new(def.clone());
        let snap = store.snapshot();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.active_mode, "off");
        assert_eq!(snap.definition.configs, def.configs);
        assert_eq!(snap.definition.modes, def.modes);
    }

    #[test]
    fn test_set_mode_resolves_targets() {
        let store = ConfigStore::new(sample_definition());
        let snap = store.snapshot();
        let targets = store.set_mode(snap.version, "underway").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["gyro"].config_name, "gyro->file");
        assert!(targets["gyro"].config.is_runnable());
        assert_eq!(store.snapshot().active_mode, "underway");
    }

    #[test]
    fn test_unknown_mode_is_rejected_without_state_change() {
        let store = ConfigStore::new(sample_definition());
        let snap = store.snapshot();
        let err = store.set_mode(snap.version, "drydock").unwrap_err();
        assert!(matches!(err, StoreError::UnknownMode(_)));
        assert_eq!(store.snapshot().active_mode, "off");
    }

    #[test]
    fn test_stale_set_mode_is_rejected_after_reload() {
        let store = ConfigStore::new(sample_definition());
        let old = store.snapshot();
        store.replace(sample_definition());
        let err = store.set_mode(old.version, "underway").unwrap_err();
        assert!(matches!(err, StoreError::StaleDefinition { requested: 1, current: 2 }));
    }

    #[test]
    fn test_replace_falls_back_to_default_mode() {
        let store = ConfigStore::new(sample_definition());
        let snap = store.snapshot();
        store.set_mode(snap.version, "underway").unwrap();

        let mut next = sample_definition();
        next.modes.remove("underway");
        let snap = store.replace(next);
        assert_eq!(snap.version, 2);
        assert_eq!(snap.active_mode, "off");
    }

    #[test]
    fn test_resolve_logger_config_enforces_menu() {
        let store = ConfigStore::new(sample_definition());
        let v = store.snapshot().version;
        assert!(store.resolve_logger_config(v, "gyro", "gyro->file").is_ok());
        let err = store.resolve_logger_config(v, "gyro", "wind->file").unwrap_err();
        assert!(matches!(err, StoreError::ConfigNotForLogger { .. }));
        let err = store.resolve_logger_config(v, "anemometer", "off").unwrap_err();
        assert!(matches!(err, StoreError::UnknownLogger(_)));
    }
}
