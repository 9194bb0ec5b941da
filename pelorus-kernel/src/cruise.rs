/**
 * CRUISE DEFINITION - Declarative logger/config/mode model for one voyage
 *
 * ROLE:
 * Holds the full set of loggers, named pipeline configs and operating modes
 * for a deployment. Loaded as a unit from YAML or JSON, validated as a whole,
 * and replaced atomically on reload (never merged field by field).
 *
 * VALIDATION:
 * Every broken cross-reference is collected before failing, so an operator
 * fixing a definition sees the complete list in one pass, not one error per
 * reload attempt.
 */

use crate::pipeline::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CruiseError {
    #[error("definition validation failed:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
    #[error("failed to parse definition: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CruiseDefinition {
    /// Optional free-form identifier for the voyage (shown in status output).
    #[serde(default)]
    pub cruise_id: Option<String>,
    /// logger name -> configs selectable for that logger, in menu order.
    pub loggers: HashMap<String, Vec<String>>,
    /// config name -> pipeline specification.
    pub configs: HashMap<String, LoggerConfig>,
    /// mode name -> (logger name -> config name), one config per logger.
    pub modes: HashMap<String, HashMap<String, String>>,
    pub default_mode: String,
}

impl CruiseDefinition {
    /// Checks every cross-reference in the definition, returning the complete
    /// list of broken ones rather than the first.
    pub fn validate(&self) -> Result<(), CruiseError> {
        let mut problems = Vec::new();

        if !self.modes.contains_key(&self.default_mode) {
            problems.push(format!("default_mode '{}' is not a defined mode", self.default_mode));
        }

        for (logger, config_names) in &self.loggers {
            for name in config_names {
                if !self.configs.contains_key(name) {
                    problems.push(format!(
                        "logger '{logger}' lists unknown config '{name}'"
                    ));
                }
            }
        }

        for (mode, assignments) in &self.modes {
            for (logger, config_name) in assignments {
                if !self.loggers.contains_key(logger) {
                    problems.push(format!("mode '{mode}' references unknown logger '{logger}'"));
                }
                if !self.configs.contains_key(config_name) {
                    problems.push(format!(
                        "mode '{mode}' assigns unknown config '{config_name}' to logger '{logger}'"
                    ));
                }
            }
            // A mode is a complete assignment; a logger it omits has no target.
            for logger in self.loggers.keys() {
                if !assignments.contains_key(logger) {
                    problems.push(format!("mode '{mode}' has no config for logger '{logger}'"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            problems.sort();
            Err(CruiseError::Validation(problems))
        }
    }

    /// Parses a definition from text, accepting YAML or JSON, and validates it.
    pub fn from_str(text: &str) -> Result<Self, CruiseError> {
        let def: CruiseDefinition =
            serde_yaml::from_str(text).map_err(|e| CruiseError::Parse(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    /// Loads and validates a definition file (.yaml/.yml/.json).
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, CruiseError> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_str(&text)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::pipeline::{ReaderStage, WriterStage};
    use std::io::Write;

    /// Two-logger definition used across the kernel tests: gyro + wind, modes
    /// "off" (both placeholders) and "underway" (both running).
    pub fn sample_definition() -> CruiseDefinition {
        let mut configs = HashMap::new();
        configs.insert("off".to_string(), LoggerConfig::default());
        configs.insert(
            "gyro->file".to_string(),
            LoggerConfig {
                readers: vec![ReaderStage::Udp { port: 6224 }],
                writers: vec![WriterStage::File { path: "/data/gyro".into() }],
                ..Default::default()
            },
        );
        configs.insert(
            "wind->file".to_string(),
            LoggerConfig {
                readers: vec![ReaderStage::Udp { port: 6225 }],
                writers: vec![WriterStage::File { path: "/data/wind".into() }],
                ..Default::default()
            },
        );

        let mut loggers = HashMap::new();
        loggers.insert("gyro".to_string(), vec!["off".into(), "gyro->file".into()]);
        loggers.insert("wind".to_string(), vec!["off".into(), "wind->file".into()]);

        let mut off = HashMap::new();
        off.insert("gyro".to_string(), "off".to_string());
        off.insert("wind".to_string(), "off".to_string());
        let mut underway = HashMap::new();
        underway.insert("gyro".to_string(), "gyro->file".to_string());
        underway.insert("wind".to_string(), "wind->file".to_string());

        let mut modes = HashMap::new();
        modes.insert("off".to_string(), off);
        modes.insert("underway".to_string(), underway);

        CruiseDefinition {
            cruise_id: Some("NBP1406".into()),
            loggers,
            configs,
            modes,
            default_mode: "off".to_string(),
        }
    }

    #[test]
    fn test_valid_definition_passes() {
        sample_definition().validate().unwrap();
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut def = sample_definition();
        def.configs.remove("wind->file");
        def.modes
            .get_mut("underway")
            .unwrap()
            .insert("fantail_cam".to_string(), "cam->file".to_string());
        def.default_mode = "port".to_string();

        let err = def.validate().unwrap_err();
        let CruiseError::Validation(problems) = err else {
            panic!("expected validation error");
        };
        // Missing config (listed + assigned), unknown logger, unknown config
        // assigned to it, and bad default_mode must all be reported at once.
        assert!(problems.iter().any(|p| p.contains("default_mode 'port'")));
        assert!(problems.iter().any(|p| p.contains("unknown logger 'fantail_cam'")));
        assert!(problems.iter().any(|p| p.contains("unknown config 'cam->file'")));
        assert!(problems.iter().any(|p| p.contains("logger 'wind' lists unknown config")));
        assert!(problems.iter().any(|p| p.contains("assigns unknown config 'wind->file'")));
    }

    #[test]
    fn test_incomplete_mode_is_rejected() {
        let mut def = sample_definition();
        def.modes.get_mut("underway").unwrap().remove("wind");
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("no config for logger 'wind'"));
    }

    #[tokio::test]
    async fn test_load_yaml_round_trip() {
        let def = sample_definition();
        let yaml = serde_yaml::to_string(&def).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let loaded = CruiseDefinition::load(file.path()).await.unwrap();
        assert_eq!(loaded.default_mode, def.default_mode);
        assert_eq!(loaded.configs, def.configs);
        assert_eq!(loaded.modes, def.modes);
    }

    #[test]
    fn test_json_definition_is_accepted() {
        // serde_yaml parses JSON as a YAML subset, so .json files load too.
        let json = serde_json::to_string(&sample_definition()).unwrap();
        let def = CruiseDefinition::from_str(&json).unwrap();
        assert_eq!(def.default_mode, "off");
    }
}
