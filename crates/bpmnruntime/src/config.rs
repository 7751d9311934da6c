use bpmncore::UserId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tenant_id: u64,
    /// Work items processed concurrently
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    pub timer_sweep_interval_ms: u64,
    /// Requeues allowed for an item that keeps losing compare-and-set races
    pub conflict_retry_limit: u32,
    /// User recorded for work the engine does on its own behalf
    pub system_user_id: UserId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tenant_id: 1,
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            timer_sweep_interval_ms: 1000,
            conflict_retry_limit: 16,
            system_user_id: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Defaults, then the optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|var| std::env::var(var).ok())
    }

    /// `BPMN_TENANT_ID`, `BPMN_MAX_PARALLEL_NODES` and `BPMN_TIMER_SWEEP_MS`
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = parse_env(&lookup, "BPMN_TENANT_ID")? {
            self.tenant_id = value;
        }
        if let Some(value) = parse_env(&lookup, "BPMN_MAX_PARALLEL_NODES")? {
            self.max_parallel_nodes = value;
        }
        if let Some(value) = parse_env(&lookup, "BPMN_TIMER_SWEEP_MS")? {
            self.timer_sweep_interval_ms = value;
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_parallel_nodes": 4}"#).unwrap();
        assert_eq!(config.max_parallel_nodes, 4);
        assert_eq!(config.event_buffer_size, 1000);
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default()
            .with_env_overrides(|var| match var {
                "BPMN_TENANT_ID" => Some("7".to_string()),
                "BPMN_TIMER_SWEEP_MS" => Some("250".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.tenant_id, 7);
        assert_eq!(config.timer_sweep_interval_ms, 250);
        assert_eq!(config.max_parallel_nodes, 10);

        let err = EngineConfig::default()
            .with_env_overrides(|var| (var == "BPMN_MAX_PARALLEL_NODES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
