use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(String),
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidOverride {
        key: String,
        value: String,
        reason: String,
    },
}

/// Where overrides come from. The process environment in production, a
/// plain map in tests.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug)]
pub struct EnvConfigSource {
    env_file: Option<PathBuf>,
}

impl EnvConfigSource {
    /// Reads the process environment, after merging `env_file` into it when present.
    pub fn new(env_file: Option<PathBuf>) -> Self {
        match &env_file {
            Some(file) if file.exists() => match dotenvy::from_path(file) {
                Ok(()) => info!("Loaded .env from {}", file.display()),
                Err(e) => debug!("could not load .env from {}: {e}", file.display()),
            },
            Some(file) => debug!("no .env at {}", file.display()),
            None => {
                dotenvy::dotenv().ok();
            }
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }
}

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapConfigSource {
    map: DashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.value().clone())
    }
}

/// Runtime settings for one orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub nodes_dir: PathBuf,
    pub manifest_names: Vec<String>,
    pub scan_interval_ms: u64,
    pub event_queue_capacity: usize,
    pub health_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub call_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_restart_count: u32,
    pub auto_restart: bool,
    pub socket_dir: PathBuf,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            nodes_dir: PathBuf::from(".nodeflow/nodes"),
            manifest_names: vec!["_.yaml".into(), "manifest.yaml".into(), "node.yaml".into()],
            scan_interval_ms: 10_000,
            event_queue_capacity: 256,
            health_interval_ms: 30_000,
            stop_grace_ms: 2_000,
            call_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            retry_backoff_ms: 100,
            max_restart_count: 3,
            auto_restart: false,
            socket_dir: PathBuf::from("/tmp"),
            log_level: "info".into(),
            log_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults, then the YAML file at `path`, then `NODEFLOW_*` overrides
    /// from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(&EnvConfigSource::new(Some(PathBuf::from(".env"))))?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_bw::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn apply_overrides(&mut self, source: &dyn ConfigSource) -> Result<(), ConfigError> {
        if let Some(v) = source.get("NODEFLOW_NODES_DIR") {
            self.nodes_dir = PathBuf::from(v);
        }
        if let Some(v) = source.get("NODEFLOW_SOCKET_DIR") {
            self.socket_dir = PathBuf::from(v);
        }
        if let Some(v) = source.get("NODEFLOW_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = source.get("NODEFLOW_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        override_number(source, "NODEFLOW_SCAN_INTERVAL_MS", &mut self.scan_interval_ms)?;
        override_number(source, "NODEFLOW_HEALTH_INTERVAL_MS", &mut self.health_interval_ms)?;
        override_number(source, "NODEFLOW_STOP_GRACE_MS", &mut self.stop_grace_ms)?;
        override_number(source, "NODEFLOW_CALL_TIMEOUT_MS", &mut self.call_timeout_ms)?;
        if let Some(v) = source.get("NODEFLOW_AUTO_RESTART") {
            self.auto_restart = match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        key: "NODEFLOW_AUTO_RESTART".into(),
                        value: v,
                        reason: "expected a boolean".into(),
                    });
                }
            };
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn override_number(source: &dyn ConfigSource, key: &str, slot: &mut u64) -> Result<(), ConfigError> {
    if let Some(v) = source.get(key) {
        *slot = v.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: v.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.scan_interval(), Duration::from_secs(10));
        assert_eq!(c.health_interval(), Duration::from_secs(30));
        assert_eq!(c.stop_grace(), Duration::from_secs(2));
        assert_eq!(c.call_timeout(), Duration::from_secs(30));
        assert_eq!(c.manifest_names.len(), 3);
        assert!(!c.auto_restart);
    }

    #[test]
    fn yaml_file_overrides_only_named_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodeflow.yaml");
        fs::write(&path, "nodes_dir: /srv/nodes\nscan_interval_ms: 500\n").unwrap();

        let c = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(c.nodes_dir, PathBuf::from("/srv/nodes"));
        assert_eq!(c.scan_interval_ms, 500);
        assert_eq!(c.stop_grace_ms, 2_000);
    }

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(OrchestratorConfig::from_yaml_str("  \n").unwrap(), OrchestratorConfig::default());
    }

    #[test]
    fn overrides_apply_and_reject_garbage() {
        let src = MapConfigSource::new();
        src.set("NODEFLOW_CALL_TIMEOUT_MS", "1500");
        src.set("NODEFLOW_AUTO_RESTART", "yes");
        src.set("NODEFLOW_NODES_DIR", "/opt/nodes");

        let mut c = OrchestratorConfig::default();
        c.apply_overrides(&src).unwrap();
        assert_eq!(c.call_timeout(), Duration::from_millis(1500));
        assert!(c.auto_restart);
        assert_eq!(c.nodes_dir, PathBuf::from("/opt/nodes"));

        src.set("NODEFLOW_STOP_GRACE_MS", "soon");
        let err = c.apply_overrides(&src).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { ref key, .. } if key == "NODEFLOW_STOP_GRACE_MS"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let err = OrchestratorConfig::from_file(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
