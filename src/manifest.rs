use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use node_protocol::envelope::{PROTOCOL_NAME, PROTOCOL_VERSION};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest: {0}")]
    Parse(String),
    #[error("could not serialize manifest: {0}")]
    Serialize(String),
    #[error("invalid manifest for `{id}`: {}", errors.join("; "))]
    Invalid { id: String, errors: Vec<String> },
}

/// Declarative description of one node: who it is, how to launch it, and
/// where to reach it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct NodeManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Registry type key. Falls back to `id`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub communication: CommunicationSpec,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub dependencies: DependencySpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeSpec {
    #[serde(rename = "type", default = "default_runtime_type")]
    pub kind: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            kind: default_runtime_type(),
            command: String::new(),
            args: vec![],
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommunicationSpec {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_protocol_version")]
    pub version: String,
    #[serde(default)]
    pub socket_path: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

impl Default for CommunicationSpec {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            version: default_protocol_version(),
            socket_path: String::new(),
            methods: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_port_type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_port_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceSpec {
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
            timeout_seconds: default_timeout_seconds(),
            max_instances: default_max_instances(),
        }
    }
}

impl ResourceSpec {
    pub fn memory_mb(&self) -> Option<u64> {
        parse_memory_mb(&self.memory)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct DependencySpec {
    #[serde(default)]
    pub system: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".into()
}
fn default_runtime_type() -> String {
    "executable".into()
}
fn default_protocol() -> String {
    PROTOCOL_NAME.into()
}
fn default_protocol_version() -> String {
    PROTOCOL_VERSION.into()
}
fn default_port_type() -> String {
    "string".into()
}
fn default_memory() -> String {
    "128MB".into()
}
fn default_cpu() -> String {
    "100m".into()
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_max_instances() -> u32 {
    1
}

static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*(KB|MB|GB)?\s*$").expect("memory pattern compiles"));

/// `512KB`, `128MB`, `1GB` or a bare number of megabytes.
pub fn parse_memory_mb(text: &str) -> Option<u64> {
    let upper = text.to_ascii_uppercase();
    let caps = MEMORY_RE.captures(&upper)?;
    let value: u64 = caps[1].parse().ok()?;
    match caps.get(2).map(|m| m.as_str()) {
        Some("GB") => value.checked_mul(1024),
        Some("KB") => Some(value / 1024),
        _ => Some(value),
    }
}

/// Ids end up in file names, so they may not carry path syntax.
pub fn is_safe_node_id(id: &str) -> bool {
    !id.contains(['/', '\\', '\0']) && !id.contains("..")
}

/// Endpoint every node gets when its manifest leaves `socket_path` empty.
pub fn default_socket_path(socket_dir: &Path, node_id: &str) -> PathBuf {
    socket_dir.join(format!("nodeflow-node-{node_id}.sock"))
}

impl NodeManifest {
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        serde_yaml_bw::from_str(text).map_err(|e| ManifestError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        serde_yaml_bw::to_string(self).map_err(|e| ManifestError::Serialize(e.to_string()))
    }

    /// Every missing or unsupported required field, in a fixed order.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("Missing required field: id".to_string());
        } else if !is_safe_node_id(&self.id) {
            errors.push(format!("Invalid node id: {}", self.id));
        }
        if self.name.trim().is_empty() {
            errors.push("Missing required field: name".to_string());
        }
        if self.runtime.command.trim().is_empty() {
            errors.push("Missing required field: runtime.command".to_string());
        }
        if self.communication.protocol != PROTOCOL_NAME {
            errors.push(format!(
                "Unsupported communication protocol: {}",
                self.communication.protocol
            ));
        }
        if self.communication.socket_path.trim().is_empty() {
            errors.push("Missing required field: communication.socket_path".to_string());
        }
        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    pub fn ensure_valid(&self) -> Result<(), ManifestError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Invalid { id: self.id.clone(), errors })
        }
    }

    pub fn node_type(&self) -> &str {
        match &self.node_type {
            Some(t) if !t.is_empty() => t,
            _ => &self.id,
        }
    }

    /// Fill an empty `socket_path` with the deterministic per-node endpoint.
    pub fn resolve_socket_path(&mut self, socket_dir: &Path) {
        if self.communication.socket_path.trim().is_empty() && !self.id.is_empty() && is_safe_node_id(&self.id) {
            self.communication.socket_path =
                default_socket_path(socket_dir, &self.id).to_string_lossy().into_owned();
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.communication.socket_path)
    }

    pub fn is_executable(&self) -> bool {
        self.runtime.kind == "executable"
    }

    /// Working directory for the child. Relative paths are taken from the
    /// directory holding the manifest.
    pub fn working_dir(&self, node_dir: &Path) -> PathBuf {
        match &self.runtime.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => node_dir.join(dir),
            None => node_dir.to_path_buf(),
        }
    }

    pub fn supports_method(&self, method: &str) -> bool {
        self.communication.methods.is_empty() || self.communication.methods.iter().any(|m| m == method)
    }
}
