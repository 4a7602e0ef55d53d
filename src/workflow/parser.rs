use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, warn};

use super::{WorkflowError, definition::WorkflowDefinition};

static NODE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").expect("pattern compiles"));
static NODE_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.:-]*$").expect("pattern compiles"));
static PARAM_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("pattern compiles"));
static WHOLE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\$\{([^}]+)\}$").expect("pattern compiles"));

const MAX_NODE_ID_LEN: usize = 100;

pub fn is_valid_node_id(id: &str) -> bool {
    id.len() <= MAX_NODE_ID_LEN && NODE_ID.is_match(id)
}

pub fn is_valid_node_type(node_type: &str) -> bool {
    NODE_TYPE.is_match(node_type)
}

/// Names referenced as `${name}` in `text`, in order of appearance.
pub fn parameter_references(text: &str) -> Vec<String> {
    PARAM_REF.captures_iter(text).map(|c| c[1].to_string()).collect()
}

/// Replace `${name}` references inside `value` from `vars`.
///
/// A string that is exactly one reference takes the variable's value with its
/// type. References embedded in longer strings are interpolated as text.
/// Unknown names are left untouched.
pub fn substitute_parameters(value: &Value, vars: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = WHOLE_REF.captures(s) {
                if let Some(v) = vars.get(&caps[1]) {
                    return v.clone();
                }
            }
            let replaced = PARAM_REF.replace_all(s, |caps: &Captures| match vars.get(&caps[1]) {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_parameters(v, vars)).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute_parameters(v, vars))).collect())
        }
        other => other.clone(),
    }
}

fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(parameter_references(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Yaml,
    Json,
}

impl WorkflowFormat {
    /// `.json` is JSON, anything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => WorkflowFormat::Json,
            _ => WorkflowFormat::Yaml,
        }
    }
}

/// Reads workflow files and checks them beyond what serde enforces.
///
/// Errors block the parse; warnings are kept for the caller to show.
#[derive(Debug, Default)]
pub struct WorkflowParser {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl WorkflowParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn parse_yaml(&mut self, text: &str) -> Result<WorkflowDefinition, WorkflowError> {
        self.parse_str(text, WorkflowFormat::Yaml)
    }

    pub fn parse_json(&mut self, text: &str) -> Result<WorkflowDefinition, WorkflowError> {
        self.parse_str(text, WorkflowFormat::Json)
    }

    pub fn parse_file(&mut self, path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
        let text = fs::read_to_string(path).map_err(|source| {
            self.errors = vec![format!("Cannot read workflow file: {}", path.display())];
            WorkflowError::Io { path: path.to_path_buf(), source }
        })?;
        debug!(path = %path.display(), "parsing workflow");
        self.parse_str(&text, WorkflowFormat::from_path(path))
    }

    pub fn parse_str(&mut self, text: &str, format: WorkflowFormat) -> Result<WorkflowDefinition, WorkflowError> {
        self.errors.clear();
        self.warnings.clear();

        let parsed = match format {
            WorkflowFormat::Yaml => serde_yaml_bw::from_str::<WorkflowDefinition>(text).map_err(|e| e.to_string()),
            WorkflowFormat::Json => serde_json::from_str::<WorkflowDefinition>(text).map_err(|e| e.to_string()),
        };
        let def = match parsed {
            Ok(def) => def,
            Err(e) => {
                self.errors.push(format!("Parse error: {e}"));
                return Err(WorkflowError::Parse(e));
            }
        };

        self.check_names(&def);
        self.errors.extend(def.validate());
        self.check_references(&def);
        for id in def.unused_nodes() {
            self.warnings.push(format!("Node {id} is not connected to any other node"));
        }

        for w in &self.warnings {
            warn!(workflow_id = %def.id, "{w}");
        }
        if self.has_errors() {
            return Err(WorkflowError::Invalid(self.errors.clone()));
        }
        Ok(def)
    }

    fn check_names(&mut self, def: &WorkflowDefinition) {
        for node in &def.nodes {
            if !is_valid_node_id(&node.id) {
                self.errors.push(format!("Invalid node ID: {}", node.id));
            }
            if !node.node_type.is_empty() && !is_valid_node_type(&node.node_type) {
                self.errors.push(format!("Invalid node type for node {}: {}", node.id, node.node_type));
            }
        }
    }

    /// References that neither the defaults nor the input schema can satisfy
    /// may still be supplied at run time, so they only warn.
    fn check_references(&mut self, def: &WorkflowDefinition) {
        let mut known: BTreeSet<&str> = def.default_parameters.keys().map(String::as_str).collect();
        if let Some(Value::Object(schema)) = &def.input_schema {
            known.extend(schema.keys().map(String::as_str));
            if let Some(Value::Object(props)) = schema.get("properties") {
                known.extend(props.keys().map(String::as_str));
            }
        }
        for node in &def.nodes {
            let mut refs = Vec::new();
            for value in node.parameters.values() {
                collect_references(value, &mut refs);
            }
            for name in refs {
                if !known.contains(name.as_str()) {
                    self.warnings.push(format!("Node {} references undefined parameter: {name}", node.id));
                }
            }
        }
    }
}
