use std::collections::{BTreeMap, BTreeSet, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{CYCLE_MESSAGE, WorkflowError, graph::WorkflowGraph};

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_output() -> String {
    "output".to_string()
}

fn default_input() -> String {
    "input".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// One step of a workflow: which node type to call and with what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            description: String::new(),
            enabled: true,
            parameters: BTreeMap::new(),
            depends_on: Vec::new(),
            retry_count: 0,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Data flow from one node's output field into another node's input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeConnection {
    #[serde(alias = "from")]
    pub from_node: String,
    #[serde(default = "default_output")]
    pub from_output: String,
    #[serde(alias = "to")]
    pub to_node: String,
    #[serde(default = "default_input")]
    pub to_input: String,
    #[serde(default, alias = "transform", skip_serializing_if = "Option::is_none")]
    pub transform_expression: Option<String>,
}

impl NodeConnection {
    pub fn new(
        from_node: impl Into<String>,
        from_output: impl Into<String>,
        to_node: impl Into<String>,
        to_input: impl Into<String>,
    ) -> Self {
        Self {
            from_node: from_node.into(),
            from_output: from_output.into(),
            to_node: to_node.into(),
            to_input: to_input.into(),
            transform_expression: None,
        }
    }

    pub fn with_transform(mut self, expression: impl Into<String>) -> Self {
        self.transform_expression = Some(expression.into());
        self
    }
}

/// A whole workflow as declared in a file.
///
/// Nodes keep their declaration order; every ordering tie-break relies on it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<NodeConnection>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_parameters: BTreeMap<String, Value>,
    /// Either a JSON schema or a flat `name: type` map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), version: default_version(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: WorkflowNode) {
        self.nodes.push(node);
    }

    /// Removes the node together with every connection touching it and every
    /// dependency naming it.
    pub fn remove_node(&mut self, id: &str) -> Option<WorkflowNode> {
        let pos = self.nodes.iter().position(|n| n.id == id)?;
        let removed = self.nodes.remove(pos);
        self.connections.retain(|c| c.from_node != id && c.to_node != id);
        for node in &mut self.nodes {
            node.depends_on.retain(|d| d != id);
        }
        Some(removed)
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn add_connection(&mut self, connection: NodeConnection) {
        self.connections.push(connection);
    }

    pub fn connections_from(&self, id: &str) -> Vec<&NodeConnection> {
        self.connections.iter().filter(|c| c.from_node == id).collect()
    }

    pub fn connections_to(&self, id: &str) -> Vec<&NodeConnection> {
        self.connections.iter().filter(|c| c.to_node == id).collect()
    }

    pub fn enabled_nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes.iter().filter(|n| n.enabled)
    }

    pub fn graph(&self) -> WorkflowGraph {
        WorkflowGraph::build(self)
    }

    /// Every structural problem, in a stable order. Empty means runnable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("Workflow ID cannot be empty".to_string());
        }
        if self.nodes.is_empty() {
            errors.push("Workflow must contain at least one node".to_string());
            return errors;
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                errors.push(format!("Duplicate node ID: {}", node.id));
            }
        }
        for node in &self.nodes {
            if node.node_type.trim().is_empty() {
                errors.push(format!("Node type cannot be empty for node: {}", node.id));
            }
        }

        let enabled: HashSet<&str> = self.enabled_nodes().map(|n| n.id.as_str()).collect();
        for node in self.enabled_nodes() {
            for dep in &node.depends_on {
                if !seen.contains(dep.as_str()) {
                    errors.push(format!("Dependency references non-existent node: {dep}"));
                } else if !enabled.contains(dep.as_str()) {
                    errors.push(format!("Node {} depends on disabled node {dep}", node.id));
                }
            }
        }

        for conn in &self.connections {
            let mut dangling = false;
            for end in [&conn.from_node, &conn.to_node] {
                if !seen.contains(end.as_str()) {
                    errors.push(format!("Connection references non-existent node: {end}"));
                    dangling = true;
                }
            }
            if dangling {
                continue;
            }
            let from_on = enabled.contains(conn.from_node.as_str());
            let to_on = enabled.contains(conn.to_node.as_str());
            if to_on && !from_on {
                errors.push(format!("Node {} depends on disabled node {}", conn.to_node, conn.from_node));
            } else if from_on && !to_on {
                errors.push(format!("Connection references disabled node: {}", conn.to_node));
            }
        }

        if self.has_cycles() {
            errors.push(CYCLE_MESSAGE.to_string());
        }
        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    pub fn ensure_valid(&self) -> Result<(), WorkflowError> {
        let errors = self.validate();
        if errors.is_empty() { Ok(()) } else { Err(WorkflowError::Invalid(errors)) }
    }

    pub fn has_cycles(&self) -> bool {
        self.graph().has_cycle()
    }

    pub fn execution_order(&self) -> Result<Vec<String>, WorkflowError> {
        self.graph().topological_order()
    }

    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>, WorkflowError> {
        self.graph().levels()
    }

    pub fn node_depths(&self) -> Result<BTreeMap<String, usize>, WorkflowError> {
        self.graph().depths()
    }

    /// True when some level holds more than one node.
    pub fn has_parallel_execution(&self) -> bool {
        self.execution_levels().map(|levels| levels.iter().any(|l| l.len() > 1)).unwrap_or(false)
    }

    /// Nodes that neither feed nor consume anything. A lone node is not unused.
    pub fn unused_nodes(&self) -> Vec<String> {
        let graph = self.graph();
        if graph.node_count() <= 1 {
            return vec![];
        }
        graph.isolated()
    }

    pub fn node_types(&self) -> BTreeSet<String> {
        self.nodes.iter().map(|n| n.node_type.clone()).filter(|t| !t.is_empty()).collect()
    }

    /// The input schema as JSON schema. A flat `name: type` map becomes an
    /// object schema that requires every listed name.
    pub fn input_json_schema(&self) -> Option<Value> {
        let schema = self.input_schema.as_ref()?;
        let Some(map) = schema.as_object() else {
            return Some(schema.clone());
        };
        let is_schema = ["type", "properties", "$schema", "$ref", "required"].iter().any(|k| map.contains_key(*k));
        if is_schema || !map.values().all(Value::is_string) {
            return Some(schema.clone());
        }
        let mut properties = Map::new();
        for (name, kind) in map {
            let kind = kind.as_str().unwrap_or("any");
            let property = match kind {
                "any" | "" => json!({}),
                "float" | "double" => json!({"type": "number"}),
                "int" => json!({"type": "integer"}),
                "bool" => json!({"type": "boolean"}),
                "map" => json!({"type": "object"}),
                "list" => json!({"type": "array"}),
                other => json!({"type": other}),
            };
            properties.insert(name.clone(), property);
        }
        let mut required: Vec<&String> = map.keys().collect();
        required.sort();
        Some(json!({"type": "object", "properties": properties, "required": required}))
    }

    pub fn to_yaml(&self) -> Result<String, WorkflowError> {
        serde_yaml_bw::to_string(self).map_err(|e| WorkflowError::Serialize(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, WorkflowError> {
        serde_json::to_string_pretty(self).map_err(|e| WorkflowError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("diamond", "Diamond");
        for id in ["input", "process_a", "process_b", "combine"] {
            def.add_node(WorkflowNode::new(id, "echo"));
        }
        def.add_connection(NodeConnection::new("input", "output", "process_a", "input"));
        def.add_connection(NodeConnection::new("input", "output", "process_b", "input"));
        def.add_connection(NodeConnection::new("process_a", "output", "combine", "left"));
        def.add_connection(NodeConnection::new("process_b", "output", "combine", "right"));
        def
    }

    #[test]
    fn diamond_is_valid_and_parallel() {
        let def = diamond();
        assert!(def.is_valid(), "{:?}", def.validate());
        assert!(def.has_parallel_execution());
        assert!(def.unused_nodes().is_empty());
        assert_eq!(def.node_depths().unwrap()["process_b"], 1);
        assert_eq!(def.node_types().into_iter().collect::<Vec<_>>(), vec!["echo"]);
        assert_eq!(def.connections_to("combine").len(), 2);
        assert_eq!(def.connections_from("input").len(), 2);
    }

    #[test]
    fn empty_workflow_reports_both_problems() {
        let def = WorkflowDefinition::new("", "nothing");
        assert_eq!(
            def.validate(),
            vec!["Workflow ID cannot be empty", "Workflow must contain at least one node"]
        );
        assert!(def.is_empty());
    }

    #[test]
    fn structural_errors_are_listed_in_order() {
        let mut def = WorkflowDefinition::new("broken", "Broken");
        def.add_node(WorkflowNode::new("a", "echo"));
        def.add_node(WorkflowNode::new("a", "echo"));
        def.add_node(WorkflowNode::new("b", "").with_dependency("ghost"));
        def.add_connection(NodeConnection::new("a", "output", "nowhere", "input"));
        assert_eq!(
            def.validate(),
            vec![
                "Duplicate node ID: a",
                "Node type cannot be empty for node: b",
                "Dependency references non-existent node: ghost",
                "Connection references non-existent node: nowhere",
            ]
        );
    }

    #[test]
    fn depending_on_a_disabled_node_is_rejected() {
        let mut def = WorkflowDefinition::new("wf", "wf");
        def.add_node(WorkflowNode::new("a", "echo"));
        def.add_node(WorkflowNode::new("b", "echo").with_dependency("a"));
        def.add_node(WorkflowNode::new("c", "echo"));
        def.add_connection(NodeConnection::new("c", "output", "a", "input"));
        def.node_mut("a").unwrap().enabled = false;
        assert_eq!(
            def.validate(),
            vec!["Node b depends on disabled node a", "Connection references disabled node: a"]
        );
        assert_eq!(def.execution_order().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn cycle_is_the_last_message() {
        let mut def = WorkflowDefinition::new("loop", "Loop");
        def.add_node(WorkflowNode::new("a", "echo").with_dependency("b"));
        def.add_node(WorkflowNode::new("b", "echo").with_dependency("a"));
        assert!(def.has_cycles());
        assert_eq!(def.validate(), vec![CYCLE_MESSAGE]);
        assert!(matches!(def.ensure_valid(), Err(WorkflowError::Invalid(_))));
        assert!(!def.has_parallel_execution());
    }

    #[test]
    fn remove_node_cleans_up_references() {
        let mut def = diamond();
        def.node_mut("combine").unwrap().depends_on.push("process_a".into());
        let removed = def.remove_node("process_a").unwrap();
        assert_eq!(removed.id, "process_a");
        assert!(def.connections.iter().all(|c| c.from_node != "process_a" && c.to_node != "process_a"));
        assert!(def.node("combine").unwrap().depends_on.is_empty());
        assert!(def.remove_node("process_a").is_none());
        assert!(def.is_valid());
    }

    #[test]
    fn unused_nodes_need_company() {
        let mut def = WorkflowDefinition::new("wf", "wf");
        def.add_node(WorkflowNode::new("solo", "echo"));
        assert!(def.unused_nodes().is_empty());
        def.add_node(WorkflowNode::new("a", "echo"));
        def.add_node(WorkflowNode::new("b", "echo").with_dependency("a"));
        assert_eq!(def.unused_nodes(), vec!["solo"]);
    }

    #[test]
    fn flat_input_schema_becomes_json_schema() {
        let mut def = diamond();
        assert!(def.input_json_schema().is_none());
        def.input_schema = Some(json!({"path": "string", "depth": "int"}));
        let schema = def.input_json_schema().unwrap();
        assert_eq!(schema["properties"]["depth"], json!({"type": "integer"}));
        assert_eq!(schema["required"], json!(["depth", "path"]));

        let explicit = json!({"type": "object", "properties": {"x": {"type": "number"}}});
        def.input_schema = Some(explicit.clone());
        assert_eq!(def.input_json_schema().unwrap(), explicit);
    }

    #[test]
    fn yaml_keeps_the_declaration_order() {
        let def = diamond();
        let back: WorkflowDefinition = serde_yaml_bw::from_str(&def.to_yaml().unwrap()).unwrap();
        assert_eq!(back, def);
        let json: WorkflowDefinition = serde_json::from_str(&def.to_json().unwrap()).unwrap();
        assert_eq!(json.nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), ["input", "process_a", "process_b", "combine"]);
    }
}
