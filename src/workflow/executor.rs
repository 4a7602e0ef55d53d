use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use node_protocol::{CallError, ErrorCode, envelope::ExecuteResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    WorkflowError,
    definition::{WorkflowDefinition, WorkflowNode},
    parser::substitute_parameters,
};
use crate::{
    communicator::NodeCommunicator,
    logger::WORKFLOW_EVENT_TARGET,
    process::ProcessError,
    registry::{NodeRegistry, RegistryError},
};

/// Why one node invocation did not produce output.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct NodeFailure {
    pub code: i64,
    pub message: String,
}

impl NodeFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.code(), message: message.into() }
    }
}

impl From<CallError> for NodeFailure {
    fn from(e: CallError) -> Self {
        let code = e.code();
        let message = match e {
            CallError::Application { message, .. } => message,
            other => other.to_string(),
        };
        Self { code, message }
    }
}

impl From<RegistryError> for NodeFailure {
    fn from(e: RegistryError) -> Self {
        Self::new(ErrorCode::NodeConfigError, e.to_string())
    }
}

impl From<ProcessError> for NodeFailure {
    fn from(e: ProcessError) -> Self {
        Self::new(ErrorCode::NodeInitError, e.to_string())
    }
}

/// Runs one workflow step somewhere.
#[async_trait]
pub trait NodeInvoker: Send + Sync {
    /// Make the step's node reachable. Runs before every attempt and is not
    /// charged to the step's timeout.
    async fn prepare(&self, _node: &WorkflowNode) -> Result<(), NodeFailure> {
        Ok(())
    }

    /// The timed call itself.
    async fn invoke(
        &self,
        node: &WorkflowNode,
        input: Value,
        context: Value,
        timeout: Duration,
    ) -> Result<ExecuteResult, NodeFailure>;
}

/// Resolves a step's type through the registry, starts the node if needed
/// and calls `node.execute` on it.
pub struct RegistryInvoker {
    registry: Arc<NodeRegistry>,
    communicator: Arc<NodeCommunicator>,
}

impl RegistryInvoker {
    pub fn new(registry: Arc<NodeRegistry>, communicator: Arc<NodeCommunicator>) -> Self {
        Self { registry, communicator }
    }
}

#[async_trait]
impl NodeInvoker for RegistryInvoker {
    async fn prepare(&self, step: &WorkflowNode) -> Result<(), NodeFailure> {
        let node = self.registry.resolve_type(&step.node_type)?;
        if !node.is_running() {
            match self.registry.lifecycle() {
                Some(lifecycle) => match lifecycle.start(&node).await {
                    Ok(_) | Err(ProcessError::InvalidState { .. }) => {}
                    Err(e) => return Err(e.into()),
                },
                None => {
                    return Err(NodeFailure::new(
                        ErrorCode::NodeInitError,
                        format!("node {} is not running", node.id()),
                    ));
                }
            }
        }
        if !self.communicator.is_connected(node.id()) {
            self.communicator.connect_with_retry(&node).await?;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        step: &WorkflowNode,
        input: Value,
        context: Value,
        timeout: Duration,
    ) -> Result<ExecuteResult, NodeFailure> {
        let node = self.registry.resolve_type(&step.node_type)?;
        Ok(self.communicator.execute(node.id(), input, context, Some(timeout)).await?)
    }
}

/// Applies a connection's transform expression to the value it carries.
pub trait TransformEvaluator: Send + Sync {
    fn evaluate(&self, value: &Value, expression: &str) -> Result<Value, String>;
}

type TransformFn = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// Named transforms. `identity` and `to_string` are always present.
pub struct TransformRegistry {
    functions: HashMap<String, TransformFn>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = Self { functions: HashMap::new() };
        registry.register("identity", Value::clone);
        registry.register("to_string", |v| match v {
            Value::String(_) => v.clone(),
            other => Value::String(other.to_string()),
        });
        registry
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, f: impl Fn(&Value) -> Value + Send + Sync + 'static) {
        self.functions.insert(name.into(), Box::new(f));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl TransformEvaluator for TransformRegistry {
    fn evaluate(&self, value: &Value, expression: &str) -> Result<Value, String> {
        let name = expression.trim();
        if name.is_empty() {
            return Ok(value.clone());
        }
        self.functions.get(name).map(|f| f(value)).ok_or_else(|| format!("Unknown transform: {name}"))
    }
}

/// What happens to the rest of the run once a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Skip the failed node's dependents, keep running independent branches.
    #[default]
    SkipDependents,
    /// Start nothing new after the first failure.
    FailFast,
    /// Run dependents anyway with whatever inputs exist.
    ContinueOnError,
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorStrategy::SkipDependents => "skip_dependents",
            ErrorStrategy::FailFast => "fail_fast",
            ErrorStrategy::ContinueOnError => "continue_on_error",
        })
    }
}

impl FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "skip_dependents" => Ok(ErrorStrategy::SkipDependents),
            "fail_fast" => Ok(ErrorStrategy::FailFast),
            "continue_on_error" => Ok(ErrorStrategy::ContinueOnError),
            other => Err(format!("unknown error strategy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    Success { output: Value, attempts: u32 },
    Failed { code: i64, message: String, attempts: u32 },
    Skipped { reason: String },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, NodeOutcome::Skipped { .. })
    }
}

/// One try at one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub node_id: String,
    pub attempt: u32,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub error: Option<NodeFailure>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStatus {
    pub current_node: Option<String>,
    pub completed: usize,
    pub total: usize,
    pub running: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub run_id: String,
    pub success: bool,
    pub order: Vec<String>,
    pub outcomes: BTreeMap<String, NodeOutcome>,
    pub records: Vec<AttemptRecord>,
    pub outputs: BTreeMap<String, Value>,
    pub elapsed_ms: u64,
}

impl WorkflowReport {
    pub fn outcome(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(node_id)
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, NodeOutcome::Failed { .. }))
    }

    pub fn skipped_nodes(&self) -> Vec<&str> {
        self.filter(NodeOutcome::is_skipped)
    }

    fn filter(&self, pred: impl Fn(&NodeOutcome) -> bool) -> Vec<&str> {
        self.order.iter().filter(|id| self.outcomes.get(*id).is_some_and(&pred)).map(String::as_str).collect()
    }
}

#[derive(Default)]
struct Progress {
    status: ExecutionStatus,
    started: Option<Instant>,
}

/// Drives a workflow level by level through a [`NodeInvoker`].
pub struct WorkflowExecutor {
    invoker: Arc<dyn NodeInvoker>,
    transforms: Arc<dyn TransformEvaluator>,
    strategy: ErrorStrategy,
    retry_backoff: Duration,
    progress: Mutex<Progress>,
}

impl WorkflowExecutor {
    pub fn new(invoker: Arc<dyn NodeInvoker>) -> Self {
        Self {
            invoker,
            transforms: Arc::new(TransformRegistry::default()),
            strategy: ErrorStrategy::default(),
            retry_backoff: Duration::from_millis(100),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn with_transforms(mut self, transforms: Arc<dyn TransformEvaluator>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn strategy(&self) -> ErrorStrategy {
        self.strategy
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the current (or last) run.
    pub fn status(&self) -> ExecutionStatus {
        let progress = self.progress();
        let mut status = progress.status.clone();
        if status.running {
            if let Some(started) = progress.started {
                status.elapsed = started.elapsed();
            }
        }
        status
    }

    /// Validate `def`, check `inputs` against its input schema and run every
    /// enabled node in dependency order.
    ///
    /// Structural problems fail the call. Node failures do not; they show up
    /// in the report.
    #[instrument(skip_all, fields(workflow_id = %def.id))]
    pub async fn run(
        &self,
        def: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> Result<WorkflowReport, WorkflowError> {
        def.ensure_valid()?;
        let mut vars = def.default_parameters.clone();
        vars.extend(inputs.clone());
        check_inputs(def, &vars)?;

        let graph = def.graph();
        let levels = graph.levels()?;
        let order = graph.topological_order()?;
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        {
            let mut progress = self.progress();
            progress.status =
                ExecutionStatus { total: order.len(), running: true, ..ExecutionStatus::default() };
            progress.started = Some(started);
        }
        info!(target: WORKFLOW_EVENT_TARGET, workflow_id = %def.id, run_id = %run_id, nodes = order.len(), "workflow started");

        let mut outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut records = Vec::new();
        let mut halted_by: Option<String> = None;

        for level in &levels {
            let mut runnable = Vec::new();
            for id in level {
                let Some(step) = def.node(id) else { continue };
                if let Some(skip) = self.skip_reason(&graph.upstream(id), &outcomes, halted_by.as_deref()) {
                    outcomes.insert(id.clone(), NodeOutcome::Skipped { reason: skip });
                    self.progress().status.completed += 1;
                    continue;
                }
                match self.build_input(def, step, &outputs, &vars, &inputs) {
                    Ok(input) => runnable.push((step, input)),
                    Err(failure) => {
                        warn!(target: WORKFLOW_EVENT_TARGET, node_id = %id, "input preparation failed: {failure}");
                        outcomes.insert(
                            id.clone(),
                            NodeOutcome::Failed { code: failure.code, message: failure.message, attempts: 0 },
                        );
                        self.progress().status.completed += 1;
                        halted_by.get_or_insert_with(|| id.clone());
                    }
                }
            }
            if halted_by.is_some() && self.strategy == ErrorStrategy::FailFast {
                for (step, _) in runnable.drain(..) {
                    outcomes.insert(step.id.clone(), halted_skip(halted_by.as_deref()));
                    self.progress().status.completed += 1;
                }
            }

            let runs = runnable.into_iter().map(|(step, input)| self.run_node(def, &run_id, step, input));
            for (step, outcome, attempts) in join_all(runs).await {
                records.extend(attempts);
                if let NodeOutcome::Success { output, .. } = &outcome {
                    outputs.insert(step.id.clone(), output.clone());
                } else {
                    halted_by.get_or_insert_with(|| step.id.clone());
                }
                outcomes.insert(step.id.clone(), outcome);
                self.progress().status.completed += 1;
            }
        }

        let success = order.iter().all(|id| outcomes.get(id).is_some_and(NodeOutcome::is_success));
        let elapsed = started.elapsed();
        {
            let mut progress = self.progress();
            progress.status.running = false;
            progress.status.current_node = None;
            progress.status.elapsed = elapsed;
        }
        info!(
            target: WORKFLOW_EVENT_TARGET,
            workflow_id = %def.id,
            run_id = %run_id,
            success,
            elapsed_ms = elapsed.as_millis() as u64,
            "workflow finished"
        );
        Ok(WorkflowReport {
            workflow_id: def.id.clone(),
            run_id,
            success,
            order,
            outcomes,
            records,
            outputs,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    fn skip_reason(
        &self,
        upstream: &[String],
        outcomes: &BTreeMap<String, NodeOutcome>,
        halted_by: Option<&str>,
    ) -> Option<String> {
        match self.strategy {
            ErrorStrategy::FailFast if halted_by.is_some() => {
                let NodeOutcome::Skipped { reason } = halted_skip(halted_by) else { return None };
                Some(reason)
            }
            ErrorStrategy::ContinueOnError => None,
            _ => upstream
                .iter()
                .find(|u| !outcomes.get(*u).is_some_and(NodeOutcome::is_success))
                .map(|u| format!("upstream node {u} did not succeed")),
        }
    }

    /// Parameters with `${name}` substituted, then one entry per inbound
    /// connection. Nodes without upstream also receive the run inputs.
    fn build_input(
        &self,
        def: &WorkflowDefinition,
        step: &WorkflowNode,
        outputs: &BTreeMap<String, Value>,
        vars: &BTreeMap<String, Value>,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<Value, NodeFailure> {
        let mut input: Map<String, Value> =
            step.parameters.iter().map(|(k, v)| (k.clone(), substitute_parameters(v, vars))).collect();

        let inbound = def.connections_to(&step.id);
        if inbound.is_empty() && step.depends_on.is_empty() {
            for (k, v) in inputs {
                input.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        for conn in inbound {
            let Some(upstream) = outputs.get(&conn.from_node) else { continue };
            let value = match upstream.get(&conn.from_output) {
                Some(field) => field.clone(),
                None if conn.from_output == "output" => upstream.clone(),
                None => continue,
            };
            let value = match conn.transform_expression.as_deref() {
                Some(expr) => self.transforms.evaluate(&value, expr).map_err(|e| {
                    NodeFailure::new(
                        ErrorCode::NodeConfigError,
                        format!("transform on {} -> {}: {e}", conn.from_node, conn.to_node),
                    )
                })?,
                None => value,
            };
            input.insert(conn.to_input.clone(), value);
        }
        Ok(Value::Object(input))
    }

    /// Up to `retry_count + 1` attempts, sleeping `retry_backoff * attempt`
    /// between them.
    async fn run_node<'a>(
        &self,
        def: &WorkflowDefinition,
        run_id: &str,
        step: &'a WorkflowNode,
        input: Value,
    ) -> (&'a WorkflowNode, NodeOutcome, Vec<AttemptRecord>) {
        self.progress().status.current_node = Some(step.id.clone());
        let limit = Duration::from_millis(step.timeout_ms);
        let attempts = step.retry_count.saturating_add(1);
        let mut records = Vec::new();
        let mut attempt = 1;
        loop {
            let context = json!({
                "workflow_id": def.id,
                "run_id": run_id,
                "node_id": step.id,
                "attempt": attempt,
            });
            let started = Utc::now();
            let result = match self.invoker.prepare(step).await {
                Ok(()) => match timeout(limit, self.invoker.invoke(step, input.clone(), context, limit)).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeFailure::new(
                        ErrorCode::NodeExecutionTimeout,
                        format!("execution timed out after {}ms", step.timeout_ms),
                    )),
                },
                Err(failure) => Err(failure),
            };
            records.push(AttemptRecord {
                node_id: step.id.clone(),
                attempt,
                started,
                finished: Utc::now(),
                error: result.as_ref().err().cloned(),
            });
            match result {
                Ok(done) => {
                    info!(target: WORKFLOW_EVENT_TARGET, node_id = %step.id, attempt, "node succeeded");
                    return (step, NodeOutcome::Success { output: done.output, attempts: attempt }, records);
                }
                Err(failure) if attempt < attempts => {
                    warn!(target: WORKFLOW_EVENT_TARGET, node_id = %step.id, attempt, "attempt failed, retrying: {failure}");
                    sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(failure) => {
                    warn!(target: WORKFLOW_EVENT_TARGET, node_id = %step.id, attempt, code = failure.code, "node failed: {}", failure.message);
                    let outcome = NodeOutcome::Failed { code: failure.code, message: failure.message, attempts: attempt };
                    return (step, outcome, records);
                }
            }
        }
    }
}

fn halted_skip(halted_by: Option<&str>) -> NodeOutcome {
    NodeOutcome::Skipped { reason: format!("workflow halted after failure of {}", halted_by.unwrap_or("a node")) }
}

fn check_inputs(def: &WorkflowDefinition, vars: &BTreeMap<String, Value>) -> Result<(), WorkflowError> {
    let Some(schema) = def.input_json_schema() else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(&schema).map_err(|e| WorkflowError::Schema(e.to_string()))?;
    let instance = Value::Object(vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    let errors: Vec<String> = validator.iter_errors(&instance).map(|e| e.to_string()).collect();
    if errors.is_empty() { Ok(()) } else { Err(WorkflowError::InvalidInput(errors)) }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::workflow::definition::NodeConnection;

    /// Echoes `{value: input, node: id}` unless a failure is queued for the
    /// node.
    #[derive(Default)]
    struct ScriptedInvoker {
        failures: Mutex<HashMap<String, VecDeque<NodeFailure>>>,
        calls: Mutex<Vec<(String, Value)>>,
        delay: Duration,
        warmup: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedInvoker {
        fn fail(self, node: &str, times: usize, code: ErrorCode) -> Self {
            let queue = (0..times).map(|i| NodeFailure::new(code, format!("{node} broke #{i}"))).collect();
            self.failures.lock().unwrap().insert(node.to_string(), queue);
            self
        }

        fn calls_to(&self, node: &str) -> Vec<Value> {
            self.calls.lock().unwrap().iter().filter(|(n, _)| n == node).map(|(_, v)| v.clone()).collect()
        }
    }

    #[async_trait]
    impl NodeInvoker for ScriptedInvoker {
        async fn prepare(&self, _node: &WorkflowNode) -> Result<(), NodeFailure> {
            sleep(self.warmup).await;
            Ok(())
        }

        async fn invoke(
            &self,
            node: &WorkflowNode,
            input: Value,
            _context: Value,
            _timeout: Duration,
        ) -> Result<ExecuteResult, NodeFailure> {
            self.calls.lock().unwrap().push((node.id.clone(), input.clone()));
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            let failure = self.failures.lock().unwrap().get_mut(&node.id).and_then(|q| q.pop_front());
            match failure {
                Some(f) => Err(f),
                None => Ok(ExecuteResult {
                    output: json!({"value": input, "node": node.id}),
                    ..Default::default()
                }),
            }
        }
    }

    fn executor(invoker: Arc<ScriptedInvoker>) -> WorkflowExecutor {
        WorkflowExecutor::new(invoker).with_retry_backoff(Duration::ZERO)
    }

    fn diamond() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("diamond", "Diamond");
        for id in ["input", "process_a", "process_b", "combine"] {
            def.add_node(WorkflowNode::new(id, "echo"));
        }
        def.add_connection(NodeConnection::new("input", "value", "process_a", "data"));
        def.add_connection(NodeConnection::new("input", "value", "process_b", "data"));
        def.add_connection(NodeConnection::new("process_a", "node", "combine", "left"));
        def.add_connection(NodeConnection::new("process_b", "node", "combine", "right"));
        def
    }

    #[tokio::test]
    async fn data_flows_along_connections() {
        let mut def = WorkflowDefinition::new("chain", "Chain");
        def.default_parameters.insert("greeting".into(), json!("hi"));
        def.add_node(WorkflowNode::new("a", "echo").with_parameter("msg", json!("${greeting} ${who}")));
        def.add_node(WorkflowNode::new("b", "echo"));
        def.add_connection(NodeConnection::new("a", "value", "b", "payload").with_transform("identity"));

        let invoker = Arc::new(ScriptedInvoker::default());
        let exec = executor(invoker.clone());
        let inputs = [("who".to_string(), json!("there")), ("extra".to_string(), json!(1))].into_iter().collect();
        let report = exec.run(&def, inputs).await.unwrap();

        assert!(report.success);
        assert_eq!(report.order, vec!["a", "b"]);
        assert_eq!(invoker.calls_to("a"), vec![json!({"msg": "hi there", "who": "there", "extra": 1})]);
        let b_input = &invoker.calls_to("b")[0];
        assert_eq!(b_input["payload"]["msg"], "hi there");
        assert_eq!(report.outputs["b"]["node"], "b");
        assert_eq!(report.records.len(), 2);
        assert!(!report.run_id.is_empty());

        let status = exec.status();
        assert!(!status.running);
        assert_eq!((status.completed, status.total), (2, 2));
    }

    #[tokio::test]
    async fn failure_skips_only_dependents() {
        let invoker = Arc::new(ScriptedInvoker::default().fail("process_a", 1, ErrorCode::NodeInternalError));
        let report = executor(invoker.clone()).run(&diamond(), BTreeMap::new()).await.unwrap();

        assert!(!report.success);
        assert!(report.outcome("input").unwrap().is_success());
        assert!(report.outcome("process_b").unwrap().is_success());
        assert_eq!(
            report.outcome("process_a"),
            Some(&NodeOutcome::Failed { code: -1005, message: "process_a broke #0".into(), attempts: 1 })
        );
        assert_eq!(report.skipped_nodes(), vec!["combine"]);
        assert_eq!(report.failed_nodes(), vec!["process_a"]);
        assert!(invoker.calls_to("combine").is_empty());
    }

    #[tokio::test]
    async fn retries_consume_the_budget() {
        let mut def = WorkflowDefinition::new("retry", "Retry");
        def.add_node(WorkflowNode::new("flaky", "echo").with_retries(2));
        def.add_node(WorkflowNode::new("broken", "echo").with_retries(1));
        let invoker = Arc::new(
            ScriptedInvoker::default()
                .fail("flaky", 2, ErrorCode::NodeExecutionTimeout)
                .fail("broken", 5, ErrorCode::InternalError),
        );
        let report = executor(invoker.clone()).run(&def, BTreeMap::new()).await.unwrap();

        assert!(matches!(report.outcome("flaky"), Some(NodeOutcome::Success { attempts: 3, .. })));
        assert!(matches!(report.outcome("broken"), Some(NodeOutcome::Failed { attempts: 2, code: -32603, .. })));
        let flaky: Vec<_> = report.records.iter().filter(|r| r.node_id == "flaky").collect();
        assert_eq!(flaky.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(flaky[0].error.is_some() && flaky[2].error.is_none());
        assert_eq!(invoker.calls_to("broken").len(), 2);
    }

    fn two_branches() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("branches", "Branches");
        def.add_node(WorkflowNode::new("a", "echo"));
        def.add_node(WorkflowNode::new("x", "echo"));
        def.add_node(WorkflowNode::new("b", "echo").with_dependency("a"));
        def.add_node(WorkflowNode::new("y", "echo").with_dependency("x"));
        def
    }

    #[tokio::test]
    async fn strategies_decide_what_runs_after_a_failure() {
        let run = |strategy| async move {
            let invoker = Arc::new(ScriptedInvoker::default().fail("a", 1, ErrorCode::NodeValidationError));
            let report = executor(invoker).with_strategy(strategy).run(&two_branches(), BTreeMap::new()).await.unwrap();
            let mut ran: Vec<String> = report
                .outcomes
                .iter()
                .filter(|(_, o)| !o.is_skipped())
                .map(|(id, _)| id.clone())
                .collect();
            ran.sort();
            ran
        };
        assert_eq!(run(ErrorStrategy::SkipDependents).await, vec!["a", "x", "y"]);
        assert_eq!(run(ErrorStrategy::FailFast).await, vec!["a", "x"]);
        assert_eq!(run(ErrorStrategy::ContinueOnError).await, vec!["a", "b", "x", "y"]);
    }

    #[tokio::test]
    async fn level_members_run_concurrently() {
        let invoker = Arc::new(ScriptedInvoker { delay: Duration::from_millis(50), ..Default::default() });
        let report = executor(invoker.clone()).run(&diamond(), BTreeMap::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(invoker.peak.load(Ordering::SeqCst), 2);
        let combine = &invoker.calls_to("combine")[0];
        assert_eq!(combine, &json!({"left": "process_a", "right": "process_b"}));
    }

    #[tokio::test]
    async fn unknown_transform_fails_the_node_without_calling_it() {
        let mut def = diamond();
        def.connections[0].transform_expression = Some("upper".into());
        let invoker = Arc::new(ScriptedInvoker::default());
        let report = executor(invoker.clone()).run(&def, BTreeMap::new()).await.unwrap();
        assert_eq!(
            report.outcome("process_a"),
            Some(&NodeOutcome::Failed {
                code: -1001,
                message: "transform on input -> process_a: Unknown transform: upper".into(),
                attempts: 0
            })
        );
        assert!(invoker.calls_to("process_a").is_empty());
    }

    #[tokio::test]
    async fn slow_nodes_time_out() {
        let mut def = WorkflowDefinition::new("slow", "Slow");
        let mut node = WorkflowNode::new("sleepy", "echo");
        node.timeout_ms = 20;
        def.add_node(node);
        let invoker = Arc::new(ScriptedInvoker { delay: Duration::from_millis(500), ..Default::default() });
        let report = executor(invoker).run(&def, BTreeMap::new()).await.unwrap();
        assert!(matches!(report.outcome("sleepy"), Some(NodeOutcome::Failed { code: -1003, .. })));
    }

    #[tokio::test]
    async fn slow_startup_does_not_count_against_the_timeout() {
        let mut def = WorkflowDefinition::new("cold", "Cold start");
        let mut node = WorkflowNode::new("cold", "echo");
        node.timeout_ms = 100;
        def.add_node(node);
        let invoker = Arc::new(ScriptedInvoker {
            warmup: Duration::from_millis(300),
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let report = executor(invoker).run(&def, BTreeMap::new()).await.unwrap();
        assert!(matches!(report.outcome("cold"), Some(NodeOutcome::Success { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn structural_and_input_problems_abort_the_run() {
        let invoker = Arc::new(ScriptedInvoker::default());
        let exec = executor(invoker.clone());

        let mut cyclic = two_branches();
        cyclic.node_mut("a").unwrap().depends_on.push("b".into());
        assert!(matches!(exec.run(&cyclic, BTreeMap::new()).await, Err(WorkflowError::Invalid(_))));

        let mut typed = two_branches();
        typed.input_schema = Some(json!({"count": "integer"}));
        let err = exec.run(&typed, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
        let ok = exec.run(&typed, [("count".to_string(), json!(2))].into_iter().collect()).await.unwrap();
        assert!(ok.success);
        assert_eq!(invoker.calls_to("a"), vec![json!({"count": 2})]);
    }

    #[test]
    fn strategy_names() {
        assert_eq!("fail-fast".parse::<ErrorStrategy>().unwrap(), ErrorStrategy::FailFast);
        assert_eq!(ErrorStrategy::default().to_string(), "skip_dependents");
        assert!("panic".parse::<ErrorStrategy>().is_err());
    }

    #[test]
    fn transforms() {
        let t = TransformRegistry::default();
        assert_eq!(t.evaluate(&json!(5), "to_string").unwrap(), json!("5"));
        assert_eq!(t.evaluate(&json!("x"), "to_string").unwrap(), json!("x"));
        assert_eq!(t.evaluate(&json!([1]), "").unwrap(), json!([1]));
        assert_eq!(t.names(), vec!["identity", "to_string"]);
    }

    #[test]
    fn call_errors_become_failures() {
        let app = CallError::Application { code: -1002, message: "bad input".into(), data: None };
        assert_eq!(NodeFailure::from(app), NodeFailure { code: -1002, message: "bad input".into() });
        let lost = NodeFailure::from(CallError::ConnectionClosed);
        assert_eq!(lost.code, -32603);
        let missing = NodeFailure::from(RegistryError::UnknownType("scan".into()));
        assert_eq!(missing.code, -1001);
    }
}
