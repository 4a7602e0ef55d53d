use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    communicator::NodeCommunicator,
    config::OrchestratorConfig,
    discovery::{DiscoveryScanner, ScannerHandle},
    process::{ProcessLifecycle, UnixProcessControl},
    registry::NodeRegistry,
    workflow::{
        ErrorStrategy, RegistryInvoker, WorkflowDefinition, WorkflowError, WorkflowExecutor, WorkflowParser,
        WorkflowReport,
    },
};

struct Monitor {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns the registry and everything that feeds or drives it for one run.
///
/// `new` only wires the parts together; `start` launches the discovery loop
/// and the health monitor, `shutdown` tears all of it down again.
pub struct Orchestrator {
    config: OrchestratorConfig,
    communicator: Arc<NodeCommunicator>,
    lifecycle: Arc<ProcessLifecycle>,
    registry: Arc<NodeRegistry>,
    scanner: Option<ScannerHandle>,
    consumer: Option<JoinHandle<()>>,
    monitor: Option<Monitor>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let communicator = Arc::new(NodeCommunicator::from_config(&config));
        let control = Arc::new(UnixProcessControl::new());
        let lifecycle = Arc::new(ProcessLifecycle::from_config(&config, control, communicator.clone()));
        let registry = Arc::new(NodeRegistry::with_lifecycle(lifecycle.clone()));
        Self { config, communicator, lifecycle, registry, scanner: None, consumer: None, monitor: None }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<ProcessLifecycle> {
        &self.lifecycle
    }

    pub fn communicator(&self) -> &Arc<NodeCommunicator> {
        &self.communicator
    }

    pub fn is_started(&self) -> bool {
        self.scanner.is_some()
    }

    /// One full pass over the nodes directory, applied straight to the
    /// registry. Returns the number of registered nodes afterwards.
    pub async fn discover_once(&self) -> usize {
        let (scanner, _events) = DiscoveryScanner::from_config(&self.config);
        for event in scanner.scan().await {
            self.registry.apply(event).await;
        }
        self.registry.registered_count()
    }

    /// Launch the discovery loop, its registry consumer and the health
    /// monitor. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.is_started() {
            return;
        }
        let (scanner, events) = DiscoveryScanner::from_config(&self.config);
        self.consumer = Some(self.registry.consume(events));
        self.scanner = Some(scanner.spawn());
        self.monitor = Some(self.spawn_monitor());
        info!(nodes_dir = %self.config.nodes_dir.display(), "orchestrator started");
    }

    fn spawn_monitor(&self) -> Monitor {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let lifecycle = self.lifecycle.clone();
        let every = self.config.health_interval().max(std::time::Duration::from_millis(1));
        let join = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately; nothing is running yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let running: Vec<_> = registry.all_nodes().into_iter().filter(|n| n.is_running()).collect();
                if running.is_empty() {
                    continue;
                }
                let results = lifecycle.health_check_all(&running).await;
                let unhealthy: Vec<&String> = results.iter().filter(|(_, ok)| !**ok).map(|(id, _)| id).collect();
                if unhealthy.is_empty() {
                    debug!(checked = results.len(), "all nodes healthy");
                } else {
                    warn!(checked = results.len(), ?unhealthy, "unhealthy nodes");
                }
            }
            debug!("health monitor stopped");
        });
        Monitor { stop_tx, join }
    }

    pub async fn start_node(&self, node_id: &str) -> Result<u32> {
        let node = self.registry.get_node(node_id).with_context(|| format!("unknown node `{node_id}`"))?;
        let pid = self.lifecycle.start(&node).await.with_context(|| format!("starting `{node_id}`"))?;
        Ok(pid)
    }

    pub async fn stop_node(&self, node_id: &str) -> Result<bool> {
        let node = self.registry.get_node(node_id).with_context(|| format!("unknown node `{node_id}`"))?;
        let stopped = self.lifecycle.stop(&node).await.with_context(|| format!("stopping `{node_id}`"))?;
        Ok(stopped)
    }

    pub fn executor(&self, strategy: ErrorStrategy) -> WorkflowExecutor {
        let invoker = RegistryInvoker::new(self.registry.clone(), self.communicator.clone());
        WorkflowExecutor::new(Arc::new(invoker))
            .with_strategy(strategy)
            .with_retry_backoff(self.config.retry_backoff())
    }

    #[instrument(skip_all, fields(workflow_id = %def.id))]
    pub async fn run_workflow(
        &self,
        def: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
        strategy: ErrorStrategy,
    ) -> Result<WorkflowReport, WorkflowError> {
        self.executor(strategy).run(def, inputs).await
    }

    pub async fn run_workflow_file(
        &self,
        path: &Path,
        inputs: BTreeMap<String, Value>,
        strategy: ErrorStrategy,
    ) -> Result<WorkflowReport> {
        let def = WorkflowParser::new()
            .parse_file(path)
            .with_context(|| format!("loading workflow {}", path.display()))?;
        let report = self.run_workflow(&def, inputs, strategy).await?;
        Ok(report)
    }

    /// Stop the background tasks, then unregister every node, which stops
    /// its process. Returns how many nodes were torn down.
    pub async fn shutdown(&mut self) -> usize {
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.stop_tx.send(true);
            let _ = monitor.join.await;
        }
        if let Some(scanner) = self.scanner.take() {
            scanner.shutdown().await;
        }
        if let Some(consumer) = self.consumer.take() {
            // the queue closes once the scanner task is gone
            let _ = consumer.await;
        }
        let removed = self.registry.clear().await;
        self.communicator.shutdown_all(1).await;
        info!(removed, stats = ?self.lifecycle.stats(), "orchestrator stopped");
        removed
    }
}
