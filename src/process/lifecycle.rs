use std::{
    collections::HashMap,
    path::{Component, Path},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::{
    ProcessError,
    control::{LaunchSpec, ProcessControl, TerminateOutcome},
};
use crate::{
    communicator::NodeCommunicator,
    config::OrchestratorConfig,
    node::{HealthState, ManagedNode, NodeRef, RunState},
};

pub const ENV_NODE_ID: &str = "NODEFLOW_NODE_ID";
pub const ENV_SOCKET_PATH: &str = "NODEFLOW_SOCKET_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub max_restart_count: u32,
    pub restart_delay: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self { max_restart_count: 3, restart_delay: Duration::from_millis(500) }
    }
}

/// Per-node process facts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStats {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStats {
    pub total_started: u64,
    pub total_stopped: u64,
    pub total_crashed: u64,
    pub total_restarts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    stopped: AtomicU64,
    crashed: AtomicU64,
    restarts: AtomicU64,
}

/// Starts, stops and watches node processes.
pub struct ProcessLifecycle {
    control: Arc<dyn ProcessControl>,
    communicator: Arc<NodeCommunicator>,
    limits: ProcessLimits,
    stop_grace: Duration,
    auto_restart: bool,
    counters: Counters,
}

impl std::fmt::Debug for ProcessLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLifecycle")
            .field("limits", &self.limits)
            .field("stop_grace", &self.stop_grace)
            .field("auto_restart", &self.auto_restart)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ProcessLifecycle {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        communicator: Arc<NodeCommunicator>,
        limits: ProcessLimits,
        stop_grace: Duration,
        auto_restart: bool,
    ) -> Self {
        Self { control, communicator, limits, stop_grace, auto_restart, counters: Counters::default() }
    }

    pub fn from_config(
        config: &OrchestratorConfig,
        control: Arc<dyn ProcessControl>,
        communicator: Arc<NodeCommunicator>,
    ) -> Self {
        let limits = ProcessLimits {
            max_restart_count: config.max_restart_count,
            restart_delay: config.retry_backoff(),
        };
        Self::new(control, communicator, limits, config.stop_grace(), config.auto_restart)
    }

    pub fn communicator(&self) -> &Arc<NodeCommunicator> {
        &self.communicator
    }

    pub fn limits(&self) -> ProcessLimits {
        self.limits
    }

    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            total_started: self.counters.started.load(Ordering::Relaxed),
            total_stopped: self.counters.stopped.load(Ordering::Relaxed),
            total_crashed: self.counters.crashed.load(Ordering::Relaxed),
            total_restarts: self.counters.restarts.load(Ordering::Relaxed),
        }
    }

    pub fn process_stats(&self, node: &ManagedNode) -> ProcessStats {
        let state = node.state();
        let pid = state.pid.filter(|_| state.run_state == RunState::Running);
        ProcessStats {
            pid,
            started_at: state.started_at,
            exit_code: state.last_exit_code,
            restart_count: state.restart_count,
        }
    }

    /// What the child gets launched with.
    pub fn launch_spec(node: &ManagedNode) -> LaunchSpec {
        let manifest = node.manifest();
        let node_dir = node.node_dir();
        let program = resolve_program(&manifest.runtime.command, &node_dir);

        let mut env = manifest.runtime.env.clone();
        env.insert(ENV_NODE_ID.into(), manifest.id.clone());
        env.insert(ENV_SOCKET_PATH.into(), manifest.communication.socket_path.clone());

        let working_dir = if manifest.runtime.working_dir.is_some() || node_dir.is_dir() {
            Some(manifest.working_dir(&node_dir))
        } else {
            None
        };
        LaunchSpec { program, args: manifest.runtime.args.clone(), env, working_dir }
    }

    /// Spawn the node's process and connect to it. Only valid from `Stopped`.
    ///
    /// A node that never opens its socket still counts as started; it shows
    /// up as `running-disconnected`.
    #[instrument(skip(self, node), fields(node_id = %node.id()))]
    pub async fn start(&self, node: &NodeRef) -> Result<u32, ProcessError> {
        node.update(|s| {
            if s.run_state != RunState::Stopped {
                return Err(ProcessError::InvalidState {
                    node_id: node.id().to_string(),
                    state: s.run_state,
                    expected: RunState::Stopped,
                });
            }
            s.run_state = RunState::Starting;
            Ok(())
        })?;
        let _starting = StartingGuard(node);

        let spec = Self::launch_spec(node);
        let pid = match self.control.start(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                error!("spawn failed: {e}");
                node.update(|s| {
                    s.run_state = RunState::Stopped;
                    s.health = HealthState::Unhealthy;
                    s.pid = None;
                });
                return Err(e);
            }
        };

        node.update(|s| {
            s.run_state = RunState::Running;
            s.pid = Some(pid);
            s.started_at = Some(Utc::now());
            s.health = HealthState::Unknown;
            s.last_exit_code = None;
        });
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(pid, program = %spec.program, "node started");

        if let Err(e) = self.communicator.connect_with_retry(node).await {
            warn!("node running but not reachable: {e}");
        }
        Ok(pid)
    }

    /// Stop the node's process: ask over the protocol, then SIGTERM, then
    /// SIGKILL after the grace window. `Ok(false)` if it was not running.
    #[instrument(skip(self, node), fields(node_id = %node.id()))]
    pub async fn stop(&self, node: &NodeRef) -> Result<bool, ProcessError> {
        let claimed = node.update(|s| {
            if s.run_state != RunState::Running {
                return None;
            }
            s.run_state = RunState::Stopping;
            Some(s.pid)
        });
        let Some(pid) = claimed else {
            return Ok(false);
        };
        let Some(pid) = pid else {
            self.mark_stopped(node, None);
            return Ok(true);
        };

        if !self.control.is_alive(pid) {
            debug!(pid, "process already gone");
            self.communicator.disconnect(node.id());
            self.mark_stopped(node, self.control.take_exit_code(pid));
            return Ok(true);
        }

        if self.communicator.is_connected(node.id()) {
            let secs = self.stop_grace.as_secs().max(1);
            match tokio::time::timeout(self.stop_grace, self.communicator.shutdown(node.id(), secs)).await {
                Ok(Ok(_)) => debug!("shutdown accepted"),
                Ok(Err(e)) => debug!("shutdown request failed: {e}"),
                Err(_) => debug!("shutdown request timed out"),
            }
        }
        self.communicator.disconnect(node.id());

        let outcome = match self.control.terminate(pid, self.stop_grace).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // leave it Running so a later stop can try again
                node.update(|s| s.run_state = RunState::Running);
                return Err(e);
            }
        };
        if outcome == TerminateOutcome::Forced {
            warn!(pid, "node had to be killed");
        }
        self.mark_stopped(node, self.control.take_exit_code(pid));
        info!(pid, ?outcome, "node stopped");
        Ok(true)
    }

    fn mark_stopped(&self, node: &ManagedNode, exit_code: Option<i32>) {
        node.update(|s| {
            s.run_state = RunState::Stopped;
            s.pid = None;
            s.health = HealthState::Unknown;
            s.last_exit_code = exit_code;
        });
        self.counters.stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop (when running) and start again, within the restart budget.
    #[instrument(skip(self, node), fields(node_id = %node.id()))]
    pub async fn restart(&self, node: &NodeRef) -> Result<u32, ProcessError> {
        self.check_restart_budget(node)?;
        self.stop(node).await?;
        sleep(self.limits.restart_delay).await;
        let pid = self.start(node).await?;
        node.update(|s| s.restart_count += 1);
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(pid)
    }

    fn check_restart_budget(&self, node: &ManagedNode) -> Result<(), ProcessError> {
        if node.restart_count() >= self.limits.max_restart_count {
            return Err(ProcessError::RestartLimit {
                node_id: node.id().to_string(),
                max: self.limits.max_restart_count,
            });
        }
        Ok(())
    }

    /// Start every stopped node; failures are logged and skipped.
    pub async fn start_all(&self, nodes: &[NodeRef]) -> usize {
        let mut started = 0;
        for node in nodes.iter().filter(|n| n.run_state() == RunState::Stopped) {
            match self.start(node).await {
                Ok(_) => started += 1,
                Err(e) => warn!(node_id = %node.id(), "start failed: {e}"),
            }
        }
        started
    }

    pub async fn stop_all(&self, nodes: &[NodeRef]) -> usize {
        let stops = nodes.iter().map(|node| async move {
            match self.stop(node).await {
                Ok(stopped) => stopped,
                Err(e) => {
                    warn!(node_id = %node.id(), "stop failed: {e}");
                    false
                }
            }
        });
        futures::future::join_all(stops).await.into_iter().filter(|s| *s).count()
    }

    /// Probe one node. Detects a dead process (counts a crash and restarts
    /// when allowed), reconnects a dropped connection, then calls `health`.
    /// Any failure marks the node unhealthy and returns false.
    pub async fn health_check(&self, node: &NodeRef) -> bool {
        if node.run_state() != RunState::Running {
            return false;
        }
        let Some(pid) = node.pid() else {
            return false;
        };

        if !self.control.is_alive(pid) {
            self.handle_crash(node, pid).await;
            return false;
        }

        if !self.communicator.is_connected(node.id()) {
            if let Err(e) = self.communicator.connect(node).await {
                debug!(node_id = %node.id(), "reconnect failed: {e}");
                self.record_health(node, false);
                return false;
            }
        }

        let healthy = match self.communicator.health(node.id()).await {
            Ok(h) => {
                if !h.healthy {
                    warn!(node_id = %node.id(), reason = ?h.reason, "node reports unhealthy");
                }
                h.healthy
            }
            Err(e) => {
                warn!(node_id = %node.id(), "health call failed: {e}");
                false
            }
        };
        self.record_health(node, healthy);
        healthy
    }

    fn record_health(&self, node: &ManagedNode, healthy: bool) {
        node.update(|s| {
            s.health = if healthy { HealthState::Healthy } else { HealthState::Unhealthy };
            s.last_health_check = Some(Utc::now());
        });
    }

    async fn handle_crash(&self, node: &NodeRef, pid: u32) {
        let exit_code = self.control.take_exit_code(pid);
        error!(node_id = %node.id(), pid, ?exit_code, "node process died");
        self.communicator.disconnect(node.id());
        node.update(|s| {
            s.run_state = RunState::Stopped;
            s.pid = None;
            s.health = HealthState::Unhealthy;
            s.last_exit_code = exit_code;
            s.last_health_check = Some(Utc::now());
        });
        self.counters.crashed.fetch_add(1, Ordering::Relaxed);

        if !self.auto_restart {
            return;
        }
        if let Err(e) = self.check_restart_budget(node) {
            warn!("{e}");
            return;
        }
        sleep(self.limits.restart_delay).await;
        match self.start(node).await {
            Ok(pid) => {
                node.update(|s| s.restart_count += 1);
                self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                info!(node_id = %node.id(), pid, "node restarted after crash");
            }
            Err(e) => error!(node_id = %node.id(), "restart after crash failed: {e}"),
        }
    }

    pub async fn health_check_all(&self, nodes: &[NodeRef]) -> HashMap<String, bool> {
        let checks = nodes.iter().map(|node| async move { (node.id().to_string(), self.health_check(node).await) });
        futures::future::join_all(checks).await.into_iter().collect()
    }
}

/// Puts a node left in `Starting` back to `Stopped` when `start` is dropped
/// before the spawn finished.
struct StartingGuard<'a>(&'a ManagedNode);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.update(|s| {
            if s.run_state == RunState::Starting {
                warn!(node_id = %self.0.id(), "start abandoned before the process came up");
                s.run_state = RunState::Stopped;
                s.pid = None;
            }
        });
    }
}

/// `./bin/node` style commands are relative to the manifest's directory;
/// bare names go through `PATH`.
fn resolve_program(command: &str, node_dir: &Path) -> String {
    let path = Path::new(command);
    let explicit_relative = matches!(path.components().next(), Some(Component::CurDir | Component::ParentDir));
    if explicit_relative && !node_dir.as_os_str().is_empty() {
        node_dir.join(path).to_string_lossy().into_owned()
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{manifest::NodeManifest, process::UnixProcessControl};
    use tempfile::TempDir;

    fn node(dir: &Path, id: &str, script: &str) -> NodeRef {
        let yaml = format!(
            "id: {id}\nname: {id}\nruntime:\n  command: /bin/sh\n  args: [\"-c\", {script:?}]\n"
        );
        let mut m = NodeManifest::from_yaml(&yaml).unwrap();
        m.resolve_socket_path(dir);
        ManagedNode::shared(m, dir.join(id).join("manifest.yaml"))
    }

    fn lifecycle(auto_restart: bool) -> ProcessLifecycle {
        let comm = Arc::new(NodeCommunicator::new(Duration::from_millis(200), Duration::from_millis(50)));
        ProcessLifecycle::new(
            Arc::new(UnixProcessControl::new()),
            comm,
            ProcessLimits { max_restart_count: 1, restart_delay: Duration::from_millis(10) },
            Duration::from_millis(300),
            auto_restart,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_then_stop() {
        let dir = TempDir::new().unwrap();
        let lc = lifecycle(false);
        let n = node(dir.path(), "sleeper", "exec sleep 30");

        let pid = lc.start(&n).await.unwrap();
        assert_eq!(n.pid(), Some(pid));
        assert_eq!(n.status_string(), "running-disconnected");
        assert!(matches!(lc.start(&n).await, Err(ProcessError::InvalidState { .. })));

        assert!(lc.stop(&n).await.unwrap());
        assert_eq!(n.status_string(), "stopped");
        assert!(!lc.stop(&n).await.unwrap());

        let stats = lc.stats();
        assert_eq!(stats.total_started, 1);
        assert_eq!(stats.total_stopped, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_after_external_exit_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let lc = lifecycle(false);
        let n = node(dir.path(), "quick", "exit 0");
        lc.start(&n).await.unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(lc.stop(&n).await.unwrap());
        assert!(!n.is_running());
        assert_eq!(lc.process_stats(&n).exit_code, Some(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn child_sees_its_identity() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("env.txt");
        let script = format!("echo \"$NODEFLOW_NODE_ID $NODEFLOW_SOCKET_PATH\" > {}", out.display());
        let lc = lifecycle(false);
        let n = node(dir.path(), "envy", &script);
        lc.start(&n).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        let text = std::fs::read_to_string(&out).unwrap();
        let expected = format!("envy {}", dir.path().join("nodeflow-node-envy.sock").display());
        assert_eq!(text.trim(), expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crash_is_detected_and_restarted_once() {
        let dir = TempDir::new().unwrap();
        let lc = lifecycle(true);
        let n = node(dir.path(), "crashy", "sleep 0.1; exit 7");
        lc.start(&n).await.unwrap();
        sleep(Duration::from_millis(400)).await;

        assert!(!lc.health_check(&n).await);
        assert!(n.is_running(), "auto restart should bring it back");
        assert_eq!(n.restart_count(), 1);

        sleep(Duration::from_millis(400)).await;
        assert!(!lc.health_check(&n).await);
        assert!(!n.is_running(), "restart budget is exhausted");
        assert_eq!(n.health(), HealthState::Unhealthy);

        let stats = lc.stats();
        assert_eq!(stats.total_crashed, 2);
        assert_eq!(stats.total_restarts, 1);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_node_stopped() {
        let dir = TempDir::new().unwrap();
        let lc = lifecycle(false);
        let mut m = NodeManifest::from_yaml("id: nope\nname: nope\nruntime: {command: /no/such/binary}\n").unwrap();
        m.resolve_socket_path(dir.path());
        let n = ManagedNode::shared(m, dir.path().join("manifest.yaml"));

        assert!(matches!(lc.start(&n).await, Err(ProcessError::Spawn { .. })));
        assert_eq!(n.run_state(), RunState::Stopped);
        assert_eq!(n.health(), HealthState::Unhealthy);
    }

    /// Never finishes spawning.
    struct StalledControl;

    #[async_trait::async_trait]
    impl ProcessControl for StalledControl {
        async fn start(&self, _spec: &LaunchSpec) -> Result<u32, ProcessError> {
            std::future::pending().await
        }

        async fn terminate(&self, _pid: u32, _grace: Duration) -> Result<TerminateOutcome, ProcessError> {
            Ok(TerminateOutcome::AlreadyExited)
        }

        fn is_alive(&self, _pid: u32) -> bool {
            false
        }

        fn take_exit_code(&self, _pid: u32) -> Option<i32> {
            None
        }
    }

    #[tokio::test]
    async fn abandoned_start_returns_the_node_to_stopped() {
        let dir = TempDir::new().unwrap();
        let comm = Arc::new(NodeCommunicator::new(Duration::from_millis(200), Duration::from_millis(50)));
        let lc = ProcessLifecycle::new(
            Arc::new(StalledControl),
            comm,
            ProcessLimits::default(),
            Duration::from_millis(300),
            false,
        );
        let n = node(dir.path(), "stuck", "exec sleep 30");

        let attempt = tokio::time::timeout(Duration::from_millis(50), lc.start(&n)).await;
        assert!(attempt.is_err());
        assert_eq!(n.run_state(), RunState::Stopped);
        assert_eq!(n.pid(), None);

        let lc = Arc::new(lc);
        let task = tokio::spawn({
            let (lc, n) = (lc.clone(), n.clone());
            async move { lc.start(&n).await }
        });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(n.run_state(), RunState::Starting);
        task.abort();
        let _ = task.await;
        assert_eq!(n.run_state(), RunState::Stopped);
    }

    #[test]
    fn relative_commands_resolve_against_the_node_dir() {
        assert_eq!(resolve_program("./run.sh", Path::new("/nodes/a")), "/nodes/a/./run.sh");
        assert_eq!(resolve_program("python3", Path::new("/nodes/a")), "python3");
        assert_eq!(resolve_program("/bin/sh", Path::new("/nodes/a")), "/bin/sh");
    }
}
