use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use node_protocol::NodeClient;
use serde::Serialize;

use crate::manifest::NodeManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Mutable half of a node record.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub run_state: RunState,
    pub health: HealthState,
    /// Meaningful only while `run_state` is `Running`.
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub modified_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
}

/// A discovered node: its manifest, its process state and its connection.
pub struct ManagedNode {
    id: String,
    manifest_path: RwLock<PathBuf>,
    discovered_at: DateTime<Utc>,
    manifest: RwLock<Arc<NodeManifest>>,
    state: RwLock<NodeState>,
    client: RwLock<Option<Arc<NodeClient>>>,
}

pub type NodeRef = Arc<ManagedNode>;

impl ManagedNode {
    pub fn new(manifest: NodeManifest, manifest_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: manifest.id.clone(),
            manifest_path: RwLock::new(manifest_path.into()),
            discovered_at: now,
            manifest: RwLock::new(Arc::new(manifest)),
            state: RwLock::new(NodeState {
                run_state: RunState::Stopped,
                health: HealthState::Unknown,
                pid: None,
                restart_count: 0,
                modified_at: now,
                started_at: None,
                last_health_check: None,
                last_exit_code: None,
            }),
            client: RwLock::new(None),
        }
    }

    pub fn shared(manifest: NodeManifest, manifest_path: impl Into<PathBuf>) -> NodeRef {
        Arc::new(Self::new(manifest, manifest_path))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn manifest(&self) -> Arc<NodeManifest> {
        read(&self.manifest).clone()
    }

    pub fn node_type(&self) -> String {
        self.manifest().node_type().to_string()
    }

    pub fn manifest_path(&self) -> PathBuf {
        read(&self.manifest_path).clone()
    }

    /// Directory the manifest was found in.
    pub fn node_dir(&self) -> PathBuf {
        read(&self.manifest_path).parent().map(Path::to_path_buf).unwrap_or_default()
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    /// Swap in a re-parsed manifest and stamp the modification time.
    pub fn replace_manifest(&self, manifest: NodeManifest) {
        *write(&self.manifest) = Arc::new(manifest);
        write(&self.state).modified_at = Utc::now();
    }

    /// Point the record at a manifest that moved, keeping process and
    /// connection state.
    pub fn relocate(&self, manifest_path: impl Into<PathBuf>, manifest: NodeManifest) {
        *write(&self.manifest_path) = manifest_path.into();
        self.replace_manifest(manifest);
    }

    pub fn state(&self) -> NodeState {
        read(&self.state).clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        f(&mut write(&self.state))
    }

    pub fn run_state(&self) -> RunState {
        read(&self.state).run_state
    }

    pub fn health(&self) -> HealthState {
        read(&self.state).health
    }

    pub fn pid(&self) -> Option<u32> {
        let state = read(&self.state);
        state.pid.filter(|_| state.run_state == RunState::Running)
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthState::Healthy
    }

    pub fn restart_count(&self) -> u32 {
        read(&self.state).restart_count
    }

    pub fn uptime(&self) -> Duration {
        let state = read(&self.state);
        match (state.run_state, state.started_at) {
            (RunState::Running, Some(at)) => (Utc::now() - at).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn attach_client(&self, client: Arc<NodeClient>) {
        *write(&self.client) = Some(client);
    }

    pub fn detach_client(&self) -> Option<Arc<NodeClient>> {
        write(&self.client).take()
    }

    pub fn client(&self) -> Option<Arc<NodeClient>> {
        read(&self.client).clone()
    }

    pub fn is_connected(&self) -> bool {
        read(&self.client).as_ref().is_some_and(|c| c.is_connected())
    }

    /// `stopped`, `running-disconnected`, `running-unhealthy` or
    /// `running-healthy`, first match wins.
    pub fn status_string(&self) -> &'static str {
        if !self.is_running() {
            "stopped"
        } else if !self.is_connected() {
            "running-disconnected"
        } else if self.health() == HealthState::Unhealthy {
            "running-unhealthy"
        } else {
            "running-healthy"
        }
    }
}

impl fmt::Debug for ManagedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedNode")
            .field("id", &self.id)
            .field("manifest_path", &self.manifest_path())
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// A poisoned lock only means another thread panicked mid-update; the
// record is still the best information available.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
