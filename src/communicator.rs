use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use node_protocol::{
    CallError, Codec, NodeClient, YamlCodec,
    envelope::{ExecuteResult, HealthResult, InfoResult, ShutdownResult, ValidateResult},
};
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{config::OrchestratorConfig, node::ManagedNode};

struct Link {
    node: Weak<ManagedNode>,
    client: Option<Arc<NodeClient>>,
}

/// Protocol calls addressed by node id.
///
/// Keeps one [`NodeClient`] per node. A call that finds its connection down
/// reconnects first; a call that fails at the transport level drops the
/// connection so the next call starts fresh. Read-only methods are retried
/// once on a new connection, `execute` and `shutdown` are not.
pub struct NodeCommunicator {
    links: DashMap<String, Link>,
    codec: Arc<dyn Codec>,
    call_timeout: Duration,
    connect_timeout: Duration,
}

impl std::fmt::Debug for NodeCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCommunicator")
            .field("nodes", &self.links.len())
            .field("codec", &self.codec.name())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl NodeCommunicator {
    pub fn new(call_timeout: Duration, connect_timeout: Duration) -> Self {
        Self::with_codec(Arc::new(YamlCodec), call_timeout, connect_timeout)
    }

    pub fn with_codec(codec: Arc<dyn Codec>, call_timeout: Duration, connect_timeout: Duration) -> Self {
        Self { links: DashMap::new(), codec, call_timeout, connect_timeout }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.call_timeout(), config.connect_timeout())
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Open a connection to the node's socket and remember it.
    pub async fn connect(&self, node: &Arc<ManagedNode>) -> Result<(), CallError> {
        let path = node.manifest().socket_path();
        let client = Arc::new(NodeClient::connect(node.id(), &path, self.codec.clone()).await?);
        node.attach_client(client.clone());
        if let Some(old) = self.links.insert(
            node.id().to_string(),
            Link { node: Arc::downgrade(node), client: Some(client) },
        ) {
            if let Some(c) = old.client {
                c.close();
            }
        }
        debug!(node_id = %node.id(), path = %path.display(), "connected");
        Ok(())
    }

    /// Keep trying to connect until the connect timeout runs out. A freshly
    /// spawned node needs a moment to bind its socket.
    pub async fn connect_with_retry(&self, node: &Arc<ManagedNode>) -> Result<(), CallError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut delay = Duration::from_millis(20);
        loop {
            match self.connect(node).await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() + delay >= deadline => return Err(e),
                Err(e) => {
                    debug!(node_id = %node.id(), "connect failed, retrying: {e}");
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(500));
                }
            }
        }
    }

    pub fn disconnect(&self, node_id: &str) -> bool {
        match self.links.remove(node_id) {
            Some((_, link)) => {
                if let Some(c) = link.client {
                    c.close();
                }
                if let Some(node) = link.node.upgrade() {
                    node.detach_client();
                }
                info!(node_id, "disconnected");
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.links
            .get(node_id)
            .and_then(|l| l.client.as_ref().map(|c| c.is_connected()))
            .unwrap_or(false)
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        self.links
            .iter()
            .filter(|l| l.client.as_ref().is_some_and(|c| c.is_connected()))
            .map(|l| l.key().clone())
            .collect()
    }

    async fn client_for(&self, node_id: &str) -> Result<Arc<NodeClient>, CallError> {
        let (current, node) = match self.links.get(node_id) {
            Some(link) => (link.client.clone(), link.node.upgrade()),
            None => return Err(CallError::NotConnected),
        };
        if let Some(client) = current.filter(|c| c.is_connected()) {
            return Ok(client);
        }
        let node = node.ok_or(CallError::NotConnected)?;
        info!(node_id, "reconnecting");
        self.connect(&node).await?;
        self.links
            .get(node_id)
            .and_then(|l| l.client.clone())
            .ok_or(CallError::NotConnected)
    }

    fn invalidate(&self, node_id: &str, broken: &Arc<NodeClient>) {
        if let Some(mut link) = self.links.get_mut(node_id) {
            if link.client.as_ref().is_some_and(|c| Arc::ptr_eq(c, broken)) {
                broken.close();
                link.client = None;
            }
        }
    }

    async fn with_client<T, F, Fut>(&self, node_id: &str, retry: bool, call: F) -> Result<T, CallError>
    where
        F: Fn(Arc<NodeClient>) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let client = self.client_for(node_id).await?;
        match call(client.clone()).await {
            Err(e) if e.is_transport() => {
                warn!(node_id, "transport failure: {e}");
                self.invalidate(node_id, &client);
                if retry {
                    let client = self.client_for(node_id).await?;
                    call(client).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    pub async fn info(&self, node_id: &str) -> Result<InfoResult, CallError> {
        let timeout = self.call_timeout;
        self.with_client(node_id, true, |c| async move { c.info(timeout).await }).await
    }

    pub async fn validate(&self, node_id: &str, input: Value) -> Result<ValidateResult, CallError> {
        let timeout = self.call_timeout;
        self.with_client(node_id, true, |c| {
            let input = input.clone();
            async move { c.validate(input, timeout).await }
        })
        .await
    }

    /// `timeout` overrides the default call timeout for this one execution.
    pub async fn execute(
        &self,
        node_id: &str,
        input: Value,
        context: Value,
        timeout: Option<Duration>,
    ) -> Result<ExecuteResult, CallError> {
        let timeout = timeout.unwrap_or(self.call_timeout);
        self.with_client(node_id, false, |c| {
            let (input, context) = (input.clone(), context.clone());
            async move { c.execute(input, context, timeout).await }
        })
        .await
    }

    pub async fn health(&self, node_id: &str) -> Result<HealthResult, CallError> {
        let timeout = self.call_timeout;
        self.with_client(node_id, true, |c| async move { c.health(timeout).await }).await
    }

    pub async fn shutdown(&self, node_id: &str, timeout_seconds: u64) -> Result<ShutdownResult, CallError> {
        let timeout = self.call_timeout;
        self.with_client(node_id, false, |c| async move { c.shutdown(timeout_seconds, timeout).await })
            .await
    }

    /// Health of every connected node; a failed call counts as unhealthy.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let ids = self.connected_nodes();
        let checks = ids.iter().map(|id| async move {
            let healthy = matches!(self.health(id).await, Ok(h) if h.healthy);
            (id.clone(), healthy)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }

    /// Ask every connected node to shut down, then drop all connections.
    pub async fn shutdown_all(&self, timeout_seconds: u64) {
        for id in self.connected_nodes() {
            if let Err(e) = self.shutdown(&id, timeout_seconds).await {
                debug!(node_id = %id, "shutdown request failed: {e}");
            }
        }
        let ids: Vec<String> = self.links.iter().map(|l| l.key().clone()).collect();
        for id in ids {
            self.disconnect(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::NodeManifest;

    #[tokio::test]
    async fn unknown_node_is_not_connected() {
        let comm = NodeCommunicator::new(Duration::from_millis(100), Duration::from_millis(100));
        assert!(matches!(comm.info("ghost").await, Err(CallError::NotConnected)));
        assert!(!comm.is_connected("ghost"));
        assert!(!comm.disconnect("ghost"));
    }

    #[tokio::test]
    async fn connect_retry_gives_up_at_the_deadline() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut manifest = NodeManifest::from_yaml("id: absent\nname: absent\nruntime: {command: x}\n").unwrap();
        manifest.resolve_socket_path(dir.path());
        let node = ManagedNode::shared(manifest, "manifest.yaml");

        let comm = NodeCommunicator::new(Duration::from_millis(100), Duration::from_millis(150));
        let started = Instant::now();
        let err = comm.connect_with_retry(&node).await.unwrap_err();
        assert!(matches!(err, CallError::Connect { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!node.is_connected());
    }
}
