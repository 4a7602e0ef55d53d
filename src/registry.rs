use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::PathBuf,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    discovery::DiscoveryEvent,
    manifest::NodeManifest,
    node::{ManagedNode, NodeRef},
    process::ProcessLifecycle,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node `{0}` is already registered")]
    Duplicate(String),
    #[error("node has no id")]
    EmptyNode,
    #[error("node `{0}` is not registered")]
    NotFound(String),
    #[error("no registered node provides type `{0}`")]
    UnknownType(String),
}

/// Registry entry: the node plus free-form labels.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node: NodeRef,
    pub categories: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(node: NodeRef) -> Self {
        let categories = node.manifest().categories.iter().cloned().collect();
        Self { node, categories, metadata: BTreeMap::new(), registered_at: Utc::now() }
    }

    pub fn id(&self) -> &str {
        self.node.id()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub running: usize,
    pub healthy: usize,
    pub types: BTreeMap<String, usize>,
    pub categories: BTreeMap<String, usize>,
}

/// Callbacks must not call back into the registry's write paths.
pub type RegisteredCallback = Box<dyn Fn(&NodeInfo) + Send + Sync>;
pub type UnregisteredCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Index {
    nodes: HashMap<String, NodeInfo>,
    by_type: HashMap<String, Vec<String>>,
    by_category: HashMap<String, Vec<String>>,
}

impl Index {
    fn link(&mut self, info: &NodeInfo) {
        let id = info.id().to_string();
        self.by_type.entry(info.node.node_type()).or_default().push(id.clone());
        for c in &info.categories {
            self.by_category.entry(c.clone()).or_default().push(id.clone());
        }
    }

    fn unlink(&mut self, info: &NodeInfo, node_type: &str) {
        let id = info.id();
        drop_from(&mut self.by_type, node_type, id);
        for c in &info.categories {
            drop_from(&mut self.by_category, c, id);
        }
    }
}

fn drop_from(index: &mut HashMap<String, Vec<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|i| i != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Catalog of known nodes by id, type and category.
///
/// One read/write lock covers the id map and both indexes. Callbacks run
/// after the lock is released, in the order they were added.
pub struct NodeRegistry {
    index: RwLock<Index>,
    on_registered: RwLock<Vec<RegisteredCallback>>,
    on_unregistered: RwLock<Vec<UnregisteredCallback>>,
    lifecycle: Option<Arc<ProcessLifecycle>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            on_registered: RwLock::new(Vec::new()),
            on_unregistered: RwLock::new(Vec::new()),
            lifecycle: None,
        }
    }

    /// Registry that stops a node's process when the node is unregistered.
    pub fn with_lifecycle(lifecycle: Arc<ProcessLifecycle>) -> Self {
        Self { lifecycle: Some(lifecycle), ..Self::new() }
    }

    pub fn lifecycle(&self) -> Option<&Arc<ProcessLifecycle>> {
        self.lifecycle.as_ref()
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_registered(&self, callback: impl Fn(&NodeInfo) + Send + Sync + 'static) {
        self.on_registered.write().unwrap_or_else(|e| e.into_inner()).push(Box::new(callback));
    }

    pub fn on_unregistered(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.on_unregistered.write().unwrap_or_else(|e| e.into_inner()).push(Box::new(callback));
    }

    fn callback_count(&self) -> usize {
        self.on_registered.read().map(|c| c.len()).unwrap_or(0)
            + self.on_unregistered.read().map(|c| c.len()).unwrap_or(0)
    }

    /// False, with nothing changed, for an empty id or an id already present.
    pub fn register(&self, node: NodeRef) -> bool {
        self.try_register(NodeInfo::new(node)).is_ok()
    }

    pub fn try_register(&self, info: NodeInfo) -> Result<(), RegistryError> {
        if info.id().is_empty() {
            return Err(RegistryError::EmptyNode);
        }
        {
            let mut index = self.write();
            if index.nodes.contains_key(info.id()) {
                return Err(RegistryError::Duplicate(info.id().to_string()));
            }
            index.link(&info);
            index.nodes.insert(info.id().to_string(), info.clone());
        }
        info!(node_id = %info.id(), node_type = %info.node.node_type(), "node registered");
        for cb in self.on_registered.read().unwrap_or_else(|e| e.into_inner()).iter() {
            cb(&info);
        }
        Ok(())
    }

    /// Remove the node, stop its process if one is running, then notify.
    /// False if the id is unknown.
    pub async fn unregister(&self, node_id: &str) -> bool {
        let removed = {
            let mut index = self.write();
            match index.nodes.remove(node_id) {
                Some(info) => {
                    // type index is keyed by the type at registration time
                    let node_type = index
                        .by_type
                        .iter()
                        .find(|(_, ids)| ids.iter().any(|i| i == node_id))
                        .map(|(t, _)| t.clone())
                        .unwrap_or_else(|| info.node.node_type());
                    index.unlink(&info, &node_type);
                    Some(info)
                }
                None => None,
            }
        };
        let Some(info) = removed else {
            return false;
        };

        if let Some(lifecycle) = &self.lifecycle {
            if info.node.is_running() {
                if let Err(e) = lifecycle.stop(&info.node).await {
                    warn!(node_id, "stop during unregister failed: {e}");
                }
            }
            lifecycle.communicator().disconnect(node_id);
        }
        info!(node_id, "node unregistered");
        for cb in self.on_unregistered.read().unwrap_or_else(|e| e.into_inner()).iter() {
            cb(node_id);
        }
        true
    }

    /// Swap in a new manifest for a registered node, reindexing if its
    /// type or categories changed.
    pub fn update_manifest(&self, node_id: &str, manifest: NodeManifest) -> Result<(), RegistryError> {
        self.reindex(node_id, |node| node.replace_manifest(manifest))
    }

    /// Like `update_manifest`, for a manifest that now lives at another path.
    pub fn relocate(&self, node_id: &str, manifest_path: PathBuf, manifest: NodeManifest) -> Result<(), RegistryError> {
        self.reindex(node_id, |node| node.relocate(manifest_path, manifest))
    }

    fn reindex(&self, node_id: &str, change: impl FnOnce(&ManagedNode)) -> Result<(), RegistryError> {
        let mut index = self.write();
        let info = index.nodes.get(node_id).cloned().ok_or_else(|| RegistryError::NotFound(node_id.into()))?;
        let old_type = info.node.node_type();
        index.unlink(&info, &old_type);
        change(&info.node);
        let refreshed = NodeInfo {
            categories: info.node.manifest().categories.iter().cloned().collect(),
            ..info
        };
        index.link(&refreshed);
        index.nodes.insert(node_id.to_string(), refreshed);
        Ok(())
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.read().nodes.contains_key(node_id)
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeRef> {
        self.read().nodes.get(node_id).map(|i| i.node.clone())
    }

    pub fn get_info(&self, node_id: &str) -> Option<NodeInfo> {
        self.read().nodes.get(node_id).cloned()
    }

    pub fn set_metadata(&self, node_id: &str, key: &str, value: &str) -> Result<(), RegistryError> {
        let mut index = self.write();
        let info = index.nodes.get_mut(node_id).ok_or_else(|| RegistryError::NotFound(node_id.into()))?;
        info.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn add_category(&self, node_id: &str, category: &str) -> Result<(), RegistryError> {
        let mut index = self.write();
        let info = index.nodes.get_mut(node_id).ok_or_else(|| RegistryError::NotFound(node_id.into()))?;
        if info.categories.insert(category.to_string()) {
            index.by_category.entry(category.to_string()).or_default().push(node_id.to_string());
        }
        Ok(())
    }

    /// First registered node of `node_type`.
    pub fn resolve_type(&self, node_type: &str) -> Result<NodeRef, RegistryError> {
        let index = self.read();
        index
            .by_type
            .get(node_type)
            .and_then(|ids| ids.first())
            .and_then(|id| index.nodes.get(id))
            .map(|i| i.node.clone())
            .ok_or_else(|| RegistryError::UnknownType(node_type.to_string()))
    }

    pub fn nodes_by_type(&self, node_type: &str) -> Vec<NodeRef> {
        self.collect(|index| index.by_type.get(node_type).cloned().unwrap_or_default())
    }

    pub fn nodes_by_category(&self, category: &str) -> Vec<NodeRef> {
        self.collect(|index| index.by_category.get(category).cloned().unwrap_or_default())
    }

    fn collect(&self, ids: impl FnOnce(&Index) -> Vec<String>) -> Vec<NodeRef> {
        let index = self.read();
        ids(&index).iter().filter_map(|id| index.nodes.get(id)).map(|i| i.node.clone()).collect()
    }

    /// Every node, ordered by id.
    pub fn all_nodes(&self) -> Vec<NodeRef> {
        let index = self.read();
        let mut nodes: Vec<NodeRef> = index.nodes.values().map(|i| i.node.clone()).collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.all_nodes().iter().map(|n| n.id().to_string()).collect()
    }

    pub fn registered_count(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn running_count(&self) -> usize {
        self.read().nodes.values().filter(|i| i.node.is_running()).count()
    }

    pub fn healthy_count(&self) -> usize {
        self.read().nodes.values().filter(|i| i.node.is_healthy()).count()
    }

    pub fn type_statistics(&self) -> BTreeMap<String, usize> {
        self.read().by_type.iter().map(|(t, ids)| (t.clone(), ids.len())).collect()
    }

    pub fn category_statistics(&self) -> BTreeMap<String, usize> {
        self.read().by_category.iter().map(|(c, ids)| (c.clone(), ids.len())).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.registered_count(),
            running: self.running_count(),
            healthy: self.healthy_count(),
            types: self.type_statistics(),
            categories: self.category_statistics(),
        }
    }

    /// Unregister everything, stopping processes along the way.
    pub async fn clear(&self) -> usize {
        let ids: Vec<String> = self.read().nodes.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.unregister(&id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Mirror one discovery event into registration state.
    ///
    /// Events are matched on the manifest file as well as the id: a file that
    /// lost a duplicate-id race never touches the registered node.
    pub async fn apply(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Discovered { node_id, manifest_path, manifest }
            | DiscoveryEvent::Changed { node_id, manifest_path, manifest } => {
                self.register_or_update(node_id, manifest_path, *manifest).await;
            }
            DiscoveryEvent::Lost { node_id, manifest_path } => {
                match self.get_node(&node_id) {
                    Some(node) if node.manifest_path() == manifest_path => {
                        self.unregister(&node_id).await;
                    }
                    Some(_) => {
                        debug!(node_id = %node_id, path = %manifest_path.display(), "ignored duplicate manifest removed");
                    }
                    None => debug!(node_id = %node_id, "lost node was not registered"),
                }
            }
        }
    }

    async fn register_or_update(&self, node_id: String, manifest_path: PathBuf, manifest: NodeManifest) {
        let Some(existing) = self.get_node(&node_id) else {
            if !self.register(ManagedNode::shared(manifest, manifest_path)) {
                warn!(node_id = %node_id, "registration rejected");
            }
            return;
        };

        let current = existing.manifest_path();
        let result = if current == manifest_path {
            self.update_manifest(&node_id, manifest).map(|_| "manifest updated")
        } else if tokio::fs::try_exists(&current).await.unwrap_or(true) {
            warn!(node_id = %node_id, path = %manifest_path.display(), "duplicate node id, ignoring manifest");
            return;
        } else {
            // the registered file is gone, so this is the same node after a move
            self.relocate(&node_id, manifest_path.clone(), manifest).map(|_| "manifest moved")
        };
        match result {
            Ok(what) => info!(node_id = %node_id, path = %manifest_path.display(), "{what}"),
            Err(e) => warn!("{e}"),
        }
    }

    /// Drain the discovery queue on its own task until the sender closes.
    pub fn consume(self: &Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(kind = event.kind(), node_id = %event.node_id(), "discovery event");
                registry.apply(event).await;
            }
            debug!("discovery queue closed");
        })
    }
}

impl fmt::Display for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (nodes, types, categories) = {
            let index = self.read();
            (index.nodes.len(), index.by_type.len(), index.by_category.len())
        };
        write!(
            f,
            "NodeRegistry{{nodes={nodes},types={types},categories={categories},callbacks={}}}",
            self.callback_count()
        )
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(id: &str, node_type: Option<&str>, categories: &[&str]) -> NodeRef {
        let mut m = NodeManifest::from_yaml(&format!("id: \"{id}\"\nname: n\nruntime: {{command: /bin/true}}\n")).unwrap();
        m.node_type = node_type.map(String::from);
        m.categories = categories.iter().map(|c| c.to_string()).collect();
        ManagedNode::shared(m, format!("/nodes/{id}/manifest.yaml"))
    }

    #[tokio::test]
    async fn register_then_unregister() {
        let reg = NodeRegistry::new();
        assert!(reg.register(node("a", None, &[])));
        assert!(reg.has_node("a"));
        assert!(reg.get_node("a").is_some());

        assert!(reg.unregister("a").await);
        assert!(!reg.has_node("a"));
        assert!(reg.get_node("a").is_none());
        assert!(!reg.unregister("a").await);
    }

    #[test]
    fn duplicates_and_empty_ids_are_rejected() {
        let reg = NodeRegistry::new();
        let first = node("a", Some("alpha"), &[]);
        assert!(reg.register(first.clone()));
        assert!(!reg.register(node("a", Some("beta"), &["x"])));
        assert!(!reg.register(node("", None, &[])));

        assert_eq!(reg.registered_count(), 1);
        assert!(Arc::ptr_eq(&reg.get_node("a").unwrap(), &first));
        assert!(reg.nodes_by_type("beta").is_empty());
        assert!(reg.category_statistics().is_empty());
    }

    #[tokio::test]
    async fn callbacks_fire_in_order() {
        let reg = NodeRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            reg.on_registered(move |info| order.lock().unwrap().push(format!("{tag}:{}", info.id())));
        }
        let gone = Arc::new(AtomicUsize::new(0));
        let g = gone.clone();
        reg.on_unregistered(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });

        reg.register(node("a", None, &[]));
        reg.unregister("a").await;
        assert_eq!(*order.lock().unwrap(), vec!["first:a", "second:a"]);
        assert_eq!(gone.load(Ordering::SeqCst), 1);
        assert_eq!(reg.to_string(), "NodeRegistry{nodes=0,types=0,categories=0,callbacks=3}");
    }

    #[tokio::test]
    async fn type_and_category_indexes() {
        let reg = NodeRegistry::new();
        reg.register(node("a", Some("analyzer"), &["text", "metrics"]));
        reg.register(node("b", Some("analyzer"), &["text"]));
        reg.register(node("c", None, &[]));

        assert_eq!(reg.nodes_by_type("analyzer").len(), 2);
        assert_eq!(reg.resolve_type("analyzer").unwrap().id(), "a");
        assert_eq!(reg.resolve_type("c").unwrap().id(), "c");
        assert_eq!(reg.resolve_type("zzz").unwrap_err(), RegistryError::UnknownType("zzz".into()));
        assert_eq!(reg.nodes_by_category("text").len(), 2);
        assert_eq!(reg.category_statistics().get("metrics"), Some(&1));
        assert_eq!(reg.to_string(), "NodeRegistry{nodes=3,types=2,categories=2,callbacks=0}");

        reg.unregister("a").await;
        assert_eq!(reg.resolve_type("analyzer").unwrap().id(), "b");
        assert_eq!(reg.category_statistics().get("metrics"), None);
        assert_eq!(reg.all_nodes().iter().map(|n| n.id()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn discovery_events_mirror_into_registration() {
        let reg = NodeRegistry::new();
        let n = node("a", Some("old"), &[]);
        let manifest = (*n.manifest()).clone();
        let path = PathBuf::from("/nodes/a/manifest.yaml");

        reg.apply(DiscoveryEvent::Discovered {
            node_id: "a".into(),
            manifest_path: path.clone(),
            manifest: Box::new(manifest.clone()),
        })
        .await;
        assert!(reg.has_node("a"));

        let mut changed = manifest;
        changed.node_type = Some("new".into());
        reg.apply(DiscoveryEvent::Changed {
            node_id: "a".into(),
            manifest_path: path.clone(),
            manifest: Box::new(changed),
        })
        .await;
        assert!(reg.nodes_by_type("old").is_empty());
        assert_eq!(reg.resolve_type("new").unwrap().id(), "a");

        reg.apply(DiscoveryEvent::Lost { node_id: "a".into(), manifest_path: path }).await;
        assert!(!reg.has_node("a"));
    }

    fn on_disk(dir: &std::path::Path, sub: &str, name: &str) -> (PathBuf, NodeManifest) {
        let folder = dir.join(sub);
        std::fs::create_dir_all(&folder).unwrap();
        let path = folder.join("manifest.yaml");
        let yaml = format!("id: dup\nname: {name}\nruntime: {{command: /bin/true}}\n");
        std::fs::write(&path, &yaml).unwrap();
        (path, NodeManifest::from_yaml(&yaml).unwrap())
    }

    fn discovered(path: &std::path::Path, manifest: &NodeManifest) -> DiscoveryEvent {
        DiscoveryEvent::Discovered {
            node_id: manifest.id.clone(),
            manifest_path: path.to_path_buf(),
            manifest: Box::new(manifest.clone()),
        }
    }

    #[tokio::test]
    async fn same_id_from_another_file_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let (first, original) = on_disk(dir.path(), "a", "original");
        let (second, impostor) = on_disk(dir.path(), "b", "impostor");
        let reg = NodeRegistry::new();
        reg.apply(discovered(&first, &original)).await;
        reg.apply(discovered(&second, &impostor)).await;
        assert_eq!(reg.get_node("dup").unwrap().manifest().name, "original");
        assert_eq!(reg.get_node("dup").unwrap().manifest_path(), first);
    }

    #[tokio::test]
    async fn removing_the_ignored_duplicate_keeps_the_node() {
        let dir = tempfile::TempDir::new().unwrap();
        let (first, original) = on_disk(dir.path(), "a", "original");
        let (second, impostor) = on_disk(dir.path(), "b", "impostor");
        let reg = NodeRegistry::new();
        reg.apply(discovered(&first, &original)).await;
        reg.apply(discovered(&second, &impostor)).await;

        std::fs::remove_file(&second).unwrap();
        reg.apply(DiscoveryEvent::Lost { node_id: "dup".into(), manifest_path: second }).await;
        assert!(reg.has_node("dup"));

        reg.apply(DiscoveryEvent::Lost { node_id: "dup".into(), manifest_path: first }).await;
        assert!(!reg.has_node("dup"));
    }

    #[tokio::test]
    async fn moved_manifest_keeps_the_same_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let (old_path, manifest) = on_disk(dir.path(), "a", "mover");
        let reg = NodeRegistry::new();
        reg.apply(discovered(&old_path, &manifest)).await;
        let before = reg.get_node("dup").unwrap();

        let new_path = dir.path().join("z").join("manifest.yaml");
        std::fs::rename(dir.path().join("a"), dir.path().join("z")).unwrap();
        // a full scan reports the new location before the old one goes missing
        reg.apply(discovered(&new_path, &manifest)).await;
        reg.apply(DiscoveryEvent::Lost { node_id: "dup".into(), manifest_path: old_path }).await;

        let after = reg.get_node("dup").expect("node survives the move");
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.manifest_path(), new_path);
        assert_eq!(reg.registered_count(), 1);
    }
}
