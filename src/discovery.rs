use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{config::OrchestratorConfig, manifest::NodeManifest};

/// What the scanner saw change on disk since its previous pass.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Discovered {
        node_id: String,
        manifest_path: PathBuf,
        manifest: Box<NodeManifest>,
    },
    Changed {
        node_id: String,
        manifest_path: PathBuf,
        manifest: Box<NodeManifest>,
    },
    Lost {
        node_id: String,
        manifest_path: PathBuf,
    },
}

impl DiscoveryEvent {
    pub fn node_id(&self) -> &str {
        match self {
            DiscoveryEvent::Discovered { node_id, .. }
            | DiscoveryEvent::Changed { node_id, .. }
            | DiscoveryEvent::Lost { node_id, .. } => node_id,
        }
    }

    pub fn manifest_path(&self) -> &Path {
        match self {
            DiscoveryEvent::Discovered { manifest_path, .. }
            | DiscoveryEvent::Changed { manifest_path, .. }
            | DiscoveryEvent::Lost { manifest_path, .. } => manifest_path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryEvent::Discovered { .. } => "discovered",
            DiscoveryEvent::Changed { .. } => "changed",
            DiscoveryEvent::Lost { .. } => "lost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self { modified: meta.modified().ok(), len: meta.len() })
    }
}

#[derive(Debug)]
struct Seen {
    fingerprint: Fingerprint,
    /// `None` while the file fails to parse or validate.
    node_id: Option<String>,
}

/// Manifest files known so far and the node id each one declared.
/// Every method here does blocking filesystem I/O.
#[derive(Debug)]
struct Tracker {
    root: PathBuf,
    manifest_names: Vec<String>,
    socket_dir: PathBuf,
    seen: HashMap<PathBuf, Seen>,
    /// Which file the registry is expected to hold for each id. The first
    /// file wins; a later one takes over only once the owner is gone.
    owners: HashMap<String, PathBuf>,
}

impl Tracker {
    fn is_manifest(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.manifest_names.iter().any(|c| c == n))
    }

    /// Full pass: events in traversal order, then `Lost` for every tracked
    /// file that was not encountered.
    fn scan(&mut self) -> Vec<DiscoveryEvent> {
        let mut found = Vec::new();
        if self.root.is_dir() {
            self.walk(&self.root.clone(), &mut found);
        } else {
            debug!(root = %self.root.display(), "discovery root does not exist");
        }

        let mut events = Vec::new();
        let mut visited = HashSet::new();
        for path in found {
            visited.insert(path.clone());
            self.inspect(path, &mut events);
        }
        let gone: Vec<PathBuf> = self.seen.keys().filter(|p| !visited.contains(*p)).cloned().collect();
        for path in gone {
            self.forget(path, &mut events);
        }
        events
    }

    /// Re-examine one path the watcher reported. A directory is walked for
    /// manifests, and anything tracked at or below `path` that no longer
    /// exists is reported lost.
    fn refresh(&mut self, path: &Path) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        if path.is_dir() {
            let mut found = Vec::new();
            self.walk(path, &mut found);
            for p in found {
                self.inspect(p, &mut events);
            }
        } else if path.is_file() && self.is_manifest(path) {
            self.inspect(path.to_path_buf(), &mut events);
        }
        let gone: Vec<PathBuf> =
            self.seen.keys().filter(|p| p.starts_with(path) && !p.is_file()).cloned().collect();
        for p in gone {
            self.forget(p, &mut events);
        }
        events
    }

    fn walk(&self, dir: &Path, found: &mut Vec<PathBuf>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), "cannot read directory: {e}");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => self.walk(&path, found),
                Ok(_) if self.is_manifest(&path) => found.push(path),
                _ => {}
            }
        }
    }

    fn inspect(&mut self, path: PathBuf, events: &mut Vec<DiscoveryEvent>) {
        let Some(fingerprint) = Fingerprint::of(&path) else {
            return;
        };
        let previous = self.seen.get(&path);
        if previous.is_some_and(|s| s.fingerprint == fingerprint) {
            return;
        }
        let previous_id = previous.and_then(|s| s.node_id.clone());

        let mut replaced = None;
        let node_id = match self.load(&path) {
            Some(manifest) => {
                let node_id = manifest.id.clone();
                match previous_id {
                    Some(old) if old == node_id => {
                        info!(node_id = %node_id, path = %path.display(), "manifest changed");
                        events.push(DiscoveryEvent::Changed {
                            node_id: node_id.clone(),
                            manifest_path: path.clone(),
                            manifest: Box::new(manifest),
                        });
                    }
                    other => {
                        if let Some(old) = other {
                            info!(node_id = %old, new_id = %node_id, "manifest now describes another node");
                            events.push(DiscoveryEvent::Lost { node_id: old.clone(), manifest_path: path.clone() });
                            replaced = Some(old);
                        }
                        info!(node_id = %node_id, path = %path.display(), "node discovered");
                        self.claim(&node_id, &path);
                        events.push(DiscoveryEvent::Discovered {
                            node_id: node_id.clone(),
                            manifest_path: path.clone(),
                            manifest: Box::new(manifest),
                        });
                    }
                }
                Some(node_id)
            }
            None => {
                if let Some(old) = previous_id {
                    events.push(DiscoveryEvent::Lost { node_id: old.clone(), manifest_path: path.clone() });
                    replaced = Some(old);
                }
                None
            }
        };
        self.seen.insert(path.clone(), Seen { fingerprint, node_id });
        if let Some(old) = replaced {
            self.release(&old, &path, events);
        }
    }

    fn forget(&mut self, path: PathBuf, events: &mut Vec<DiscoveryEvent>) {
        if let Some(Seen { node_id: Some(node_id), .. }) = self.seen.remove(&path) {
            info!(node_id = %node_id, path = %path.display(), "manifest removed");
            events.push(DiscoveryEvent::Lost { node_id: node_id.clone(), manifest_path: path.clone() });
            self.release(&node_id, &path, events);
        }
    }

    fn claim(&mut self, node_id: &str, path: &Path) {
        let held = self.owners.get(node_id).is_some_and(|owner| owner != path && owner.is_file());
        if !held {
            self.owners.insert(node_id.to_string(), path.to_path_buf());
        }
    }

    /// `path` no longer declares `node_id`. If it was the owner, hand the id
    /// to another tracked file declaring it and announce that file.
    fn release(&mut self, node_id: &str, path: &Path, events: &mut Vec<DiscoveryEvent>) {
        if self.owners.get(node_id).is_none_or(|owner| owner != path) {
            return;
        }
        self.owners.remove(node_id);
        let mut candidates: Vec<PathBuf> = self
            .seen
            .iter()
            .filter(|(_, s)| s.node_id.as_deref() == Some(node_id))
            .map(|(p, _)| p.clone())
            .collect();
        candidates.sort();
        for candidate in candidates {
            if let Some(manifest) = self.load(&candidate) {
                info!(node_id, path = %candidate.display(), "duplicate manifest takes over");
                self.claim(node_id, &candidate);
                events.push(DiscoveryEvent::Discovered {
                    node_id: node_id.to_string(),
                    manifest_path: candidate,
                    manifest: Box::new(manifest),
                });
                return;
            }
        }
    }

    fn load(&self, path: &Path) -> Option<NodeManifest> {
        let mut manifest = match NodeManifest::from_file(path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), "skipping manifest: {e}");
                return None;
            }
        };
        manifest.resolve_socket_path(&self.socket_dir);
        if let Err(e) = manifest.ensure_valid() {
            warn!(path = %path.display(), "skipping manifest: {e}");
            return None;
        }
        Some(manifest)
    }
}

/// Watches a directory tree for node manifests and reports additions,
/// modifications and removals through a bounded queue.
///
/// The background loop is driven by a `notify` poll watcher. Filesystem work
/// runs on the blocking pool.
#[derive(Debug)]
pub struct DiscoveryScanner {
    root: PathBuf,
    scan_interval: Duration,
    tracker: Arc<Mutex<Tracker>>,
    events: mpsc::Sender<DiscoveryEvent>,
}

impl DiscoveryScanner {
    pub fn new(
        root: impl Into<PathBuf>,
        manifest_names: Vec<String>,
        socket_dir: impl Into<PathBuf>,
        scan_interval: Duration,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let root = root.into();
        let (events, rx) = mpsc::channel(capacity.max(1));
        let tracker = Tracker {
            root: root.clone(),
            manifest_names,
            socket_dir: socket_dir.into(),
            seen: HashMap::new(),
            owners: HashMap::new(),
        };
        let scanner = Self { root, scan_interval, tracker: Arc::new(Mutex::new(tracker)), events };
        (scanner, rx)
    }

    pub fn from_config(config: &OrchestratorConfig) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        Self::new(
            config.nodes_dir.clone(),
            config.manifest_names.clone(),
            config.socket_dir.clone(),
            config.scan_interval(),
            config.event_queue_capacity,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of manifests currently tracked with a usable node id.
    pub fn discovered_count(&self) -> usize {
        self.tracker().seen.values().filter(|s| s.node_id.is_some()).count()
    }

    pub fn discovered_ids(&self) -> Vec<String> {
        self.tracker().seen.values().filter_map(|s| s.node_id.clone()).collect()
    }

    /// One full pass over the tree on the calling thread.
    pub fn scan_once(&mut self) -> Vec<DiscoveryEvent> {
        self.tracker().scan()
    }

    /// `scan_once` on the blocking pool.
    pub async fn scan(&self) -> Vec<DiscoveryEvent> {
        self.blocking(|t| t.scan()).await
    }

    async fn refresh(&self, paths: Vec<PathBuf>) -> Vec<DiscoveryEvent> {
        self.blocking(move |t| paths.iter().flat_map(|p| t.refresh(p)).collect()).await
    }

    async fn blocking<F>(&self, work: F) -> Vec<DiscoveryEvent>
    where
        F: FnOnce(&mut Tracker) -> Vec<DiscoveryEvent> + Send + 'static,
    {
        let tracker = Arc::clone(&self.tracker);
        let task = tokio::task::spawn_blocking(move || work(&mut tracker.lock().unwrap_or_else(|e| e.into_inner())));
        match task.await {
            Ok(events) => events,
            Err(e) => {
                warn!("discovery pass failed: {e}");
                Vec::new()
            }
        }
    }

    /// Scan once and push the events into the queue, waiting for room when it
    /// is full. Returns how many were delivered; stops early if the consumer is gone.
    pub async fn publish_once(&mut self) -> usize {
        let mut sent = 0;
        for event in self.scan().await {
            if self.events.send(event).await.is_err() {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Start a poll watcher on the root. Walks the tree, so it runs on the
    /// blocking pool.
    async fn watch(&self, sink: mpsc::UnboundedSender<notify::Result<Event>>) -> notify::Result<PollWatcher> {
        let root = self.root.clone();
        let config = Config::default().with_poll_interval(self.scan_interval.max(Duration::from_millis(1)));
        let attach = tokio::task::spawn_blocking(move || {
            if !root.is_dir() {
                return Err(notify::Error::path_not_found().add_path(root));
            }
            let mut watcher = PollWatcher::new(
                move |res: notify::Result<Event>| {
                    let _ = sink.send(res);
                },
                config,
            )?;
            watcher.watch(&root, RecursiveMode::Recursive)?;
            Ok(watcher)
        });
        attach.await.unwrap_or_else(|e| Err(notify::Error::generic(&e.to_string())))
    }

    /// Deliver a batch in order. False once stopped or the consumer is gone.
    async fn forward(&self, events: Vec<DiscoveryEvent>, stop_rx: &mut watch::Receiver<bool>) -> bool {
        for event in events {
            tokio::select! {
                res = self.events.send(event) => {
                    if res.is_err() {
                        debug!("discovery consumer gone");
                        return false;
                    }
                }
                _ = stop_rx.changed() => return false,
            }
        }
        true
    }

    /// Run discovery on its own task until stopped or the consumer drops.
    ///
    /// A full scan runs once the root can be watched. After that only the
    /// paths the watcher reports are re-examined. While the root is missing,
    /// attaching is retried every scan interval.
    pub fn spawn(self) -> ScannerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            info!(root = %self.root.display(), every = ?self.scan_interval, "discovery started");
            let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
            let mut watcher: Option<PollWatcher> = None;
            let mut retry = interval(self.scan_interval.max(Duration::from_millis(1)));
            retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = retry.tick(), if watcher.is_none() => {
                        match self.watch(fs_tx.clone()).await {
                            Ok(w) => {
                                watcher = Some(w);
                                if !self.forward(self.scan().await, &mut stop_rx).await {
                                    return;
                                }
                            }
                            Err(e) => debug!(root = %self.root.display(), "cannot watch yet: {e}"),
                        }
                    }
                    Some(res) = fs_rx.recv() => match res {
                        Ok(Event { kind: EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_), paths, .. }) => {
                            let events = self.refresh(paths).await;
                            if !self.forward(events, &mut stop_rx).await {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("watcher error: {e}"),
                    },
                }
            }
            info!("discovery stopped");
        });
        ScannerHandle { stop_tx, join }
    }
}

pub struct ScannerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ScannerHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown(self) {
        self.stop();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, id: &str, command: &str) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join("manifest.yaml");
        fs::write(&path, format!("id: {id}\nname: {id}\nruntime:\n  command: {command}\n")).unwrap();
        path
    }

    fn scanner(root: &Path) -> (DiscoveryScanner, mpsc::Receiver<DiscoveryEvent>) {
        DiscoveryScanner::new(
            root,
            vec!["manifest.yaml".into(), "node.yaml".into()],
            "/tmp",
            Duration::from_millis(20),
            8,
        )
    }

    #[test]
    fn missing_root_is_a_quiet_noop() {
        let dir = TempDir::new().unwrap();
        let (mut s, _rx) = scanner(&dir.path().join("absent"));
        assert!(s.scan_once().is_empty());
    }

    #[test]
    fn finds_nested_manifests_once() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir.path().join("a"), "alpha", "/bin/true");
        write_manifest(&dir.path().join("group/b"), "beta", "/bin/true");
        fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

        let (mut s, _rx) = scanner(dir.path());
        let events = s.scan_once();
        let mut ids: Vec<_> = events.iter().map(|e| e.node_id().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["alpha", "beta"]);
        assert!(events.iter().all(|e| e.kind() == "discovered"));
        if let DiscoveryEvent::Discovered { manifest, .. } = &events[0] {
            assert!(manifest.communication.socket_path.starts_with("/tmp/nodeflow-node-"));
        }

        assert!(s.scan_once().is_empty());
        assert_eq!(s.discovered_count(), 2);
    }

    #[test]
    fn modification_and_removal_are_reported() {
        let dir = TempDir::new().unwrap();
        let path = write_manifest(&dir.path().join("a"), "alpha", "/bin/true");
        let (mut s, _rx) = scanner(dir.path());
        assert_eq!(s.scan_once().len(), 1);

        // a longer file changes the fingerprint even within one mtime tick
        fs::write(&path, "id: alpha\nname: Alpha Node\nruntime:\n  command: /bin/false\n").unwrap();
        let events = s.scan_once();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DiscoveryEvent::Changed { manifest, .. } => assert_eq!(manifest.runtime.command, "/bin/false"),
            other => panic!("expected changed, got {other:?}"),
        }

        fs::remove_file(&path).unwrap();
        let events = s.scan_once();
        assert_eq!(events, vec![DiscoveryEvent::Lost { node_id: "alpha".into(), manifest_path: path }]);
        assert_eq!(s.discovered_count(), 0);
    }

    #[test]
    fn bad_manifest_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("manifest.yaml"), "id: [broken").unwrap();
        write_manifest(&dir.path().join("empty_cmd"), "nocmd", "\"\"");
        write_manifest(&dir.path().join("good"), "good", "/bin/true");

        let (mut s, _rx) = scanner(dir.path());
        let events = s.scan_once();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].node_id(), "good");

        // fixing the broken file later surfaces it as a new node
        fs::write(bad.join("manifest.yaml"), "id: fixed\nname: fixed\nruntime: {command: /bin/true}\n").unwrap();
        let events = s.scan_once();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "discovered");
        assert_eq!(events[0].node_id(), "fixed");
    }

    #[tokio::test]
    async fn loop_delivers_through_the_queue() {
        let dir = TempDir::new().unwrap();
        let (s, mut rx) = scanner(dir.path());
        let handle = s.spawn();

        write_manifest(&dir.path().join("late"), "late", "/bin/true");
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.node_id(), "late");

        handle.shutdown().await;
    }

    #[test]
    fn duplicate_id_is_offered_again_when_its_rival_goes() {
        let dir = TempDir::new().unwrap();
        let first = write_manifest(&dir.path().join("a"), "dup", "/bin/true");
        let (mut s, _rx) = scanner(dir.path());
        assert_eq!(s.scan_once().len(), 1);
        let second = write_manifest(&dir.path().join("b"), "dup", "/bin/true");
        assert_eq!(s.scan_once().len(), 1);

        // dropping the file that never owned the id changes nothing else
        let third = write_manifest(&dir.path().join("c"), "dup", "/bin/true");
        s.scan_once();
        fs::remove_dir_all(dir.path().join("c")).unwrap();
        assert_eq!(s.scan_once(), vec![DiscoveryEvent::Lost { node_id: "dup".into(), manifest_path: third }]);

        fs::remove_dir_all(dir.path().join("a")).unwrap();
        let events = s.scan_once();
        let seen: Vec<_> = events.iter().map(|e| (e.kind(), e.manifest_path().to_path_buf())).collect();
        assert_eq!(seen, vec![("lost", first), ("discovered", second)]);
    }

    #[test]
    fn moved_directory_is_found_before_the_old_path_is_lost() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir.path().join("a"), "mover", "/bin/true");
        let (mut s, _rx) = scanner(dir.path());
        assert_eq!(s.scan_once().len(), 1);

        fs::rename(dir.path().join("a"), dir.path().join("z")).unwrap();
        let events = s.scan_once();
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["discovered", "lost"]);
        assert_eq!(events[0].manifest_path(), dir.path().join("z/manifest.yaml"));
        assert!(s.scan_once().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_reports_moves_and_removals() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir.path().join("a"), "mover", "/bin/true");
        let (s, mut rx) = scanner(dir.path());
        let handle = s.spawn();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!((first.kind(), first.node_id()), ("discovered", "mover"));

        fs::rename(dir.path().join("a"), dir.path().join("z")).unwrap();
        let moved = dir.path().join("z/manifest.yaml");
        let mut kinds = Vec::new();
        while kinds.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            if event.kind() == "discovered" {
                assert_eq!(event.manifest_path(), moved);
            }
            kinds.push(event.kind());
        }
        kinds.sort();
        assert_eq!(kinds, vec!["discovered", "lost"]);

        fs::remove_file(&moved).unwrap();
        let gone = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(gone, DiscoveryEvent::Lost { node_id: "mover".into(), manifest_path: moved });

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn loop_waits_for_a_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("later");
        let (s, mut rx) = scanner(&root);
        let handle = s.spawn();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());

        write_manifest(&root.join("n"), "late-root", "/bin/true");
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.node_id(), "late-root");
        handle.shutdown().await;
    }
}
