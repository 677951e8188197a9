use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::autoscan::AutoscanDirectory;

/// Callbacks the watcher raises into the content orchestrator.
#[async_trait]
pub trait WatchSink: Send + Sync {
    /// A file or directory appeared or changed; schedule an import.
    async fn handle_new_path(&self, adir: Arc<AutoscanDirectory>, path: PathBuf, recursive: bool);

    /// A path disappeared; resolve it and remove the catalog subtree.
    /// `all` is false when the path was only renamed inside the tree.
    async fn handle_removed_path(
        &self,
        adir: Arc<AutoscanDirectory>,
        path: PathBuf,
        is_dir: bool,
        all: bool,
    );

    /// A persistent autoscan's directory vanished; the watcher installed a
    /// non-existing monitor and the catalog side should be cleaned up.
    async fn handle_persistent_autoscan_remove(&self, adir: Arc<AutoscanDirectory>);

    /// A persistent autoscan's directory reappeared; re-arm and rescan.
    async fn handle_persistent_autoscan_recreate(&self, adir: Arc<AutoscanDirectory>);

    /// Kick off the initial scan after a monitor was armed.
    async fn handle_monitor_armed(&self, adir: Arc<AutoscanDirectory>);
}

enum WatchCommand {
    Monitor(Arc<AutoscanDirectory>),
    Unmonitor(Arc<AutoscanDirectory>),
    Shutdown,
}

/// One watch registered on a directory node.
enum Watch {
    Autoscan {
        adir: Arc<AutoscanDirectory>,
        start_point: bool,
        descendants: Vec<PathBuf>,
        /// Segments of a missing persistent location this placeholder stands
        /// in for; None for live watches.
        nonexisting: Option<Vec<String>>,
    },
    /// Ancestor watch detecting renames of the start point at `remove_path`.
    Move { remove_path: PathBuf },
}

#[derive(Default)]
struct WatchNode {
    watches: Vec<Watch>,
}

struct WatchState {
    watcher: RecommendedWatcher,
    nodes: HashMap<PathBuf, WatchNode>,
    sink: Arc<dyn WatchSink>,
}

/// Filesystem event monitor for autoscan directories.
///
/// Each directory is watched individually (non-recursively); recursive
/// autoscans walk the tree and watch every level, mirroring how inotify
/// watch descriptors behave. Monitor requests arrive over a command channel
/// drained by the same loop that processes events, so no lock is held while
/// waiting.
pub struct FilesystemWatcher {
    cmd_tx: mpsc::UnboundedSender<WatchCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FilesystemWatcher {
    pub fn start(sink: Arc<dyn WatchSink>) -> crate::error::Result<Arc<Self>> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let _ = event_tx.send(result);
        })?;

        let mut state = WatchState {
            watcher,
            nodes: HashMap::new(),
            sink,
        };

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = cmd_rx.recv() => match command {
                        Some(WatchCommand::Monitor(adir)) => {
                            state.monitor_autoscan(&adir).await;
                        }
                        Some(WatchCommand::Unmonitor(adir)) => {
                            state.unmonitor_autoscan(&adir);
                        }
                        Some(WatchCommand::Shutdown) | None => break,
                    },
                    event = event_rx.recv() => match event {
                        Some(Ok(event)) => state.handle_event(event).await,
                        Some(Err(e)) => warn!("watch error: {e}"),
                        None => break,
                    },
                }
            }
            debug!("watch loop stopped");
        });

        Ok(Arc::new(Self {
            cmd_tx,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn monitor(&self, adir: Arc<AutoscanDirectory>) {
        let _ = self.cmd_tx.send(WatchCommand::Monitor(adir));
    }

    pub fn unmonitor(&self, adir: Arc<AutoscanDirectory>) {
        let _ = self.cmd_tx.send(WatchCommand::Unmonitor(adir));
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(WatchCommand::Shutdown);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl WatchState {
    async fn monitor_autoscan(&mut self, adir: &Arc<AutoscanDirectory>) {
        let location = adir.location().to_path_buf();
        if location.as_os_str().is_empty() {
            return;
        }
        if adir.recursive {
            debug!("adding recursive watch: {}", location.display());
            self.monitor_recursive(&location, adir, true);
        } else {
            debug!("adding watch: {}", location.display());
            self.monitor_directory(&location, adir, true, None);
        }
        self.sink.handle_monitor_armed(Arc::clone(adir)).await;
    }

    fn unmonitor_autoscan(&mut self, adir: &Arc<AutoscanDirectory>) {
        let location = adir.location().to_path_buf();
        debug!("removing watch: {}", location.display());
        let targets: Vec<PathBuf> = self
            .nodes
            .iter()
            .filter(|(path, node)| {
                path.starts_with(&location)
                    && node.watches.iter().any(|watch| match watch {
                        Watch::Autoscan { adir: owner, .. } => {
                            owner.location() == adir.location()
                        }
                        Watch::Move { .. } => false,
                    })
            })
            .map(|(path, _)| path.clone())
            .collect();
        for path in targets {
            self.remove_autoscan_watch(&path, adir);
        }
    }

    fn remove_autoscan_watch(&mut self, path: &Path, adir: &Arc<AutoscanDirectory>) {
        let mut drop_node = false;
        if let Some(node) = self.nodes.get_mut(path) {
            node.watches.retain(|watch| match watch {
                Watch::Autoscan { adir: owner, .. } => owner.location() != adir.location(),
                Watch::Move { .. } => true,
            });
            drop_node = node.watches.is_empty();
        }
        if drop_node {
            self.nodes.remove(path);
            let _ = self.watcher.unwatch(path);
        }
    }

    fn monitor_recursive(
        &mut self,
        start_path: &Path,
        adir: &Arc<AutoscanDirectory>,
        start_point: bool,
    ) {
        if !self.monitor_directory(start_path, adir, start_point, None) {
            return;
        }
        let mut pending = vec![start_path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("could not open {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') && !adir.hidden {
                    continue;
                }
                if path.is_dir() {
                    self.monitor_directory(&path, adir, false, None);
                    pending.push(path);
                }
            }
        }
    }

    /// Register one directory watch. On failure for a persistent start
    /// point, a non-existing monitor is planted on the nearest existing
    /// ancestor instead.
    fn monitor_directory(
        &mut self,
        path: &Path,
        adir: &Arc<AutoscanDirectory>,
        start_point: bool,
        nonexisting: Option<Vec<String>>,
    ) -> bool {
        if let Err(e) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
            if start_point && adir.is_persistent() {
                debug!(
                    "start point {} missing, installing non-existing monitor",
                    path.display()
                );
                self.monitor_nonexisting(path, adir);
            } else {
                debug!("cannot watch {}: {}", path.display(), e);
            }
            return false;
        }

        if start_point {
            self.watch_path_for_moves(path);
        }

        let node = self.nodes.entry(path.to_path_buf()).or_default();
        let already_watching = nonexisting.is_none()
            && node.watches.iter().any(|watch| match watch {
                Watch::Autoscan {
                    adir: owner,
                    nonexisting,
                    ..
                } => nonexisting.is_none() && owner.location() == adir.location(),
                Watch::Move { .. } => false,
            });
        if !already_watching {
            node.watches.push(Watch::Autoscan {
                adir: Arc::clone(adir),
                start_point,
                descendants: Vec::new(),
                nonexisting,
            });
            if !start_point {
                self.add_descendant(adir, path);
            }
        }
        true
    }

    /// Watch every ancestor of a start point so a rename anywhere above it
    /// is observed.
    fn watch_path_for_moves(&mut self, path: &Path) {
        let mut ancestor = PathBuf::new();
        let components: Vec<_> = path.components().collect();
        for component in &components[..components.len().saturating_sub(1)] {
            ancestor.push(component);
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            if self
                .watcher
                .watch(&ancestor, RecursiveMode::NonRecursive)
                .is_ok()
            {
                let node = self.nodes.entry(ancestor.clone()).or_default();
                let exists = node.watches.iter().any(|watch| {
                    matches!(watch, Watch::Move { remove_path } if remove_path == path)
                });
                if !exists {
                    debug!("adding move watch: {}", ancestor.display());
                    node.watches.push(Watch::Move {
                        remove_path: path.to_path_buf(),
                    });
                }
            }
        }
    }

    fn add_descendant(&mut self, adir: &Arc<AutoscanDirectory>, descendant: &Path) {
        let start = adir.location().to_path_buf();
        if let Some(node) = self.nodes.get_mut(&start) {
            for watch in &mut node.watches {
                if let Watch::Autoscan {
                    adir: owner,
                    descendants,
                    ..
                } = watch
                {
                    if owner.location() == adir.location() {
                        descendants.push(descendant.to_path_buf());
                        return;
                    }
                }
            }
        }
    }

    fn monitor_nonexisting(&mut self, path: &Path, adir: &Arc<AutoscanDirectory>) {
        let segments: Vec<String> = path
            .components()
            .filter_map(|component| match component {
                std::path::Component::Normal(segment) => {
                    Some(segment.to_string_lossy().to_string())
                }
                _ => None,
            })
            .collect();
        self.plant_nonexisting_monitor(&segments, adir);
    }

    /// Walk from the full missing path towards the root and watch the first
    /// directory that exists, remembering the segments still missing.
    fn plant_nonexisting_monitor(&mut self, segments: &[String], adir: &Arc<AutoscanDirectory>) {
        for take in (0..=segments.len()).rev() {
            let mut candidate = PathBuf::from("/");
            for segment in &segments[..take] {
                candidate.push(segment);
            }
            if candidate.is_dir() {
                if take == segments.len() {
                    // the whole path exists again; promotion happens via
                    // recheck_nonexisting
                    self.monitor_directory(&candidate, adir, true, None);
                } else {
                    self.monitor_directory(
                        &candidate,
                        adir,
                        false,
                        Some(segments.to_vec()),
                    );
                }
                return;
            }
        }
    }

    /// After something appeared, see whether any non-existing monitor can be
    /// promoted into a real start-point watch.
    async fn recheck_nonexisting(&mut self, node_path: &Path) {
        let pending: Vec<(Vec<String>, Arc<AutoscanDirectory>)> = self
            .nodes
            .get(node_path)
            .map(|node| {
                node.watches
                    .iter()
                    .filter_map(|watch| match watch {
                        Watch::Autoscan {
                            adir,
                            nonexisting: Some(segments),
                            ..
                        } => Some((segments.clone(), Arc::clone(adir))),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (segments, adir) in pending {
            let mut full = PathBuf::from("/");
            for segment in &segments {
                full.push(segment);
            }
            if full.is_dir() {
                // drop the placeholder, then re-arm for real
                self.remove_nonexisting_watch(node_path, &segments);
                if adir.recursive {
                    self.monitor_recursive(&full, &adir, true);
                } else {
                    self.monitor_directory(&full, &adir, true, None);
                }
                self.sink
                    .handle_persistent_autoscan_recreate(Arc::clone(&adir))
                    .await;
            }
        }
    }

    fn remove_nonexisting_watch(&mut self, node_path: &Path, segments: &[String]) {
        let mut drop_node = false;
        if let Some(node) = self.nodes.get_mut(node_path) {
            node.watches.retain(|watch| match watch {
                Watch::Autoscan {
                    nonexisting: Some(existing),
                    ..
                } => existing != segments,
                _ => true,
            });
            drop_node = node.watches.is_empty();
        }
        if drop_node {
            self.nodes.remove(node_path);
            let _ = self.watcher.unwatch(node_path);
        }
    }

    /// Longest-prefix match: the autoscan responsible for an event path.
    fn best_match_autoscan(&self, node_path: &Path, event_path: &Path) -> Option<Arc<AutoscanDirectory>> {
        let node = self.nodes.get(node_path)?;
        let mut best: Option<Arc<AutoscanDirectory>> = None;
        for watch in &node.watches {
            if let Watch::Autoscan {
                adir,
                nonexisting: None,
                ..
            } = watch
            {
                if event_path.starts_with(adir.location()) {
                    let better = best
                        .as_ref()
                        .map(|current| {
                            adir.location().as_os_str().len()
                                > current.location().as_os_str().len()
                        })
                        .unwrap_or(true);
                    if better {
                        best = Some(Arc::clone(adir));
                    }
                }
            }
        }
        best
    }

    /// Deepest watched directory containing the path.
    fn node_for(&self, path: &Path) -> Option<PathBuf> {
        let mut current = if self.nodes.contains_key(path) {
            Some(path.to_path_buf())
        } else {
            path.parent().map(Path::to_path_buf)
        };
        while let Some(candidate) = current {
            if self.nodes.contains_key(&candidate) {
                return Some(candidate);
            }
            current = candidate.parent().map(Path::to_path_buf);
        }
        None
    }

    async fn handle_event(&mut self, event: notify::Event) {
        match event.kind {
            EventKind::Create(kind) => {
                for path in &event.paths {
                    let is_dir = matches!(kind, CreateKind::Folder) || path.is_dir();
                    self.handle_added(path.clone(), is_dir).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(path) = event.paths.first().cloned() {
                    self.handle_removed(path, false).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    let is_dir = path.is_dir();
                    self.handle_added(path.clone(), is_dir).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(from) = event.paths.first().cloned() {
                    self.handle_removed(from, true).await;
                }
                if let Some(to) = event.paths.get(1).cloned() {
                    let is_dir = to.is_dir();
                    self.handle_added(to, is_dir).await;
                }
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    if path.is_file() {
                        self.handle_closed_write(path.clone()).await;
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.handle_removed(path.clone(), false).await;
                }
            }
            _ => {}
        }
    }

    async fn handle_added(&mut self, path: PathBuf, is_dir: bool) {
        let Some(node_path) = self.node_for(&path) else {
            return;
        };
        self.recheck_nonexisting(&node_path).await;
        let Some(adir) = self.best_match_autoscan(&node_path, &path) else {
            return;
        };
        debug!("adding {}", path.display());
        if is_dir {
            let hidden = path
                .file_name()
                .map(|name| name.to_string_lossy().starts_with('.'))
                .unwrap_or(false);
            if adir.recursive && (!hidden || adir.hidden) {
                self.monitor_recursive(&path.clone(), &adir, false);
                self.sink
                    .handle_new_path(Arc::clone(&adir), path, true)
                    .await;
            }
        } else {
            self.sink
                .handle_new_path(Arc::clone(&adir), path, false)
                .await;
        }
    }

    async fn handle_closed_write(&mut self, path: PathBuf) {
        let Some(node_path) = self.node_for(&path) else {
            return;
        };
        let Some(adir) = self.best_match_autoscan(&node_path, &path) else {
            return;
        };
        debug!("changed {}", path.display());
        self.sink
            .handle_new_path(Arc::clone(&adir), path, false)
            .await;
    }

    async fn handle_removed(&mut self, path: PathBuf, moved_within_tree: bool) {
        let is_watched_dir = self.nodes.contains_key(&path);

        if is_watched_dir {
            // the directory itself vanished: handle persistent autoscans and
            // tear down the watch subtree
            let start_points: Vec<Arc<AutoscanDirectory>> = self
                .nodes
                .get(&path)
                .map(|node| {
                    node.watches
                        .iter()
                        .filter_map(|watch| match watch {
                            Watch::Autoscan {
                                adir,
                                start_point: true,
                                nonexisting: None,
                                ..
                            } => Some(Arc::clone(adir)),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            for adir in &start_points {
                if adir.is_persistent() {
                    self.monitor_nonexisting(&path, adir);
                    self.sink
                        .handle_persistent_autoscan_remove(Arc::clone(adir))
                        .await;
                }
            }

            // collect-then-remove over the watch subtree and ancestor move
            // watches referring into it
            let doomed: Vec<PathBuf> = self
                .nodes
                .keys()
                .filter(|node| node.starts_with(&path))
                .cloned()
                .collect();
            for node_path in doomed {
                self.nodes.remove(&node_path);
                let _ = self.watcher.unwatch(&node_path);
            }
            for node in self.nodes.values_mut() {
                node.watches.retain(|watch| match watch {
                    Watch::Move { remove_path } => !remove_path.starts_with(&path),
                    _ => true,
                });
            }
        }

        let Some(node_path) = self.node_for(&path) else {
            return;
        };
        let Some(adir) = self.best_match_autoscan(&node_path, &path) else {
            return;
        };
        debug!("removing {}", path.display());
        self.sink
            .handle_removed_path(
                Arc::clone(&adir),
                path,
                is_watched_dir,
                !moved_within_tree,
            )
            .await;
    }
}
