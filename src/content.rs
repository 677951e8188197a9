use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::autoscan::{AutoscanDirectory, AutoscanRegistry, ScanMode, ScanSetting};
use crate::config::{LayoutType, ServerConfig};
use crate::database::{ChangedContainers, Database, DbFileType};
use crate::error::{CatalogError, Result};
use crate::import::ImportService;
use crate::layout::builtin::BuiltinLayout;
use crate::layout::structured::StructuredLayout;
use crate::layout::Layout;
use crate::metadata::MetadataService;
use crate::object::{CdsObject, ObjectId, INVALID_OBJECT_ID};
use crate::tasks::{CatalogTask, TaskEngine, TaskInfo, TaskSnapshot, TaskType};
use crate::timer::{Timer, TimerKind, TimerParameter, TimerSubscriber};
use crate::update::{FlushPolicy, UpdateAggregator};
use crate::watcher::{FilesystemWatcher, WatchSink};

/// External process handle registered while media is being produced; killed
/// on shutdown so no transcoder outlives the server.
pub trait Executor: Send + Sync {
    fn kill(&self);
    fn is_alive(&self) -> bool;
}

/// Receives the fine-grained container change sets meant for the web UI.
pub trait UiSink: Send + Sync {
    fn containers_changed_ui(&self, ids: &[ObjectId]);
}

/// Public façade over the content core: file addition, object removal,
/// rescans, autoscan lifecycle and timer callbacks.
pub struct ContentOrchestrator {
    config: Arc<ServerConfig>,
    database: Arc<dyn Database>,
    metadata: Arc<dyn MetadataService>,
    update: Arc<UpdateAggregator>,
    engine: Arc<TaskEngine>,
    registry: AutoscanRegistry,
    timer: Arc<dyn Timer>,
    watcher: StdMutex<Option<Arc<FilesystemWatcher>>>,
    import_services: Mutex<HashMap<PathBuf, Arc<ImportService>>>,
    executors: StdMutex<Vec<Arc<dyn Executor>>>,
    ui_sink: StdMutex<Option<Arc<dyn UiSink>>>,
    shutting_down: std::sync::atomic::AtomicBool,
    self_ref: Weak<ContentOrchestrator>,
}

impl ContentOrchestrator {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<dyn Database>,
        metadata: Arc<dyn MetadataService>,
        update: Arc<UpdateAggregator>,
        timer: Arc<dyn Timer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            database,
            metadata,
            update,
            engine: TaskEngine::new(),
            registry: AutoscanRegistry::new(),
            timer,
            watcher: StdMutex::new(None),
            import_services: Mutex::new(HashMap::new()),
            executors: StdMutex::new(Vec::new()),
            ui_sink: StdMutex::new(None),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    pub fn set_ui_sink(&self, sink: Arc<dyn UiSink>) {
        *self.ui_sink.lock().unwrap() = Some(sink);
    }

    /// Start workers and arm the persisted and configured autoscans.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.engine.start();
        self.update.start();

        if self.config.import.autoscan.use_inotify {
            let watcher = FilesystemWatcher::start(Arc::clone(self) as Arc<dyn WatchSink>)?;
            *self.watcher.lock().unwrap() = Some(watcher);
        }

        for mode in [ScanMode::Timed, ScanMode::INotify] {
            let stored = self.database.get_autoscan_list(mode).await?;
            for adir in stored {
                let adir = Arc::new(adir);
                match self.registry.add(Arc::clone(&adir), None) {
                    Ok(_) => self.arm_autoscan(&adir),
                    Err(e) => warn!("skipping stored autoscan: {e}"),
                }
            }
        }

        for (mode, list) in [
            (ScanMode::Timed, &self.config.import.autoscan.timed_list),
            (ScanMode::INotify, &self.config.import.autoscan.inotify_list),
        ] {
            for entry in list {
                if self.registry.by_location(&entry.location).is_some() {
                    continue;
                }
                let mut adir = AutoscanDirectory::with_options(
                    entry.location.clone(),
                    mode,
                    entry.recursive,
                    entry.hidden,
                    std::time::Duration::from_secs(entry.interval_secs),
                );
                adir.follow_symlinks = entry.follow_symlinks;
                let adir = Arc::new(adir);
                adir.set_persistent(true);
                if let Err(e) = self.set_autoscan_directory(Arc::clone(&adir)).await {
                    warn!(
                        "could not register configured autoscan {}: {}",
                        entry.location.display(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Stop the task worker, the flusher and the watch loop, and kill any
    /// registered external process.
    pub async fn shutdown(&self) {
        self.shutting_down
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let executors: Vec<Arc<dyn Executor>> =
            self.executors.lock().unwrap().drain(..).collect();
        for executor in executors {
            if executor.is_alive() {
                executor.kill();
            }
        }
        let watcher = self.watcher.lock().unwrap().take();
        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }
        self.engine.shutdown().await;
        self.update.shutdown().await;
        info!("content orchestrator stopped");
    }

    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        self.executors.lock().unwrap().push(executor);
    }

    /// No-op during shutdown: the executor list is being drained.
    pub fn unregister_executor(&self, executor: &Arc<dyn Executor>) {
        if self.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let mut executors = self.executors.lock().unwrap();
        executors.retain(|registered| !Arc::ptr_eq(registered, executor));
    }

    pub fn current_task(&self) -> Option<TaskSnapshot> {
        self.engine.current_task()
    }

    pub fn task_list(&self) -> Vec<TaskSnapshot> {
        self.engine.task_list()
    }

    pub fn invalidate_task(&self, task_id: u32) {
        self.engine.invalidate(task_id);
    }

    fn build_layout(&self) -> Option<Arc<dyn Layout>> {
        match self.config.import.layout.layout_type {
            LayoutType::Builtin => Some(Arc::new(BuiltinLayout::new(Arc::clone(&self.config)))),
            LayoutType::Structured => {
                Some(Arc::new(StructuredLayout::new(Arc::clone(&self.config))))
            }
            LayoutType::Js => {
                warn!("scripted layout requested but no script runtime is wired in");
                None
            }
            LayoutType::None => None,
        }
    }

    /// Import services are per autoscan root; one-off imports get a service
    /// keyed by their own root.
    async fn import_service_for(
        &self,
        adir: Option<Arc<AutoscanDirectory>>,
        root_path: PathBuf,
    ) -> Arc<ImportService> {
        let key = adir
            .as_ref()
            .map(|a| a.location().to_path_buf())
            .unwrap_or_else(|| root_path.clone());
        let mut services = self.import_services.lock().await;
        if let Some(service) = services.get(&key) {
            return Arc::clone(service);
        }
        let service = Arc::new(ImportService::new(
            Arc::clone(&self.config),
            Arc::clone(&self.database),
            Arc::clone(&self.metadata),
            Arc::clone(&self.update),
            adir,
            root_path,
        ));
        if let Some(layout) = self.build_layout() {
            service.init_layout(layout);
        }
        services.insert(key, Arc::clone(&service));
        service
    }

    // file addition ------------------------------------------------------

    /// Add a file or directory. Synchronous calls return the created object
    /// id; asynchronous calls enqueue a task and return `INVALID_OBJECT_ID`.
    pub async fn add_file(
        self: &Arc<Self>,
        path: PathBuf,
        root_path: PathBuf,
        settings: ScanSetting,
        async_mode: bool,
        low_priority: bool,
        cancellable: bool,
    ) -> Result<ObjectId> {
        if !async_mode {
            return self.add_file_internal(&path, root_path, &settings, None).await;
        }
        let task = Arc::new(AddFileTask {
            orchestrator: Arc::clone(self),
            info: TaskInfo::new(
                TaskType::AddFile,
                format!("import {}", path.display()),
                cancellable,
            ),
            path,
            root_path,
            settings,
        });
        self.engine.enqueue(task, low_priority);
        Ok(INVALID_OBJECT_ID)
    }

    async fn add_file_internal(
        &self,
        path: &Path,
        root_path: PathBuf,
        settings: &ScanSetting,
        task: Option<&TaskInfo>,
    ) -> Result<ObjectId> {
        let root_path = if root_path.as_os_str().is_empty() {
            path.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            root_path
        };
        let service = self
            .import_service_for(settings.adir.clone(), root_path)
            .await;
        let mut current_content = HashSet::new();
        service
            .do_import(path, settings, &mut current_content, task)
            .await?;
        Ok(service
            .object_at(path)
            .await
            .map(|object| object.id())
            .unwrap_or(INVALID_OBJECT_ID))
    }

    // removal ------------------------------------------------------------

    /// Remove an object (optionally its whole subtree). Pending AddFile
    /// tasks under the object's path are invalidated first, and autoscans
    /// below it are dropped. Returns the UPnP-relevant parent ids.
    pub async fn remove_object(
        self: &Arc<Self>,
        adir: Option<Arc<AutoscanDirectory>>,
        object_id: ObjectId,
        rescan_resource: bool,
        async_mode: bool,
        all: bool,
    ) -> Result<Vec<ObjectId>> {
        let path = match self.database.load_object(object_id).await {
            Ok(object) => Some(object.location().to_path_buf()),
            Err(CatalogError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some(path) = &path {
            if !path.as_os_str().is_empty() {
                // a queued recursive import must not re-add children of a
                // doomed directory
                self.engine.invalidate_add_tasks_under(path);
                for doomed in self.registry.remove_if_subdir(path, false) {
                    self.disarm_autoscan(&doomed);
                    if let Err(e) = self.database.remove_autoscan_directory(&doomed).await {
                        error!("failed to drop autoscan below {}: {}", path.display(), e);
                    }
                }
            }
        }

        if rescan_resource {
            if let Some(parent) = path.as_ref().and_then(|p| p.parent()) {
                if let Some(adir) = &adir {
                    let mut settings = ScanSetting::from_autoscan(adir);
                    settings.recursive = false;
                    settings.rescan_resource = true;
                    let _ = self
                        .add_file(
                            parent.to_path_buf(),
                            adir.location().to_path_buf(),
                            settings,
                            true,
                            true,
                            false,
                        )
                        .await;
                }
            }
        }

        if async_mode {
            let task = Arc::new(RemoveObjectTask {
                orchestrator: Arc::clone(self),
                info: TaskInfo::new(
                    TaskType::RemoveObject,
                    format!("remove object {object_id}"),
                    false,
                ),
                object_id,
                all,
            });
            self.engine.enqueue(task, false);
            return Ok(Vec::new());
        }
        let changed = self.remove_object_internal(object_id, all).await?;
        Ok(changed.upnp)
    }

    async fn remove_object_internal(
        &self,
        object_id: ObjectId,
        all: bool,
    ) -> Result<ChangedContainers> {
        let changed = self.database.remove_object(object_id, all).await?;
        // cached container ids may now point at removed rows
        let services: Vec<Arc<ImportService>> = {
            let services = self.import_services.lock().await;
            services.values().cloned().collect()
        };
        for service in services {
            service.clear_cache().await;
        }
        self.dispatch_changed(&changed).await;
        Ok(changed)
    }

    async fn dispatch_changed(&self, changed: &ChangedContainers) {
        if !changed.ui.is_empty() {
            let sink = self.ui_sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink.containers_changed_ui(&changed.ui);
            }
        }
        if !changed.upnp.is_empty() {
            self.update
                .containers_changed(&changed.upnp, FlushPolicy::Spec)
                .await;
        }
    }

    // updates ------------------------------------------------------------

    /// Route an object mutation through the database and report the
    /// affected parent to the update aggregator.
    pub async fn update_object(&self, object: &CdsObject, send_updates: bool) -> Result<()> {
        object.validate()?;
        let changed = self.database.update_object(object).await?;
        if send_updates {
            if let Some(parent) = changed {
                self.update.container_changed(parent);
            }
        }
        Ok(())
    }

    pub async fn ensure_path_existence(&self, path: &Path) -> Result<ObjectId> {
        let (container_id, changed) = self.database.ensure_path_existence(path).await?;
        if let Some(parent) = changed {
            self.update.container_changed(parent);
        }
        Ok(container_id)
    }

    // rescans ------------------------------------------------------------

    /// Queue a low-priority rescan of an autoscan directory.
    pub async fn rescan_directory(
        self: &Arc<Self>,
        adir: Arc<AutoscanDirectory>,
        object_id: ObjectId,
        desc_path: Option<PathBuf>,
        cancellable: bool,
    ) {
        adir.increment_task_count();
        let location = desc_path.unwrap_or_else(|| adir.location().to_path_buf());
        let task = Arc::new(RescanDirectoryTask {
            orchestrator: Arc::clone(self),
            info: TaskInfo::new(
                TaskType::RescanDirectory,
                format!("rescan {}", location.display()),
                cancellable,
            ),
            adir,
            object_id,
            location,
        });
        self.engine.enqueue(task, true);
    }

    async fn rescan_internal(
        &self,
        adir: &Arc<AutoscanDirectory>,
        object_id: ObjectId,
        location: &Path,
        task: Option<&TaskInfo>,
    ) -> Result<()> {
        let container_id = if object_id == INVALID_OBJECT_ID {
            match self
                .database
                .find_object_id_by_path(location, DbFileType::Directory)
                .await?
            {
                Some(id) => id,
                None => {
                    // the autoscan points at nothing yet; import from scratch
                    self.ensure_path_existence(location).await?
                }
            }
        } else {
            object_id
        };

        let mut current_content = self
            .database
            .get_objects(container_id, !adir.recursive)
            .await?;
        debug!(
            "rescan of {} starts with {} known object(s)",
            location.display(),
            current_content.len()
        );

        let settings = ScanSetting::from_autoscan(adir);
        let service = self
            .import_service_for(Some(Arc::clone(adir)), adir.location().to_path_buf())
            .await;
        service
            .do_import(location, &settings, &mut current_content, task)
            .await?;

        if let Some(task) = task {
            if !task.is_valid() {
                return Ok(());
            }
        }
        if !current_content.is_empty() {
            debug!(
                "removing {} stale object(s) under {}",
                current_content.len(),
                location.display()
            );
            let changed = self
                .database
                .remove_objects(&current_content, false)
                .await?;
            self.dispatch_changed(&changed).await;
        }
        Ok(())
    }

    // autoscan lifecycle -------------------------------------------------

    fn arm_autoscan(&self, adir: &Arc<AutoscanDirectory>) {
        match adir.mode() {
            ScanMode::Timed => {
                self.timer
                    .add_subscriber(adir.interval(), adir.timer_parameter(), false);
            }
            ScanMode::INotify => {
                let watcher = self.watcher.lock().unwrap().clone();
                match watcher {
                    Some(watcher) => watcher.monitor(Arc::clone(adir)),
                    None => {
                        // fall back to timed mode when inotify is disabled
                        self.timer
                            .add_subscriber(adir.interval(), adir.timer_parameter(), false);
                    }
                }
            }
        }
    }

    fn disarm_autoscan(&self, adir: &Arc<AutoscanDirectory>) {
        match adir.mode() {
            ScanMode::Timed => {
                self.timer.remove_subscriber(adir.timer_parameter(), true);
            }
            ScanMode::INotify => {
                let watcher = self.watcher.lock().unwrap().clone();
                match watcher {
                    Some(watcher) => watcher.unmonitor(Arc::clone(adir)),
                    None => self.timer.remove_subscriber(adir.timer_parameter(), true),
                }
            }
        }
    }

    pub fn get_autoscan_directory(&self, object_id: ObjectId) -> Option<Arc<AutoscanDirectory>> {
        self.registry.by_object_id(object_id)
    }

    pub fn get_autoscan_directories(&self) -> Vec<Arc<AutoscanDirectory>> {
        self.registry.list()
    }

    /// Register a new autoscan or update an existing one in place,
    /// re-arming timers or watches according to the new mode.
    pub async fn set_autoscan_directory(
        self: &Arc<Self>,
        dir: Arc<AutoscanDirectory>,
    ) -> Result<()> {
        self.database.check_overlapping_autoscans(&dir).await?;

        let existing = if dir.object_id() == INVALID_OBJECT_ID {
            None
        } else {
            self.registry.by_object_id(dir.object_id())
        };
        if let Some(existing) = existing {
            self.disarm_autoscan(&existing);
            self.registry.remove(existing.scan_id());
            let mut updated = AutoscanDirectory::new(dir.location().to_path_buf(), dir.mode());
            updated.copy_settings_from(&dir);
            let updated = Arc::new(updated);
            updated.set_object_id(existing.object_id());
            updated.set_database_id(existing.database_id());
            self.registry.add(Arc::clone(&updated), None)?;
            self.database.update_autoscan_directory(&updated).await?;
            self.arm_autoscan(&updated);
            return Ok(());
        }

        // fresh autoscan: resolve the container, persist, arm, scan
        let object_id = if dir.object_id() == INVALID_OBJECT_ID {
            self.ensure_path_existence(dir.location()).await?
        } else {
            dir.object_id()
        };
        dir.set_object_id(object_id);
        self.database.add_autoscan_directory(&dir).await?;
        self.registry.add(Arc::clone(&dir), None)?;
        self.arm_autoscan(&dir);
        if dir.mode() == ScanMode::Timed {
            self.rescan_directory(Arc::clone(&dir), object_id, None, true)
                .await;
        }
        Ok(())
    }

    pub async fn remove_autoscan_directory(&self, adir: Arc<AutoscanDirectory>) -> Result<()> {
        self.disarm_autoscan(&adir);
        self.registry.remove(adir.scan_id());
        self.database.remove_autoscan_directory(&adir).await
    }
}

#[async_trait]
impl TimerSubscriber for ContentOrchestrator {
    async fn timer_notify(&self, parameter: TimerParameter) {
        if parameter.kind != TimerKind::Autoscan {
            return;
        }
        let Some(this) = self.strong() else {
            return;
        };
        let Some(adir) = self.registry.by_scan_id(parameter.id) else {
            return;
        };
        // suppress overlapping rescans of the same autoscan
        if adir.active_scan_count() > 0 || adir.task_count() > 0 {
            debug!(
                "skipping timed rescan of {}: scan already active",
                adir.location().display()
            );
            return;
        }
        let object_id = adir.object_id();
        this.rescan_directory(adir, object_id, None, true).await;
    }
}

#[async_trait]
impl WatchSink for ContentOrchestrator {
    async fn handle_new_path(&self, adir: Arc<AutoscanDirectory>, path: PathBuf, recursive: bool) {
        let Some(this) = self.strong() else {
            return;
        };
        let mut settings = ScanSetting::from_autoscan(&adir);
        settings.recursive = recursive;
        settings.rescan_resource = true;
        settings.follow_symlinks = this.config.import.follow_symlinks;
        let root_path = adir.location().to_path_buf();
        if let Err(e) = this
            .add_file(path.clone(), root_path, settings, true, true, false)
            .await
        {
            error!("failed to schedule import of {}: {}", path.display(), e);
        }
    }

    async fn handle_removed_path(
        &self,
        adir: Arc<AutoscanDirectory>,
        path: PathBuf,
        is_dir: bool,
        all: bool,
    ) {
        let Some(this) = self.strong() else {
            return;
        };
        let file_type = if is_dir {
            DbFileType::Directory
        } else {
            DbFileType::Any
        };
        let object_id = match this.database.find_object_id_by_path(&path, file_type).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                error!("lookup of removed path {} failed: {}", path.display(), e);
                return;
            }
        };
        if let Err(e) = this
            .remove_object(Some(adir), object_id, false, true, all)
            .await
        {
            error!("failed to remove {}: {}", path.display(), e);
        }
    }

    async fn handle_persistent_autoscan_remove(&self, adir: Arc<AutoscanDirectory>) {
        // keep the configuration row alive; only the container link dies
        adir.set_object_id(INVALID_OBJECT_ID);
        if let Err(e) = self.database.update_autoscan_directory(&adir).await {
            error!(
                "failed to persist removal of autoscan {}: {}",
                adir.location().display(),
                e
            );
        }
    }

    async fn handle_persistent_autoscan_recreate(&self, adir: Arc<AutoscanDirectory>) {
        let Some(this) = self.strong() else {
            return;
        };
        match this.ensure_path_existence(adir.location()).await {
            Ok(object_id) => {
                adir.set_object_id(object_id);
                if let Err(e) = this.database.update_autoscan_directory(&adir).await {
                    error!("failed to persist recreated autoscan: {e}");
                }
                this.rescan_directory(adir, object_id, None, true).await;
            }
            Err(e) => error!(
                "failed to recreate autoscan container {}: {}",
                adir.location().display(),
                e
            ),
        }
    }

    async fn handle_monitor_armed(&self, adir: Arc<AutoscanDirectory>) {
        let Some(this) = self.strong() else {
            return;
        };
        let object_id = adir.object_id();
        let location = adir.location().to_path_buf();
        this.rescan_directory(adir, object_id, Some(location), false)
            .await;
    }
}

// task implementations ---------------------------------------------------

struct AddFileTask {
    orchestrator: Arc<ContentOrchestrator>,
    info: TaskInfo,
    path: PathBuf,
    root_path: PathBuf,
    settings: ScanSetting,
}

#[async_trait]
impl CatalogTask for AddFileTask {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    fn path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    async fn run(&self) -> Result<()> {
        if self.orchestrator.engine.is_shutting_down() {
            return Err(CatalogError::ShutdownRequested);
        }
        self.orchestrator
            .add_file_internal(
                &self.path,
                self.root_path.clone(),
                &self.settings,
                Some(&self.info),
            )
            .await
            .map(|_| ())
    }
}

struct RemoveObjectTask {
    orchestrator: Arc<ContentOrchestrator>,
    info: TaskInfo,
    object_id: ObjectId,
    all: bool,
}

#[async_trait]
impl CatalogTask for RemoveObjectTask {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn run(&self) -> Result<()> {
        if self.orchestrator.engine.is_shutting_down() {
            return Err(CatalogError::ShutdownRequested);
        }
        self.orchestrator
            .remove_object_internal(self.object_id, self.all)
            .await
            .map(|_| ())
    }
}

struct RescanDirectoryTask {
    orchestrator: Arc<ContentOrchestrator>,
    info: TaskInfo,
    adir: Arc<AutoscanDirectory>,
    object_id: ObjectId,
    location: PathBuf,
}

#[async_trait]
impl CatalogTask for RescanDirectoryTask {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    fn path(&self) -> Option<PathBuf> {
        Some(self.location.clone())
    }

    async fn run(&self) -> Result<()> {
        if self.orchestrator.engine.is_shutting_down() {
            return Err(CatalogError::ShutdownRequested);
        }
        let result = self
            .orchestrator
            .rescan_internal(&self.adir, self.object_id, &self.location, Some(&self.info))
            .await;
        self.adir.decrement_task_count();
        if self.adir.task_count() == 0 && self.adir.update_lmt() {
            if let Err(e) = self
                .orchestrator
                .database
                .update_autoscan_directory(&self.adir)
                .await
            {
                error!("failed to persist autoscan timestamps: {e}");
            }
        }
        result
    }
}
