use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    AddFile,
    RemoveObject,
    RescanDirectory,
    FetchOnline,
}

/// Identity and cancellation state of a queued task.
#[derive(Debug)]
pub struct TaskInfo {
    id: AtomicU32,
    parent_id: AtomicU32,
    task_type: TaskType,
    description: String,
    cancellable: bool,
    valid: AtomicBool,
}

impl TaskInfo {
    pub fn new(task_type: TaskType, description: impl Into<String>, cancellable: bool) -> Self {
        Self {
            id: AtomicU32::new(0),
            parent_id: AtomicU32::new(0),
            task_type,
            description: description.into(),
            cancellable,
            valid: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn parent_id(&self) -> u32 {
        self.parent_id.load(Ordering::SeqCst)
    }

    pub fn set_parent_id(&self, id: u32) {
        self.parent_id.store(id, Ordering::SeqCst);
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    /// Cancellation is cooperative: tasks poll this at safe points and exit
    /// cleanly when it turns false.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        if self.cancellable {
            self.valid.store(false, Ordering::SeqCst);
        }
    }
}

/// A unit of content-management work executed by the engine's worker.
#[async_trait]
pub trait CatalogTask: Send + Sync {
    fn info(&self) -> &TaskInfo;

    /// Path the task operates on, for subtree invalidation of AddFile tasks.
    fn path(&self) -> Option<PathBuf> {
        None
    }

    async fn run(&self) -> Result<()>;
}

/// UI-facing snapshot of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: u32,
    pub task_type: TaskType,
    pub description: String,
}

fn snapshot(task: &Arc<dyn CatalogTask>) -> TaskSnapshot {
    TaskSnapshot {
        id: task.info().id(),
        task_type: task.info().task_type(),
        description: task.info().description().to_string(),
    }
}

#[derive(Default)]
struct EngineState {
    q1: VecDeque<Arc<dyn CatalogTask>>,
    q2: VecDeque<Arc<dyn CatalogTask>>,
    current: Option<Arc<dyn CatalogTask>>,
}

/// Single-worker task engine with a default and a low-priority FIFO.
///
/// The worker drains the default queue first; enqueue order is preserved
/// within each priority class. Tasks returning `ShutdownRequested` stop the
/// worker; any other error is logged and the worker continues.
pub struct TaskEngine {
    state: Mutex<EngineState>,
    notify: Notify,
    shutdown: AtomicBool,
    next_id: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the worker loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            engine.worker_loop().await;
        }));
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let notified = self.notify.notified();
            let task = {
                let mut state = self.state.lock().unwrap();
                let task = state.q1.pop_front().or_else(|| state.q2.pop_front());
                state.current = task.clone();
                task
            };
            match task {
                Some(task) => {
                    if task.info().is_valid() {
                        debug!(
                            task = task.info().id(),
                            "running task: {}",
                            task.info().description()
                        );
                        match task.run().await {
                            Ok(()) => {}
                            Err(e) if e.is_shutdown() => {
                                info!("task requested shutdown");
                                self.shutdown.store(true, Ordering::SeqCst);
                            }
                            Err(e) => {
                                error!("task '{}' failed: {}", task.info().description(), e);
                            }
                        }
                    }
                    self.state.lock().unwrap().current = None;
                }
                None => notified.await,
            }
        }
        debug!("task worker stopped");
    }

    /// Stamp a monotonic id onto the task and append it to the selected
    /// queue.
    pub fn enqueue(&self, task: Arc<dyn CatalogTask>, low_priority: bool) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        task.info().set_id(id);
        {
            let mut state = self.state.lock().unwrap();
            if low_priority {
                state.q2.push_back(task);
            } else {
                state.q1.push_back(task);
            }
        }
        self.notify.notify_one();
        id
    }

    pub fn current_task(&self) -> Option<TaskSnapshot> {
        self.state.lock().unwrap().current.as_ref().map(snapshot)
    }

    /// All live tasks: the running one first, then both queues in order.
    pub fn task_list(&self) -> Vec<TaskSnapshot> {
        let state = self.state.lock().unwrap();
        state
            .current
            .iter()
            .chain(state.q1.iter())
            .chain(state.q2.iter())
            .filter(|task| task.info().is_valid())
            .map(snapshot)
            .collect()
    }

    /// Invalidate the current task and every queued task matching the id
    /// directly or through its parent id.
    pub fn invalidate(&self, task_id: u32) {
        let state = self.state.lock().unwrap();
        let matches = |task: &Arc<dyn CatalogTask>| {
            task.info().id() == task_id || task.info().parent_id() == task_id
        };
        if let Some(current) = &state.current {
            if matches(current) {
                current.info().invalidate();
            }
        }
        for task in state.q1.iter().chain(state.q2.iter()) {
            if matches(task) {
                task.info().invalidate();
            }
        }
    }

    /// Invalidate AddFile tasks whose path lies under `path`, so a pending
    /// recursive import cannot re-add children of a directory about to be
    /// removed.
    pub fn invalidate_add_tasks_under(&self, path: &Path) {
        let state = self.state.lock().unwrap();
        let doomed = |task: &Arc<dyn CatalogTask>| {
            task.info().task_type() == TaskType::AddFile
                && task
                    .path()
                    .map(|p| p.starts_with(path))
                    .unwrap_or(false)
        };
        if let Some(current) = &state.current {
            if doomed(current) {
                current.info().invalidate();
            }
        }
        for task in state.q1.iter().chain(state.q2.iter()) {
            if doomed(task) {
                task.info().invalidate();
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the worker and wait for the running task to finish.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
