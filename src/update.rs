use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::database::Database;
use crate::error::CatalogError;
use crate::object::{ObjectId, INVALID_OBJECT_ID};

/// Default window for the SPEC flush policy.
pub const SPEC_INTERVAL: Duration = Duration::from_secs(2);
/// Cap on accumulated container ids before the flusher is forced to drain.
pub const MAX_OBJECT_IDS: usize = 1000;
pub const MAX_OBJECT_IDS_OVERLOAD: usize = 30;

/// When accumulated updates are pushed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushPolicy {
    /// Flush after the SPEC window.
    Spec,
    /// Flush on next wake.
    Asap,
}

/// Receives the CSV eventing string produced by the database.
pub trait SubscriptionSink: Send + Sync {
    fn send_cds_subscription_update(&self, csv: &str);
}

#[derive(Default)]
struct AggregatorState {
    pending: HashSet<ObjectId>,
    policy: Option<FlushPolicy>,
    /// One-slot cache fast-pathing the common "same parent repeatedly" case.
    last_id: ObjectId,
}

/// Coalesces container-update ids and emits batched UPnP CDS notifications.
///
/// A dedicated flusher waits for the SPEC window (or flushes immediately
/// under ASAP), asks the database to bump the update counters and forwards
/// the returned CSV to the subscription sink. A database failure here leaves
/// subscribers with a stale view of committed state, so it terminates the
/// process by raising SIGINT.
pub struct UpdateAggregator {
    database: Arc<dyn Database>,
    sink: Arc<dyn SubscriptionSink>,
    state: Mutex<AggregatorState>,
    notify: Notify,
    drained: Notify,
    shutdown: AtomicBool,
    spec_interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateAggregator {
    pub fn new(database: Arc<dyn Database>, sink: Arc<dyn SubscriptionSink>) -> Arc<Self> {
        Self::with_interval(database, sink, SPEC_INTERVAL)
    }

    pub fn with_interval(
        database: Arc<dyn Database>,
        sink: Arc<dyn SubscriptionSink>,
        spec_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            sink,
            state: Mutex::new(AggregatorState {
                last_id: INVALID_OBJECT_ID,
                ..Default::default()
            }),
            notify: Notify::new(),
            drained: Notify::new(),
            shutdown: AtomicBool::new(false),
            spec_interval,
            worker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let aggregator = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            aggregator.flusher_loop().await;
        }));
    }

    /// Record a single changed container under the SPEC policy. Duplicate
    /// notifications for the same container within one window are no-ops.
    pub fn container_changed(&self, object_id: ObjectId) {
        self.container_changed_with_policy(object_id, FlushPolicy::Spec);
    }

    pub fn container_changed_with_policy(&self, object_id: ObjectId, policy: FlushPolicy) {
        if object_id == INVALID_OBJECT_ID {
            return;
        }
        let mut signal = false;
        {
            let mut state = self.state.lock().unwrap();
            let policy_raised = state.policy.map(|p| policy > p).unwrap_or(false);
            if object_id == state.last_id && !policy_raised {
                return;
            }
            if state.pending.is_empty() {
                signal = true;
            }
            state.pending.insert(object_id);
            state.last_id = object_id;
            if state.pending.len() >= MAX_OBJECT_IDS {
                signal = true;
            }
            if state.policy.is_none() || policy_raised {
                state.policy = Some(state.policy.map_or(policy, |p| p.max(policy)));
                if policy == FlushPolicy::Asap {
                    signal = true;
                }
            }
        }
        if signal {
            self.notify.notify_one();
        }
    }

    /// Record a batch of changed containers. When the pending set would grow
    /// past the cap plus overflow, the call signals the flusher and waits for
    /// it to drain before continuing, bounding memory under import bursts
    /// while preserving ordering within this caller.
    pub async fn containers_changed(&self, object_ids: &[ObjectId], policy: FlushPolicy) {
        for &object_id in object_ids {
            loop {
                let over_cap = {
                    let state = self.state.lock().unwrap();
                    state.pending.len() >= MAX_OBJECT_IDS + MAX_OBJECT_IDS_OVERLOAD
                };
                if !over_cap || self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let drained = self.drained.notified();
                self.notify.notify_one();
                drained.await;
            }
            self.container_changed_with_policy(object_id, policy);
        }
    }

    fn has_updates(&self) -> bool {
        !self.state.lock().unwrap().pending.is_empty()
    }

    async fn flusher_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let notified = self.notify.notified();
            if !self.has_updates() {
                notified.await;
                continue;
            }

            let (policy, pending_len) = {
                let state = self.state.lock().unwrap();
                (
                    state.policy.unwrap_or(FlushPolicy::Spec),
                    state.pending.len(),
                )
            };
            if policy == FlushPolicy::Spec && pending_len < MAX_OBJECT_IDS {
                // wait out the window; a wake re-evaluates the policy
                let woken = tokio::time::timeout(self.spec_interval, notified).await;
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if woken.is_ok() {
                    continue;
                }
            }

            let ids = {
                let mut state = self.state.lock().unwrap();
                state.last_id = INVALID_OBJECT_ID;
                state.policy = None;
                std::mem::take(&mut state.pending)
            };
            if ids.is_empty() {
                continue;
            }
            debug!("flushing {} container update(s)", ids.len());
            match self.database.increment_update_ids(&ids).await {
                Ok(csv) if !csv.is_empty() => {
                    self.sink.send_cds_subscription_update(&csv);
                }
                Ok(_) => {
                    debug!("no update string returned, nothing sent");
                }
                Err(e) => {
                    error!("fatal error while incrementing update ids: {e}");
                    Self::terminate(e);
                }
            }
            self.drained.notify_waiters();
        }
        debug!("update flusher stopped");
    }

    /// Subscribers must never observe a catalog newer than the update
    /// counters; a failed counter bump breaks that, so bring the process
    /// down.
    fn terminate(e: CatalogError) {
        error!("forcing shutdown after update failure: {e}");
        unsafe {
            libc::raise(libc::SIGINT);
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
