//! Deduplicating work queue with dependency ordering and a concurrency ceiling.
//!
//! # Design
//! `submit` scans the queued and running operations for one with the same
//! `OperationId` and concrete type while holding the queue lock, so two racing
//! submissions can never both miss each other. A suppressed duplicate does not
//! run; its callback is attached to the existing entry and fires with the
//! instance that actually ran. A duplicate submitted with
//! `ignore_if_duplicate: false` is queued behind the newest equivalent entry
//! and starts only after it finished, so equivalent operations never overlap.
//!
//! Scheduling is split in two stages:
//!
//! 1. An operation with dependencies waits for all of them to finish before it
//!    becomes ready. Waiting does not hold a concurrency slot.
//! 2. A dispatcher task moves ready operations onto the runtime as permits
//!    become available, highest `QualityOfService` first and then in arrival
//!    order.
//!
//! An entry is removed when its operation reports finished; callbacks run after
//! removal, outside the lock.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::operation::{self, Operation, OperationId};

/// Scheduling hint. Higher classes are dispatched first when operations wait
/// for a slot; the hint never raises a queue's ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    Background,
    Utility,
    #[default]
    Default,
    UserInitiated,
    UserInteractive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Suppress this submission when an equivalent operation is queued or
    /// running. When false the submission still runs, but only after that
    /// operation finished.
    pub ignore_if_duplicate: bool,
    pub qos: QualityOfService,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            ignore_if_duplicate: true,
            qos: QualityOfService::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The operation was queued and will run.
    Enqueued,
    /// An equivalent operation was already queued or running; this one was dropped.
    Deduplicated,
}

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    seq: u64,
    id: OperationId,
    operation: Arc<dyn Operation>,
    typed: Arc<dyn Any + Send + Sync>,
    callbacks: Vec<Callback>,
}

struct State {
    entries: Vec<Entry>,
    next_seq: u64,
    dispatcher: Option<UnboundedSender<Job>>,
}

struct Inner {
    config: QueueConfig,
    permits: Arc<Semaphore>,
    state: Mutex<State>,
    /// Entries not yet fully retired (callbacks included).
    pending: watch::Sender<usize>,
}

/// Cloneable handle to a work queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.config.name)
            .field("max_concurrent", &self.inner.config.max_concurrent)
            .field("len", &self.len())
            .finish()
    }
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        let config = QueueConfig::new(config.name, config.max_concurrent);
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                state: Mutex::new(State {
                    entries: Vec::new(),
                    next_seq: 0,
                    dispatcher: None,
                }),
                pending: watch::Sender::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.config.max_concurrent
    }

    /// Operations currently queued or running.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submit without a completion callback.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NoRuntime` when called outside a tokio runtime.
    pub fn submit<O: Operation>(
        &self,
        operation: Arc<O>,
        options: SubmitOptions,
    ) -> Result<SubmitOutcome, QueueError> {
        self.enqueue(operation, options, None)
    }

    /// Submit and call `callback` once the operation that serves this
    /// submission has finished. For a suppressed duplicate that is the
    /// existing operation, not `operation`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NoRuntime` when called outside a tokio runtime.
    pub fn submit_with<O, F>(
        &self,
        operation: Arc<O>,
        options: SubmitOptions,
        callback: F,
    ) -> Result<SubmitOutcome, QueueError>
    where
        O: Operation,
        F: FnOnce(Arc<O>) + Send + 'static,
    {
        self.enqueue(operation, options, Some(Box::new(callback)))
    }

    fn enqueue<O: Operation>(
        &self,
        operation: Arc<O>,
        options: SubmitOptions,
        callback: Option<Box<dyn FnOnce(Arc<O>) + Send>>,
    ) -> Result<SubmitOutcome, QueueError> {
        let mut state = self.inner.state.lock();

        // Newest first, so a chain of held-back duplicates stays serial.
        let duplicate = state.entries.iter_mut().rev().find_map(|entry| {
            if entry.id != *operation.id() {
                return None;
            }
            Arc::clone(&entry.typed)
                .downcast::<O>()
                .ok()
                .map(|existing| (entry, existing))
        });
        let mut dependencies = operation.dependencies();
        if let Some((entry, existing)) = duplicate {
            if options.ignore_if_duplicate {
                debug!(
                    queue = %self.inner.config.name,
                    operation_id = %entry.id,
                    "suppressing duplicate operation in favor of existing one"
                );
                if let Some(callback) = callback {
                    entry.callbacks.push(Box::new(move || callback(existing)));
                }
                return Ok(SubmitOutcome::Deduplicated);
            }
            debug!(
                queue = %self.inner.config.name,
                operation_id = %entry.id,
                "holding duplicate operation until the existing one finishes"
            );
            dependencies.push(Arc::clone(&entry.operation));
        }

        let sender = self.dispatcher(&mut state)?;
        let seq = state.next_seq;
        state.next_seq += 1;

        let dyn_operation: Arc<dyn Operation> = Arc::clone(&operation) as Arc<dyn Operation>;
        let typed: Arc<dyn Any + Send + Sync> = Arc::clone(&operation) as Arc<dyn Any + Send + Sync>;
        let mut callbacks: Vec<Callback> = Vec::new();
        if let Some(callback) = callback {
            let target = Arc::clone(&operation);
            callbacks.push(Box::new(move || callback(target)));
        }

        // Counted before the job exists, so its guard always has something to release.
        state.entries.push(Entry {
            seq,
            id: operation.id().clone(),
            operation: Arc::clone(&dyn_operation),
            typed,
            callbacks,
        });
        self.inner.pending.send_modify(|pending| *pending += 1);

        let job = Job {
            seq,
            qos: options.qos,
            operation: dyn_operation,
            guard: EntryGuard {
                inner: Arc::clone(&self.inner),
                seq,
            },
        };

        if dependencies.is_empty() {
            if let Err(mpsc::error::SendError(job)) = sender.send(job) {
                drop(state);
                drop(job);
                return Err(QueueError::Closed(self.inner.config.name.clone()));
            }
        } else {
            let queue = self.inner.config.name.clone();
            tokio::spawn(async move {
                for dependency in dependencies {
                    trace!(%queue, operation_id = %job.operation.id(), dependency = %dependency.id(), "waiting on dependency");
                    dependency.lifecycle().wait_finished().await;
                }
                // A failed send drops the job, and its guard retires the entry.
                let _ = sender.send(job);
            });
        }

        debug!(queue = %self.inner.config.name, operation_id = %operation.id(), seq, "operation enqueued");
        Ok(SubmitOutcome::Enqueued)
    }

    /// Sender of a live dispatcher, spawning one on the current runtime if needed.
    fn dispatcher(&self, state: &mut State) -> Result<UnboundedSender<Job>, QueueError> {
        if let Some(sender) = state.dispatcher.as_ref().filter(|s| !s.is_closed()) {
            return Ok(sender.clone());
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        handle.spawn(dispatch(
            self.inner.config.name.clone(),
            Arc::clone(&self.inner.permits),
            receiver,
        ));
        state.dispatcher = Some(sender.clone());
        Ok(sender)
    }

    /// Cancel every queued and running operation. Queued operations finish
    /// without running; running ones observe the flag cooperatively.
    pub fn cancel_all(&self) {
        let operations: Vec<Arc<dyn Operation>> = self
            .inner
            .state
            .lock()
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.operation))
            .collect();
        for operation in operations {
            operation.cancel();
        }
    }

    /// Resolve once every submitted operation has finished and its callbacks have run.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }
}

/// Retires a queue entry exactly once, whether the job runs or is dropped.
struct EntryGuard {
    inner: Arc<Inner>,
    seq: u64,
}

impl EntryGuard {
    fn take_callbacks(&self) -> Vec<Callback> {
        let mut state = self.inner.state.lock();
        match state.entries.iter().position(|entry| entry.seq == self.seq) {
            Some(index) => state.entries.remove(index).callbacks,
            None => Vec::new(),
        }
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        drop(self.take_callbacks());
        self.inner.pending.send_modify(|pending| *pending -= 1);
    }
}

struct Job {
    seq: u64,
    qos: QualityOfService,
    operation: Arc<dyn Operation>,
    guard: EntryGuard,
}

impl Job {
    async fn run(self, permit: OwnedSemaphorePermit) {
        let Job {
            operation, guard, ..
        } = self;
        operation::start(operation.as_ref()).await;
        operation.lifecycle().wait_finished().await;
        drop(permit);

        for callback in guard.take_callbacks() {
            callback();
        }
        drop(guard);
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    /// Max-heap order: higher QoS first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.qos
            .cmp(&other.qos)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

async fn dispatch(queue: String, permits: Arc<Semaphore>, mut receiver: UnboundedReceiver<Job>) {
    let mut ready = BinaryHeap::new();
    loop {
        if ready.is_empty() {
            match receiver.recv().await {
                Some(job) => ready.push(job),
                None => break,
            }
        }
        while let Ok(job) = receiver.try_recv() {
            ready.push(job);
        }
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        // Pick up anything that became ready while we waited for the slot.
        while let Ok(job) = receiver.try_recv() {
            ready.push(job);
        }
        if let Some(job) = ready.pop() {
            trace!(%queue, operation_id = %job.operation.id(), "starting operation");
            tokio::spawn(job.run(permit));
        }
    }
    debug!(%queue, "dispatcher stopped");
}

static SHARED: RwLock<Option<WorkQueue>> = parking_lot::const_rwlock(None);
static AUTH: RwLock<Option<WorkQueue>> = parking_lot::const_rwlock(None);

fn global(slot: &RwLock<Option<WorkQueue>>, config: fn() -> QueueConfig) -> WorkQueue {
    if let Some(queue) = slot.read().as_ref() {
        return queue.clone();
    }
    slot.write()
        .get_or_insert_with(|| WorkQueue::new(config()))
        .clone()
}

impl WorkQueue {
    /// Process-wide general queue, created on first use.
    pub fn shared() -> WorkQueue {
        global(&SHARED, QueueConfig::shared)
    }

    /// Process-wide serial queue (ceiling 1) for hosts that run their own
    /// credential refresh work as operations. Restores driven by
    /// `RequestOperation` are serialized by `recovery_gate()` instead, so a
    /// request waiting on a refresh never holds a slot here.
    pub fn auth() -> WorkQueue {
        global(&AUTH, QueueConfig::auth)
    }

    /// Replace the process-wide general queue.
    pub fn install_shared(queue: WorkQueue) {
        *SHARED.write() = Some(queue);
    }

    /// Replace the process-wide serial queue.
    pub fn install_auth(queue: WorkQueue) {
        *AUTH.write() = Some(queue);
    }

    /// Forget both process-wide queues; the next access creates fresh ones.
    pub fn reset_globals() {
        *SHARED.write() = None;
        *AUTH.write() = None;
    }
}
