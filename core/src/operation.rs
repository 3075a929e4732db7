//! Base lifecycle shared by every schedulable unit of work.
//!
//! # Design
//! An operation is started at most once by a `WorkQueue`. `start` either
//! finishes a cancelled operation on the spot or marks it executing and calls
//! its `run` hook. Finishing is never inferred from `run` returning: the
//! operation calls `Lifecycle::complete` itself, which is what lets `run`
//! return early while the real work completes elsewhere.
//!
//! Two operations are the same operation when their `OperationId`s are equal,
//! whatever else they hold. The queue relies on this for deduplication.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Deduplication key of an operation. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id from the default generator.
    pub fn generate() -> Self {
        UuidIds.next_id()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OperationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Source of ids for operations whose caller does not supply one.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> OperationId;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self) -> OperationId {
        OperationId(uuid::Uuid::new_v4().to_string())
    }
}

/// `"{prefix}-1"`, `"{prefix}-2"`, ... for reproducible ids in tests and logs.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> OperationId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        OperationId(format!("{}-{n}", self.prefix))
    }
}

/// Observable executing/finished/cancelled flags.
///
/// `finished` is a watch channel so any number of waiters, including ones that
/// subscribe after completion, observe it.
#[derive(Debug)]
pub struct Lifecycle {
    executing: AtomicBool,
    cancelled: AtomicBool,
    finished: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            executing: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            finished: watch::Sender::new(false),
        }
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn mark_executing(&self) {
        self.executing.store(true, Ordering::Release);
    }

    /// Mark the operation finished. Executing stays set; both flags read true
    /// afterwards. Returns `false` if it was already finished.
    pub fn complete(&self) -> bool {
        self.executing.store(true, Ordering::Release);
        self.finish()
    }

    fn finish(&self) -> bool {
        self.finished.send_if_modified(|finished| {
            let changed = !*finished;
            *finished = true;
            changed
        })
    }

    /// Resolve once the operation is finished.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|finished| *finished).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// A schedulable unit of work.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    fn id(&self) -> &OperationId;

    fn lifecycle(&self) -> &Lifecycle;

    /// Operations that must finish before this one may start.
    fn dependencies(&self) -> Vec<Arc<dyn Operation>> {
        Vec::new()
    }

    /// Body of the operation. Must eventually call `self.lifecycle().complete()`.
    async fn run(&self);

    fn cancel(&self) {
        self.lifecycle().cancel();
    }

    fn is_finished(&self) -> bool {
        self.lifecycle().is_finished()
    }
}

impl PartialEq for dyn Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for dyn Operation {}

/// Start `operation`: finish immediately if it was cancelled, otherwise mark
/// it executing and invoke `run` exactly once.
pub async fn start(operation: &dyn Operation) {
    let lifecycle = operation.lifecycle();
    if lifecycle.is_cancelled() {
        lifecycle.finish();
        return;
    }
    lifecycle.mark_executing();
    operation.run().await;
}
