//! Completion barrier over a group of request operations.
//!
//! The aggregate depends on every member, so the queue starts it only after
//! all of them have finished, whatever their outcome. Its own body does no
//! work; the completion callback scans the members once and reports whether
//! all of them succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::operation::{Lifecycle, Operation, OperationId};
use crate::queue::{SubmitOptions, WorkQueue};
use crate::request_operation::RequestOperation;

pub struct AggregateOperation {
    id: OperationId,
    lifecycle: Lifecycle,
    members: Vec<Arc<RequestOperation>>,
    queue: Option<WorkQueue>,
}

impl AggregateOperation {
    pub fn new(members: Vec<Arc<RequestOperation>>) -> Self {
        Self::with_id(OperationId::generate(), members)
    }

    pub fn with_id(id: impl Into<OperationId>, members: Vec<Arc<RequestOperation>>) -> Self {
        Self {
            id: id.into(),
            lifecycle: Lifecycle::new(),
            members,
            queue: None,
        }
    }

    /// Queue the aggregate itself is submitted to. Defaults to `WorkQueue::shared()`.
    /// Members keep their own queues.
    pub fn queue(mut self, queue: WorkQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn members(&self) -> &[Arc<RequestOperation>] {
        &self.members
    }

    /// First member, in construction order, that did not succeed.
    pub fn first_failure(&self) -> Option<&Arc<RequestOperation>> {
        self.members.iter().find(|member| !member.is_successful())
    }

    pub fn all_succeeded(&self) -> bool {
        self.first_failure().is_none()
    }

    /// Submit the aggregate, then every member. `completion` receives `true`
    /// when all members succeeded and runs once, after the last one finished.
    ///
    /// A member that was already submitted, by the caller or because it is
    /// listed twice, is left to finish on its own.
    ///
    /// # Errors
    ///
    /// Fails without submitting anything when the aggregate itself cannot be
    /// queued. Otherwise returns the first member submission failure; that
    /// member is finished as cancelled, so `completion` still runs and reports
    /// `false`.
    pub fn execute<F>(self: &Arc<Self>, completion: F) -> Result<(), QueueError>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let queue = self.queue.clone().unwrap_or_else(WorkQueue::shared);
        queue.submit_with(Arc::clone(self), SubmitOptions::default(), move |aggregate| {
            let succeeded = match aggregate.first_failure() {
                Some(failed) => {
                    debug!(aggregate_id = %aggregate.id, failed = %failed.id(), "aggregate member failed");
                    false
                }
                None => true,
            };
            completion(succeeded);
        })?;

        let mut first_error = None;
        for member in &self.members {
            match member.execute() {
                Ok(_) | Err(QueueError::AlreadySubmitted(_)) => {}
                Err(err) => {
                    warn!(aggregate_id = %self.id, member = %member.id(), error = %err, "aggregate member could not be submitted");
                    member.abandon();
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Operation for AggregateOperation {
    fn id(&self) -> &OperationId {
        &self.id
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn dependencies(&self) -> Vec<Arc<dyn Operation>> {
        self.members
            .iter()
            .map(|member| Arc::clone(member) as Arc<dyn Operation>)
            .collect()
    }

    async fn run(&self) {
        self.lifecycle.complete();
    }
}
