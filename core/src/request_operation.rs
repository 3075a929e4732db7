//! A single HTTP request driven through retries and session recovery.
//!
//! # Design
//! The retry loop is an explicit state machine over two steps:
//!
//! - `Execute` sends the prepared request once and classifies the outcome.
//!   Success ends the loop. A 401 moves to `Recover`. Any other failure
//!   retries while the attempts budget allows.
//! - `Recover` asks the `SessionRecovery` hook to restore credentials. A
//!   successful restore resets the attempts counter and goes back to
//!   `Execute`. A failed restore tries again, consuming the same budget.
//!
//! Restores are serialized process-wide through a single-permit gate so that
//! concurrent 401s never refresh credentials in parallel. The request is
//! prepared once at build time; a malformed description is rejected there and
//! never reaches the loop.
//!
//! The completion callback fires exactly once: with the final outcome of this
//! operation, or, when the queue suppressed it as a duplicate, with the outcome
//! of the operation that ran in its place.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{RetryPolicy, Sessions};
use crate::error::{ProtocolMisuse, QueueError, RequestError, ResponseError};
use crate::http::HttpRequest;
use crate::operation::{IdGenerator, Lifecycle, Operation, OperationId, UuidIds};
use crate::queue::{QualityOfService, SubmitOptions, SubmitOutcome, WorkQueue};
use crate::request::RequestSpec;
use crate::response::{classify, ResponseData};
use crate::transport::Transport;

/// Final outcome delivered to a request's callback.
pub type RequestResult = Result<ResponseData, RequestError>;

type Completion = Box<dyn FnOnce(RequestResult) + Send>;

/// Host hook for recovering from 401 responses.
#[async_trait]
pub trait SessionRecovery: Send + Sync + 'static {
    /// Try to obtain fresh credentials after `error`. Return `true` when the
    /// request should be re-sent.
    async fn restore_session(&self, error: &ResponseError) -> bool {
        let _ = error;
        false
    }

    /// Decorate every attempt, e.g. with the current bearer token.
    fn authorize(&self, request: &mut HttpRequest) {
        let _ = request;
    }
}

/// Never restores; a 401 just burns the attempts budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecovery;

impl SessionRecovery for NoRecovery {}

/// Process-wide gate that serializes session restores.
pub fn recovery_gate() -> Arc<Semaphore> {
    static GATE: OnceLock<Arc<Semaphore>> = OnceLock::new();
    Arc::clone(GATE.get_or_init(|| Arc::new(Semaphore::new(1))))
}

enum Step {
    Execute,
    Recover(ResponseError),
}

pub struct RequestOperation {
    id: OperationId,
    spec: RequestSpec,
    prepared: HttpRequest,
    transport: Arc<dyn Transport>,
    recovery: Arc<dyn SessionRecovery>,
    gate: Arc<Semaphore>,
    policy: RetryPolicy,
    queue: Option<WorkQueue>,
    options: SubmitOptions,
    lifecycle: Lifecycle,
    attempts: AtomicU32,
    restores: AtomicU32,
    successful: AtomicBool,
    submitted: AtomicBool,
    outcome: Mutex<Option<RequestResult>>,
    completion: Mutex<Option<Completion>>,
}

impl std::fmt::Debug for RequestOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOperation")
            .field("id", &self.id)
            .field("endpoint", &self.spec.endpoint)
            .field("attempts", &self.attempts())
            .field("finished", &self.lifecycle.is_finished())
            .finish()
    }
}

impl RequestOperation {
    pub fn builder(spec: RequestSpec, transport: Arc<dyn Transport>) -> RequestOperationBuilder {
        RequestOperationBuilder {
            spec,
            transport,
            id: None,
            ids: Arc::new(UuidIds),
            recovery: Arc::new(NoRecovery),
            gate: None,
            policy: RetryPolicy::default(),
            sessions: Sessions::standard(),
            queue: None,
            options: SubmitOptions::default(),
        }
    }

    pub fn spec(&self) -> &RequestSpec {
        &self.spec
    }

    /// The wire request every attempt starts from, before `authorize`.
    pub fn prepared(&self) -> &HttpRequest {
        &self.prepared
    }

    /// Current value of the attempts counter. Reset to 0 by a successful restore.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Session restores that reported success.
    pub fn restores(&self) -> u32 {
        self.restores.load(Ordering::Acquire)
    }

    pub fn is_successful(&self) -> bool {
        self.successful.load(Ordering::Acquire)
    }

    /// The final outcome, once finished. A cancelled operation that never ran
    /// reports `RequestError::Cancelled`.
    pub fn outcome(&self) -> Option<RequestResult> {
        let outcome = self.outcome.lock().clone();
        match outcome {
            Some(outcome) => Some(outcome),
            None if self.lifecycle.is_finished() => Some(Err(RequestError::Cancelled)),
            None => None,
        }
    }

    /// Submit to the configured queue (the shared queue by default).
    ///
    /// # Errors
    ///
    /// - `QueueError::AlreadySubmitted` on a second call.
    /// - `QueueError::NoRuntime` outside a tokio runtime.
    pub fn execute(self: &Arc<Self>) -> Result<SubmitOutcome, QueueError> {
        if self.submitted.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadySubmitted(self.id.clone()));
        }
        let queue = self.queue.clone().unwrap_or_else(WorkQueue::shared);
        let this = Arc::clone(self);
        let submitted = queue.submit_with(Arc::clone(self), self.options, move |ran| {
            if !Arc::ptr_eq(&ran, &this) {
                this.adopt(&ran);
            }
            this.deliver();
        });
        if submitted.is_err() {
            self.submitted.store(false, Ordering::Release);
        }
        submitted
    }

    /// Take over the outcome of the duplicate that ran in our place.
    fn adopt(&self, ran: &RequestOperation) {
        let outcome = ran.outcome().unwrap_or(Err(RequestError::Cancelled));
        debug!(operation_id = %self.id, ok = outcome.is_ok(), "adopting outcome of deduplicated request");
        self.record(outcome);
    }

    /// Finish as cancelled without ever being queued, so dependents are released.
    pub(crate) fn abandon(&self) {
        self.lifecycle.cancel();
        if !self.lifecycle.is_finished() {
            self.record(Err(RequestError::Cancelled));
            self.deliver();
        }
    }

    fn deliver(&self) {
        let completion = self.completion.lock().take();
        let outcome = self.outcome().unwrap_or(Err(RequestError::Cancelled));
        if let Some(completion) = completion {
            completion(outcome);
        }
    }

    fn record(&self, outcome: RequestResult) {
        self.successful.store(outcome.is_ok(), Ordering::Release);
        *self.outcome.lock() = Some(outcome);
        self.lifecycle.complete();
    }

    async fn drive(&self) -> RequestResult {
        let max_retries = self.policy.max_retries;
        let mut attempts = 0;
        let mut restores = 0;
        let mut step = Step::Execute;

        loop {
            if self.lifecycle.is_cancelled() {
                debug!(operation_id = %self.id, "request cancelled between attempts");
                return Err(RequestError::Cancelled);
            }

            step = match step {
                Step::Execute => match self.attempt(attempts).await {
                    Ok(data) => {
                        debug!(operation_id = %self.id, status = data.status, attempts, "request succeeded");
                        return Ok(data);
                    }
                    Err(err) if err.is_unauthorized() => {
                        debug!(operation_id = %self.id, "unauthorized, attempting session restore");
                        Step::Recover(err)
                    }
                    Err(err) if attempts < max_retries => {
                        attempts += 1;
                        self.attempts.store(attempts, Ordering::Release);
                        warn!(operation_id = %self.id, attempt = attempts, max_retries, error = %err, "request failed, retrying");
                        Step::Execute
                    }
                    Err(err) => return Err(self.exhausted(attempts, err)),
                },
                Step::Recover(err) => {
                    if restores >= self.policy.max_session_restores {
                        debug!(operation_id = %self.id, restores, "session restore limit reached");
                        return Err(self.exhausted(attempts, err));
                    }
                    if self.restore(&err).await {
                        restores += 1;
                        attempts = 0;
                        self.restores.store(restores, Ordering::Release);
                        self.attempts.store(attempts, Ordering::Release);
                        info!(operation_id = %self.id, restores, "session restored, re-sending request");
                        Step::Execute
                    } else if attempts < max_retries {
                        attempts += 1;
                        self.attempts.store(attempts, Ordering::Release);
                        warn!(operation_id = %self.id, attempt = attempts, max_retries, "session restore failed, trying again");
                        Step::Recover(err)
                    } else {
                        return Err(self.exhausted(attempts, err));
                    }
                }
            };
        }
    }

    async fn attempt(&self, attempt: u32) -> Result<ResponseData, ResponseError> {
        let mut request = self.prepared.clone();
        self.recovery.authorize(&mut request);
        debug!(
            operation_id = %self.id,
            attempt,
            method = request.method.as_str(),
            url = %request.url,
            "sending request"
        );
        classify(self.transport.execute(request).await)
    }

    async fn restore(&self, error: &ResponseError) -> bool {
        let Ok(_permit) = self.gate.acquire().await else {
            return false;
        };
        self.recovery.restore_session(error).await
    }

    fn exhausted(&self, attempts: u32, last: ResponseError) -> RequestError {
        error!(operation_id = %self.id, attempts, error = %last, "giving up on request");
        RequestError::Exhausted { attempts, last }
    }
}

#[async_trait]
impl Operation for RequestOperation {
    fn id(&self) -> &OperationId {
        &self.id
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        let outcome = self.drive().await;
        self.record(outcome);
    }
}

pub struct RequestOperationBuilder {
    spec: RequestSpec,
    transport: Arc<dyn Transport>,
    id: Option<OperationId>,
    ids: Arc<dyn IdGenerator>,
    recovery: Arc<dyn SessionRecovery>,
    gate: Option<Arc<Semaphore>>,
    policy: RetryPolicy,
    sessions: Sessions,
    queue: Option<WorkQueue>,
    options: SubmitOptions,
}

impl RequestOperationBuilder {
    /// Deduplication key. Requests with equal ids are the same request.
    pub fn id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Generator used when no explicit id is set.
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn recovery(mut self, recovery: Arc<dyn SessionRecovery>) -> Self {
        self.recovery = recovery;
        self
    }

    /// Gate serializing session restores. Defaults to the process-wide one.
    pub fn recovery_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sessions(mut self, sessions: Sessions) -> Self {
        self.sessions = sessions;
        self
    }

    /// Queue used by `execute`. Defaults to `WorkQueue::shared()`.
    pub fn queue(mut self, queue: WorkQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn ignore_if_duplicate(mut self, ignore: bool) -> Self {
        self.options.ignore_if_duplicate = ignore;
        self
    }

    pub fn qos(mut self, qos: QualityOfService) -> Self {
        self.options.qos = qos;
        self
    }

    /// Prepare the request and create the operation. `completion` runs once,
    /// after the operation finishes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolMisuse` when the `RequestSpec` cannot be turned into a request.
    pub fn build<F>(self, completion: F) -> Result<Arc<RequestOperation>, ProtocolMisuse>
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        let prepared = self.spec.prepare(&self.sessions).map_err(|err| {
            error!(endpoint = %self.spec.endpoint, error = %err, "rejecting malformed request");
            err
        })?;
        Ok(Arc::new(RequestOperation {
            id: self.id.unwrap_or_else(|| self.ids.next_id()),
            spec: self.spec,
            prepared,
            transport: self.transport,
            recovery: self.recovery,
            gate: self.gate.unwrap_or_else(recovery_gate),
            policy: self.policy,
            queue: self.queue,
            options: self.options,
            lifecycle: Lifecycle::new(),
            attempts: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            successful: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            outcome: Mutex::new(None),
            completion: Mutex::new(Some(Box::new(completion))),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::config::QueueConfig;
    use crate::error::TransportError;
    use crate::http::HttpResponse;
    use crate::operation::SequentialIds;
    use crate::response::StatusCategory;

    const URL: &str = "http://localhost:3000/items";

    /// Replays canned responses and records the requests it saw.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        seen: Mutex<Vec<HttpRequest>>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Self::with_delay(statuses, None)
        }

        fn with_delay(statuses: &[u16], delay: Option<Duration>) -> Arc<Self> {
            let responses = statuses
                .iter()
                .map(|&status| Ok(HttpResponse::new(status, format!("status {status}"))))
                .collect();
            Arc::new(Self {
                responses: Mutex::new(responses),
                seen: Mutex::default(),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::new("script exhausted")))
        }
    }

    /// Restore hook that answers from a script and stamps a token on requests.
    struct ScriptedRecovery {
        answers: Mutex<VecDeque<bool>>,
        calls: AtomicUsize,
    }

    impl ScriptedRecovery {
        fn new(answers: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionRecovery for ScriptedRecovery {
        async fn restore_session(&self, error: &ResponseError) -> bool {
            assert!(error.is_unauthorized());
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().pop_front().unwrap_or(false)
        }

        fn authorize(&self, request: &mut HttpRequest) {
            let token = self.calls.load(Ordering::SeqCst);
            request.set_header("Authorization", format!("Bearer {token}"));
        }
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(QueueConfig::new("test", 4))
    }

    async fn run(op_builder: RequestOperationBuilder) -> (Arc<RequestOperation>, RequestResult) {
        let (tx, rx) = oneshot::channel();
        let op = op_builder
            .queue(queue())
            .recovery_gate(Arc::new(Semaphore::new(1)))
            .build(move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        op.execute().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        (op, result)
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let transport = Scripted::new(&[200]);
        let (op, result) = run(RequestOperation::builder(RequestSpec::get(URL), transport.clone())).await;
        let data = result.unwrap();
        assert_eq!(data.text().as_deref(), Some("status 200"));
        assert!(op.is_successful());
        assert_eq!(op.attempts(), 0);
        assert_eq!(transport.calls(), 1);
        assert!(op.is_finished());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = Scripted::new(&[500, 503, 200]);
        let (op, result) = run(RequestOperation::builder(RequestSpec::get(URL), transport.clone())).await;
        assert!(result.is_ok());
        assert_eq!(op.attempts(), 2);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn persistent_failure_gives_up_after_budget() {
        let transport = Scripted::new(&[500, 500, 500, 500, 500]);
        let (op, result) = run(RequestOperation::builder(RequestSpec::get(URL), transport.clone())).await;
        let err = result.unwrap_err();
        assert!(matches!(err, RequestError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.category(), Some(StatusCategory::InternalServerError));
        assert_eq!(transport.calls(), 4);
        assert!(!op.is_successful());
    }

    #[tokio::test]
    async fn transport_errors_count_against_the_budget() {
        let transport = Scripted::new(&[]);
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let (_, result) = run(RequestOperation::builder(RequestSpec::get(URL), transport.clone()).policy(policy)).await;
        let err = result.unwrap_err();
        assert_eq!(err.category(), Some(StatusCategory::Unlisted));
        assert_eq!(err.status(), None);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn unauthorized_without_recovery_fails_with_the_auth_error() {
        let transport = Scripted::new(&[401]);
        let (_, result) = run(RequestOperation::builder(RequestSpec::get(URL), transport.clone())).await;
        let err = result.unwrap_err();
        assert_eq!(err.category(), Some(StatusCategory::Unauthorized));
        assert_eq!(err.status(), Some(401));
        // Only the restore hook is retried; the request went out once.
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn restore_is_retried_until_it_succeeds_then_request_is_resent() {
        let transport = Scripted::new(&[401, 200]);
        let recovery = ScriptedRecovery::new(&[false, false, true]);
        let (op, result) = run(
            RequestOperation::builder(RequestSpec::get(URL), transport.clone())
                .recovery(recovery.clone()),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(recovery.calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.calls(), 2);
        assert_eq!(op.attempts(), 0);
        assert_eq!(op.restores(), 1);

        let seen = transport.seen.lock();
        assert_eq!(seen[0].header("authorization"), Some("Bearer 0"));
        assert_eq!(seen[1].header("authorization"), Some("Bearer 3"));
    }

    #[tokio::test]
    async fn failed_restores_exhaust_the_budget() {
        let transport = Scripted::new(&[401]);
        let recovery = ScriptedRecovery::new(&[]);
        let (_, result) = run(
            RequestOperation::builder(RequestSpec::get(URL), transport.clone())
                .recovery(recovery.clone()),
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RequestError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.category(), Some(StatusCategory::Unauthorized));
        assert_eq!(recovery.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn server_that_keeps_rejecting_fresh_credentials_terminates() {
        let transport = Scripted::new(&[401; 10]);
        let recovery = ScriptedRecovery::new(&[true; 10]);
        let policy = RetryPolicy {
            max_retries: 3,
            max_session_restores: 2,
        };
        let (op, result) = run(
            RequestOperation::builder(RequestSpec::get(URL), transport.clone())
                .recovery(recovery.clone())
                .policy(policy),
        )
        .await;
        assert_eq!(result.unwrap_err().category(), Some(StatusCategory::Unauthorized));
        assert_eq!(op.restores(), 2);
        assert_eq!(transport.calls(), 3);
        // No third refresh once the limit is reached.
        assert_eq!(recovery.calls.load(Ordering::SeqCst), 2);
    }

    /// Tracks how many restores are in flight at once.
    struct CountingRecovery {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SessionRecovery for CountingRecovery {
        async fn restore_session(&self, _error: &ResponseError) -> bool {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_unauthorized_requests_restore_one_at_a_time() {
        let queue = queue();
        let gate = Arc::new(Semaphore::new(1));
        let recovery = Arc::new(CountingRecovery {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut receivers = Vec::new();
        let mut ops = Vec::new();
        for id in ["first", "second", "third"] {
            let (tx, rx) = oneshot::channel();
            let op = RequestOperation::builder(RequestSpec::get(URL), Scripted::new(&[401, 200]))
                .id(id)
                .queue(queue.clone())
                .recovery(recovery.clone())
                .recovery_gate(Arc::clone(&gate))
                .build(move |r| {
                    let _ = tx.send(r);
                })
                .unwrap();
            ops.push(op);
            receivers.push(rx);
        }
        for op in &ops {
            assert_eq!(op.execute().unwrap(), SubmitOutcome::Enqueued);
        }
        for rx in receivers {
            let result = tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .unwrap()
                .unwrap();
            assert!(result.is_ok());
        }
        assert_eq!(recovery.peak.load(Ordering::SeqCst), 1);
        assert!(ops.iter().all(|op| op.restores() == 1));
    }

    #[tokio::test]
    async fn duplicate_receives_the_outcome_of_the_request_that_ran() {
        let transport = Scripted::with_delay(&[200, 200], Some(Duration::from_millis(50)));
        let queue = queue();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let first = RequestOperation::builder(RequestSpec::get(URL), transport.clone())
            .id("X")
            .queue(queue.clone())
            .build(move |r| {
                let _ = tx1.send(r);
            })
            .unwrap();
        let second = RequestOperation::builder(RequestSpec::get(URL), transport.clone())
            .id("X")
            .queue(queue.clone())
            .build(move |r| {
                let _ = tx2.send(r);
            })
            .unwrap();

        assert_eq!(first.execute().unwrap(), SubmitOutcome::Enqueued);
        assert_eq!(second.execute().unwrap(), SubmitOutcome::Deduplicated);
        let a = rx1.await.unwrap().unwrap();
        let b = rx2.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(transport.calls(), 1);
        assert!(second.is_finished());
        assert!(second.is_successful());
        queue.wait_until_idle().await;
    }

    #[tokio::test]
    async fn execute_twice_is_rejected() {
        let transport = Scripted::new(&[200]);
        let op = RequestOperation::builder(RequestSpec::get(URL), transport)
            .queue(queue())
            .build(|_| {})
            .unwrap();
        op.execute().unwrap();
        assert_eq!(
            op.execute().unwrap_err(),
            QueueError::AlreadySubmitted(op.id().clone())
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancelled() {
        let transport = Scripted::new(&[200]);
        let (tx, rx) = oneshot::channel();
        let op = RequestOperation::builder(RequestSpec::get(URL), transport.clone())
            .queue(queue())
            .build(move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        op.cancel();
        op.execute().unwrap();
        assert_eq!(rx.await.unwrap().unwrap_err(), RequestError::Cancelled);
        assert_eq!(transport.calls(), 0);
        assert!(!op.is_successful());
    }

    #[tokio::test]
    async fn cancel_stops_retrying_between_attempts() {
        let transport = Scripted::with_delay(&[500, 500, 500, 500], Some(Duration::from_millis(50)));
        let (tx, rx) = oneshot::channel();
        let op = RequestOperation::builder(RequestSpec::get(URL), transport.clone())
            .queue(queue())
            .build(move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        op.execute().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        op.cancel();
        assert_eq!(rx.await.unwrap().unwrap_err(), RequestError::Cancelled);
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn malformed_request_is_rejected_at_build() {
        let err = RequestOperation::builder(RequestSpec::get("not a url"), Scripted::new(&[]))
            .build(|_| {})
            .unwrap_err();
        assert!(matches!(err, ProtocolMisuse::InvalidUrl { .. }));
    }

    #[test]
    fn ids_come_from_the_configured_generator() {
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIds::new("req"));
        let a = RequestOperation::builder(RequestSpec::get(URL), Scripted::new(&[]))
            .ids(Arc::clone(&ids))
            .build(|_| {})
            .unwrap();
        let b = RequestOperation::builder(RequestSpec::get(URL), Scripted::new(&[]))
            .ids(ids)
            .build(|_| {})
            .unwrap();
        assert_eq!(a.id().as_str(), "req-1");
        assert_eq!(b.id().as_str(), "req-2");
    }
}
