//! Per-request dispatch.
//!
//! A request is processed (stub lookup plus extraction) on a worker, off
//! the thread that accepts connections. A continuation then renders the
//! response and hands it to a [`ResponseSink`]. The caller gets
//! [`Dispatch::InProgress`] back immediately; if the work cannot be
//! scheduled, or the continuation cannot be attached, it gets a ready
//! `500` response instead.

use crate::registry::StubRegistry;
use crate::request::Request;
use crate::stub::{ExtractedData, Response, Stub};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

/// Everything the render step needs: the request, the stub that matched
/// it (if any) and the data that stub's extractors produced.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub request: Request,
    pub stub: Option<Arc<Stub>>,
    pub data: Option<ExtractedData>,
}

/// Work scheduled off the accepting thread.
pub type Job = Box<dyn FnOnce() -> RequestEnvelope + Send + 'static>;

/// Continuation invoked once a [`Job`] has finished.
pub type Continuation = Box<dyn FnOnce(Result<RequestEnvelope, JobError>) + Send + 'static>;

/// Why a scheduled job produced no envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("request processing panicked")]
    Panicked,
    #[error("request processing timed out after {0:?}")]
    TimedOut(Duration),
    #[error("request processing was cancelled")]
    Cancelled,
}

/// Scheduling failures, reported synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to defer request to a thread: {0}")]
    Defer(String),
    #[error("Failed to add callback to deferred object: {0}")]
    Callback(String),
}

/// Runs jobs away from the caller's thread.
pub trait Scheduler: Send + Sync {
    fn defer(&self, job: Job) -> Result<Box<dyn Deferred>, DispatchError>;
}

/// Handle to a scheduled job.
pub trait Deferred: Send {
    /// Attach the continuation that receives the job's result.
    fn add_callback(self: Box<Self>, callback: Continuation) -> Result<(), DispatchError>;
}

/// Receives the rendered response for an in-progress request.
pub trait ResponseSink: Send + 'static {
    fn respond(self: Box<Self>, response: Response);
}

impl ResponseSink for oneshot::Sender<Response> {
    fn respond(self: Box<Self>, response: Response) {
        if (*self).send(response).is_err() {
            debug!("Client went away before the response was ready");
        }
    }
}

/// Outcome of [`RequestDispatcher::dispatch`].
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The response will be delivered to the sink later.
    InProgress,
    /// Scheduling failed; this response must be written by the caller.
    Immediate(Response),
}

/// Scheduler backed by tokio's blocking thread pool.
///
/// At most `max_in_flight` jobs run at once; `defer` fails when all permits
/// are taken. Continuations wait at most `timeout` for the job.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl TokioScheduler {
    pub fn new(handle: Handle, max_in_flight: usize, timeout: Option<Duration>) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            timeout,
        }
    }

    /// Scheduler on the runtime the caller is running in.
    pub fn current(max_in_flight: usize, timeout: Option<Duration>) -> Result<Self, DispatchError> {
        let handle = Handle::try_current().map_err(|e| DispatchError::Defer(e.to_string()))?;
        Ok(Self::new(handle, max_in_flight, timeout))
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Scheduler for TokioScheduler {
    fn defer(&self, job: Job) -> Result<Box<dyn Deferred>, DispatchError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| DispatchError::Defer("too many requests in flight".to_string()))?;

        let join = self.handle.spawn_blocking(move || {
            let _permit = permit;
            job()
        });

        Ok(Box::new(TokioDeferred {
            handle: self.handle.clone(),
            join,
            timeout: self.timeout,
        }))
    }
}

struct TokioDeferred {
    handle: Handle,
    join: tokio::task::JoinHandle<RequestEnvelope>,
    timeout: Option<Duration>,
}

impl Deferred for TokioDeferred {
    fn add_callback(self: Box<Self>, callback: Continuation) -> Result<(), DispatchError> {
        let TokioDeferred {
            handle,
            join,
            timeout,
        } = *self;

        handle.spawn(async move {
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, join).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        callback(Err(JobError::TimedOut(limit)));
                        return;
                    }
                },
                None => join.await,
            };

            let outcome = joined.map_err(|e| {
                if e.is_panic() {
                    JobError::Panicked
                } else {
                    JobError::Cancelled
                }
            });
            callback(outcome);
        });
        Ok(())
    }
}

/// Looks up the stub for a request and renders its response.
pub struct RequestProcessor {
    registry: Arc<StubRegistry>,
    unhandled: Option<Response>,
}

impl RequestProcessor {
    pub fn new(registry: Arc<StubRegistry>) -> Self {
        Self {
            registry,
            unhandled: None,
        }
    }

    /// Response used when no stub matches, instead of the default `404`.
    pub fn with_unhandled_response(mut self, response: Response) -> Self {
        self.unhandled = Some(response);
        self
    }

    pub fn registry(&self) -> &Arc<StubRegistry> {
        &self.registry
    }

    /// Resolve the matching stub and, only if one matched, run its extractors.
    pub fn process(&self, request: Request) -> RequestEnvelope {
        let stub = self.registry.find_match(&request);
        let data = stub.as_ref().map(|stub| stub.extract_data(&request));
        RequestEnvelope {
            request,
            stub,
            data,
        }
    }

    /// Call the matched stub's render function. Panics in user code become
    /// a `500`.
    pub fn render(&self, envelope: &RequestEnvelope) -> Response {
        let Some(stub) = &envelope.stub else {
            return self.unhandled_response(&envelope.request);
        };

        let empty = ExtractedData::new();
        let data = envelope.data.as_ref().unwrap_or(&empty);
        match panic::catch_unwind(AssertUnwindSafe(|| stub.render(&envelope.request, data))) {
            Ok(response) => response,
            Err(_) => {
                error!(stub_id = %stub.id(), "Stub render function panicked");
                Response::text(500, format!("Stub {} failed to render", stub.id()))
            }
        }
    }

    fn unhandled_response(&self, request: &Request) -> Response {
        match &self.unhandled {
            Some(response) => response.clone(),
            None => Response::text(
                404,
                format!("No stub matches {} {}", request.method, request.path),
            ),
        }
    }
}

/// Request counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
    requests_failed: AtomicU64,
}

impl DispatchStats {
    pub fn total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub fn unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Requests that got a 5xx from the dispatcher itself.
    pub fn failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }
}

/// Logging switches for the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatchLogging {
    pub log_matches: bool,
    pub log_unmatched: bool,
}

impl Default for DispatchLogging {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
        }
    }
}

/// Connects inbound requests to the stub engine without blocking the caller.
pub struct RequestDispatcher {
    processor: Arc<RequestProcessor>,
    scheduler: Arc<dyn Scheduler>,
    stats: Arc<DispatchStats>,
    logging: DispatchLogging,
}

impl RequestDispatcher {
    pub fn new(processor: RequestProcessor, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            processor: Arc::new(processor),
            scheduler,
            stats: Arc::new(DispatchStats::default()),
            logging: DispatchLogging::default(),
        }
    }

    pub fn with_logging(mut self, logging: DispatchLogging) -> Self {
        self.logging = logging;
        self
    }

    pub fn processor(&self) -> &Arc<RequestProcessor> {
        &self.processor
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Schedule `request` and return without waiting for it.
    pub fn dispatch(&self, request: Request, sink: Box<dyn ResponseSink>) -> Dispatch {
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

        let processor = Arc::clone(&self.processor);
        let job: Job = Box::new(move || processor.process(request));

        let deferred = match self.scheduler.defer(job) {
            Ok(deferred) => deferred,
            Err(e) => return self.fail(e),
        };

        let processor = Arc::clone(&self.processor);
        let stats = Arc::clone(&self.stats);
        let logging = self.logging;
        let continuation: Continuation = Box::new(move |outcome| {
            let response = match outcome {
                Ok(envelope) => {
                    log_outcome(&envelope, &stats, logging);
                    processor.render(&envelope)
                }
                Err(e) => {
                    stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    match e {
                        JobError::TimedOut(limit) => {
                            warn!(timeout = ?limit, "Request processing timed out");
                            Response::text(504, "Request processing timed out")
                        }
                        JobError::Panicked | JobError::Cancelled => {
                            error!(error = %e, "Request processing failed");
                            Response::text(500, "Request processing failed")
                        }
                    }
                }
            };
            sink.respond(response);
        });

        match deferred.add_callback(continuation) {
            Ok(()) => Dispatch::InProgress,
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, e: DispatchError) -> Dispatch {
        error!(error = %e, "Failed to dispatch request");
        self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        Dispatch::Immediate(Response::text(500, e.to_string()))
    }
}

fn log_outcome(envelope: &RequestEnvelope, stats: &DispatchStats, logging: DispatchLogging) {
    let request = &envelope.request;
    match &envelope.stub {
        Some(stub) => {
            stats.requests_matched.fetch_add(1, Ordering::Relaxed);
            if logging.log_matches {
                info!(
                    stub_id = %stub.id(),
                    method = %request.method,
                    path = %request.path,
                    "Request matched stub"
                );
            }
        }
        None => {
            stats.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            if logging.log_unmatched {
                info!(method = %request.method, path = %request.path, "No stub matched request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::PathExtractor;
    use crate::matcher::{MethodMatcher, PathMatcher};
    use crate::request::Method;
    use crate::stub::tests::ok_stub;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Runs jobs and continuations on the calling thread.
    struct InlineScheduler;

    struct InlineDeferred(RequestEnvelope);

    impl Scheduler for InlineScheduler {
        fn defer(&self, job: Job) -> Result<Box<dyn Deferred>, DispatchError> {
            Ok(Box::new(InlineDeferred(job())))
        }
    }

    impl Deferred for InlineDeferred {
        fn add_callback(self: Box<Self>, callback: Continuation) -> Result<(), DispatchError> {
            callback(Ok(self.0));
            Ok(())
        }
    }

    struct RefusingScheduler {
        calls: AtomicUsize,
    }

    impl Scheduler for RefusingScheduler {
        fn defer(&self, _job: Job) -> Result<Box<dyn Deferred>, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::Defer("no worker available".to_string()))
        }
    }

    struct CallbackRefusingScheduler {
        callback_attempts: Arc<AtomicUsize>,
    }

    struct CallbackRefusingDeferred {
        callback_attempts: Arc<AtomicUsize>,
    }

    impl Scheduler for CallbackRefusingScheduler {
        fn defer(&self, _job: Job) -> Result<Box<dyn Deferred>, DispatchError> {
            Ok(Box::new(CallbackRefusingDeferred {
                callback_attempts: Arc::clone(&self.callback_attempts),
            }))
        }
    }

    impl Deferred for CallbackRefusingDeferred {
        fn add_callback(self: Box<Self>, _callback: Continuation) -> Result<(), DispatchError> {
            self.callback_attempts.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::Callback("deferred already consumed".to_string()))
        }
    }

    /// Sink that records what it was given.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Response>>>);

    impl ResponseSink for RecordingSink {
        fn respond(self: Box<Self>, response: Response) {
            self.0.lock().push(response);
        }
    }

    fn user_registry() -> Arc<StubRegistry> {
        let registry = Arc::new(StubRegistry::new());
        let stub = Stub::new("user", |_, data| {
            let id = data
                .get("PATH '/users/{id}'")
                .and_then(|e| e.named.get("id"))
                .cloned()
                .unwrap_or_default();
            Response::text(200, format!("user {}", id))
        })
        .with_matcher(MethodMatcher::new(Method::Get))
        .with_matcher(PathMatcher::path("/users/{id}").unwrap())
        .with_extractor(PathExtractor::new("/users/{id}").unwrap());
        registry.add(stub).unwrap();
        registry
    }

    #[test]
    fn test_process_matching_stub_extracts_data() {
        let processor = RequestProcessor::new(user_registry());
        let envelope = processor.process(Request::new("GET", "/users/9"));

        assert_eq!(envelope.request.path, "/users/9");
        assert_eq!(envelope.stub.as_ref().unwrap().id(), "user");
        let data = envelope.data.unwrap();
        assert_eq!(data["PATH '/users/{id}'"].named["id"], "9");
    }

    #[test]
    fn test_process_without_match_skips_extraction() {
        let processor = RequestProcessor::new(user_registry());
        let envelope = processor.process(Request::new("POST", "/users/9"));
        assert!(envelope.stub.is_none());
        assert!(envelope.data.is_none());
    }

    #[test]
    fn test_process_match_with_failed_extraction() {
        let registry = Arc::new(StubRegistry::new());
        registry
            .add(ok_stub("any").with_extractor(PathExtractor::new("/never").unwrap()))
            .unwrap();
        let processor = RequestProcessor::new(registry);

        let envelope = processor.process(Request::new("GET", "/other"));
        assert_eq!(envelope.stub.unwrap().id(), "any");
        assert!(envelope.data.unwrap().is_empty());
    }

    #[test]
    fn test_render_unhandled() {
        let processor = RequestProcessor::new(Arc::new(StubRegistry::new()));
        let envelope = processor.process(Request::new("GET", "/nothing"));
        let response = processor.render(&envelope);
        assert_eq!(response.status, 404);
        assert_eq!(response.body_str(), Some("No stub matches GET /nothing"));

        let processor = processor.with_unhandled_response(Response::text(418, "teapot"));
        let response = processor.render(&envelope);
        assert_eq!(response.status, 418);
    }

    #[test]
    fn test_render_panic_becomes_500() {
        let registry = Arc::new(StubRegistry::new());
        registry
            .add(Stub::new("boom", |_, _| panic!("render exploded")))
            .unwrap();
        let processor = RequestProcessor::new(registry);

        let envelope = processor.process(Request::new("GET", "/"));
        let response = processor.render(&envelope);
        assert_eq!(response.status, 500);
        assert_eq!(response.body_str(), Some("Stub boom failed to render"));
    }

    #[test]
    fn test_dispatch_inline_delivers_to_sink() {
        let dispatcher = RequestDispatcher::new(
            RequestProcessor::new(user_registry()),
            Arc::new(InlineScheduler),
        );
        let sink = RecordingSink::default();

        let outcome = dispatcher.dispatch(Request::new("GET", "/users/5"), Box::new(sink.clone()));
        assert_eq!(outcome, Dispatch::InProgress);

        let responses = sink.0.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].body_str(), Some("user 5"));
        assert_eq!(dispatcher.stats().total(), 1);
        assert_eq!(dispatcher.stats().matched(), 1);
    }

    #[test]
    fn test_dispatch_defer_failure() {
        let scheduler = Arc::new(RefusingScheduler {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = RequestDispatcher::new(
            RequestProcessor::new(user_registry()),
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        );
        let sink = RecordingSink::default();

        let outcome = dispatcher.dispatch(Request::new("GET", "/users/5"), Box::new(sink.clone()));
        let Dispatch::Immediate(response) = outcome else {
            panic!("expected an immediate response");
        };
        assert_eq!(response.status, 500);
        assert!(response
            .body_str()
            .unwrap()
            .contains("Failed to defer request to a thread"));
        assert_eq!(scheduler.calls.load(Ordering::SeqCst), 1);
        assert!(sink.0.lock().is_empty());
        assert_eq!(dispatcher.stats().failed(), 1);
    }

    #[test]
    fn test_dispatch_callback_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(
            RequestProcessor::new(user_registry()),
            Arc::new(CallbackRefusingScheduler {
                callback_attempts: Arc::clone(&attempts),
            }),
        );

        let outcome = dispatcher.dispatch(
            Request::new("GET", "/users/5"),
            Box::new(RecordingSink::default()),
        );
        let Dispatch::Immediate(response) = outcome else {
            panic!("expected an immediate response");
        };
        assert_eq!(response.status, 500);
        assert!(response
            .body_str()
            .unwrap()
            .contains("Failed to add callback to deferred object"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_round_trip() {
        let scheduler = TokioScheduler::current(4, Some(Duration::from_secs(5))).unwrap();
        let dispatcher =
            RequestDispatcher::new(RequestProcessor::new(user_registry()), Arc::new(scheduler));

        let (tx, rx) = oneshot::channel();
        let outcome = dispatcher.dispatch(Request::new("GET", "/users/77"), Box::new(tx));
        assert_eq!(outcome, Dispatch::InProgress);

        let response = rx.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), Some("user 77"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_unmatched() {
        let scheduler = TokioScheduler::current(4, None).unwrap();
        let dispatcher =
            RequestDispatcher::new(RequestProcessor::new(user_registry()), Arc::new(scheduler));

        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(Request::new("GET", "/nope"), Box::new(tx));
        let response = rx.await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(dispatcher.stats().unmatched(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_timeout() {
        let registry = Arc::new(StubRegistry::new());
        let slow = ok_stub("slow").with_matcher(SlowMatcher(Duration::from_millis(500)));
        registry.add(slow).unwrap();

        let scheduler = TokioScheduler::current(4, Some(Duration::from_millis(50))).unwrap();
        let dispatcher = RequestDispatcher::new(RequestProcessor::new(registry), Arc::new(scheduler));

        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(Request::new("GET", "/"), Box::new(tx));
        let response = rx.await.unwrap();
        assert_eq!(response.status, 504);
        assert_eq!(dispatcher.stats().failed(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_matcher_panic() {
        let registry = Arc::new(StubRegistry::new());
        registry
            .add(ok_stub("panicky").with_matcher(PanickingMatcher))
            .unwrap();

        let scheduler = TokioScheduler::current(4, None).unwrap();
        let dispatcher = RequestDispatcher::new(RequestProcessor::new(registry), Arc::new(scheduler));

        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(Request::new("GET", "/"), Box::new(tx));
        let response = rx.await.unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body_str(), Some("Request processing failed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_saturation() {
        let registry = Arc::new(StubRegistry::new());
        registry
            .add(ok_stub("slow").with_matcher(SlowMatcher(Duration::from_millis(200))))
            .unwrap();

        let scheduler = TokioScheduler::current(1, None).unwrap();
        let dispatcher = RequestDispatcher::new(RequestProcessor::new(registry), Arc::new(scheduler));

        let (tx1, rx1) = oneshot::channel();
        assert_eq!(
            dispatcher.dispatch(Request::new("GET", "/"), Box::new(tx1)),
            Dispatch::InProgress
        );

        let (tx2, _rx2) = oneshot::channel();
        match dispatcher.dispatch(Request::new("GET", "/"), Box::new(tx2)) {
            Dispatch::Immediate(response) => {
                assert_eq!(response.status, 500);
                assert!(response
                    .body_str()
                    .unwrap()
                    .contains("Failed to defer request to a thread"));
            }
            Dispatch::InProgress => panic!("second request should be refused"),
        }

        assert_eq!(rx1.await.unwrap().status, 200);
    }

    #[test]
    fn test_current_without_runtime_fails() {
        let err = TokioScheduler::current(1, None).unwrap_err();
        assert!(matches!(err, DispatchError::Defer(_)));
    }

    struct SlowMatcher(Duration);

    impl crate::matcher::Matcher for SlowMatcher {
        fn id(&self) -> &str {
            "SLOW"
        }

        fn matches(&self, _request: &Request) -> bool {
            std::thread::sleep(self.0);
            true
        }
    }

    struct PanickingMatcher;

    impl crate::matcher::Matcher for PanickingMatcher {
        fn id(&self) -> &str {
            "PANIC"
        }

        fn matches(&self, _request: &Request) -> bool {
            panic!("matcher exploded")
        }
    }
}
