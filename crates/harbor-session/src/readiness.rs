//! Tracks whether a spawned backend has finished starting.
//!
//! A [`ReadinessTracker`] issues one status request as soon as it is
//! created. If the backend is still loading it follows the status stream
//! until a `Ready` event arrives, then flips its flag and fires the pending
//! `on_ready` callbacks exactly once, in registration order.
//!
//! Failures (non-2xx status, terminal backend state, malformed stream
//! framing, timeouts) leave the tracker permanently not ready and are
//! reported through [`ReadinessTracker::wait`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderValue};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ReadinessError;
use crate::status::{
    BackendState, DecodedLine, InitialStatus, LineBuffer, StatusEvent, classify_status_body,
    decode_line,
};

pub type StatusByteStream = BoxStream<'static, Result<Bytes, ReadinessError>>;

/// Where a tracker reads backend status from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// One-shot plain-text status.
    async fn fetch_status(&self) -> Result<String, ReadinessError>;

    /// Open the `data:`-framed status stream.
    async fn open_stream(&self) -> Result<StatusByteStream, ReadinessError>;
}

/// Status source backed by the control plane's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    http: reqwest::Client,
    status_url: Url,
    stream_url: Url,
}

impl HttpStatusSource {
    pub fn new(status_url: &str) -> Result<Self, ReadinessError> {
        let raw = status_url.trim();
        let status_url = Url::parse(raw)
            .map_err(|err| ReadinessError::InvalidUrl(format!("'{raw}': {err}")))?;
        let stream_raw = format!("{}/stream", status_url.as_str().trim_end_matches('/'));
        let stream_url = Url::parse(&stream_raw)
            .map_err(|err| ReadinessError::InvalidUrl(format!("'{stream_raw}': {err}")))?;
        // No overall request timeout: it would also cut the long-lived stream.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            http,
            status_url,
            stream_url,
        })
    }

    pub fn status_url(&self) -> &Url {
        &self.status_url
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    async fn get(&self, url: &Url, accept: &'static str) -> Result<reqwest::Response, ReadinessError> {
        let res = self
            .http
            .get(url.clone())
            .header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
            .header(ACCEPT, HeaderValue::from_static(accept))
            .send()
            .await?;
        if res.status().is_success() {
            Ok(res)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ReadinessError::StatusFetch { status, body })
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self) -> Result<String, ReadinessError> {
        let res = self.get(&self.status_url, "text/plain").await?;
        Ok(res.text().await?)
    }

    async fn open_stream(&self) -> Result<StatusByteStream, ReadinessError> {
        let res = self.get(&self.stream_url, "text/event-stream").await?;
        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map_err(ReadinessError::from))
            .boxed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessOptions {
    /// Bound on the initial status request.
    pub status_timeout: Option<Duration>,
    /// Bound on the whole wait, status request and stream included.
    pub ready_timeout: Option<Duration>,
}

impl Default for ReadinessOptions {
    fn default() -> Self {
        Self {
            status_timeout: Some(Duration::from_secs(10)),
            ready_timeout: None,
        }
    }
}

impl ReadinessOptions {
    pub fn with_status_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.status_timeout = timeout;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Pending,
    Ready,
    Failed(ReadinessError),
    /// The stream ended without a `Ready` event.
    StreamClosed,
    /// The tracker was destroyed before it settled.
    Cancelled,
}

impl ReadinessOutcome {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ReadinessOutcome::Pending)
    }

    pub fn into_result(self) -> Result<(), ReadinessError> {
        match self {
            ReadinessOutcome::Ready => Ok(()),
            ReadinessOutcome::Failed(err) => Err(err),
            ReadinessOutcome::StreamClosed => Err(ReadinessError::StreamClosed),
            ReadinessOutcome::Pending | ReadinessOutcome::Cancelled => {
                Err(ReadinessError::Cancelled)
            }
        }
    }
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TrackerState {
    callbacks: Vec<(u64, ReadyCallback)>,
    next_id: u64,
    statuses: Vec<StatusEvent>,
    last_state: Option<BackendState>,
    task: Option<JoinHandle<()>>,
    destroyed: bool,
}

struct Shared {
    ready: AtomicBool,
    state: Mutex<TrackerState>,
    outcome: watch::Sender<ReadinessOutcome>,
}

impl Shared {
    fn settle(&self, outcome: ReadinessOutcome) {
        self.outcome.send_if_modified(|current| {
            if current.is_settled() {
                false
            } else {
                *current = outcome;
                true
            }
        });
    }

    fn mark_ready(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            self.ready.store(true, Ordering::SeqCst);
            state.last_state = Some(BackendState::Ready);
            std::mem::take(&mut state.callbacks)
        };
        info!(
            target = "harbor::readiness",
            callbacks = callbacks.len(),
            "backend ready"
        );
        // Outside the lock: callbacks may call back into the tracker,
        // including destroying it, after which the rest must not run.
        for (_, callback) in callbacks {
            if self.state.lock().destroyed {
                break;
            }
            callback();
        }
        // Waiters resume only after every callback has run.
        self.settle(ReadinessOutcome::Ready);
    }

    fn record_state(&self, state: BackendState) {
        self.state.lock().last_state = Some(state);
    }

    fn record_event(&self, event: StatusEvent) {
        let mut state = self.state.lock();
        state.last_state = Some(event.state.clone());
        state.statuses.push(event);
    }
}

/// Readiness flag plus one-shot callbacks for a single backend.
///
/// Clones share the same underlying tracker.
#[derive(Clone)]
pub struct ReadinessTracker {
    shared: Arc<Shared>,
}

impl ReadinessTracker {
    /// Start checking `source` in a background task. Does not block.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(source: S, options: ReadinessOptions) -> Result<Self, ReadinessError>
    where
        S: StatusSource + 'static,
    {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ReadinessError::NoRuntime)?;
        let (outcome, _) = watch::channel(ReadinessOutcome::Pending);
        let shared = Arc::new(Shared {
            ready: AtomicBool::new(false),
            state: Mutex::new(TrackerState::default()),
            outcome,
        });

        let task = runtime.spawn(run(shared.clone(), Box::new(source), options));
        shared.state.lock().task = Some(task);
        Ok(Self { shared })
    }

    /// Track the backend behind `status_url` over HTTP.
    pub fn from_status_url(
        status_url: &str,
        options: ReadinessOptions,
    ) -> Result<Self, ReadinessError> {
        Self::start(HttpStatusSource::new(status_url)?, options)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Run `callback` once the backend is ready.
    ///
    /// If it already is, `callback` runs before this returns and the
    /// returned subscription is inert.
    pub fn on_ready<F>(&self, callback: F) -> ReadySubscription
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if self.is_ready() {
            drop(state);
            callback();
            return ReadySubscription::inert();
        }
        if state.destroyed {
            return ReadySubscription::inert();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Box::new(callback)));
        ReadySubscription {
            id: Some(id),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Resolve once the tracker settles: `Ok` when ready, otherwise the
    /// reason it never will be.
    pub async fn wait(&self) -> Result<(), ReadinessError> {
        let mut rx = self.shared.outcome.subscribe();
        let outcome = match rx.wait_for(ReadinessOutcome::is_settled).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => ReadinessOutcome::Cancelled,
        };
        outcome.into_result()
    }

    pub fn outcome(&self) -> ReadinessOutcome {
        self.shared.outcome.borrow().clone()
    }

    /// Stream events observed so far, oldest first.
    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.shared.state.lock().statuses.clone()
    }

    pub fn last_state(&self) -> Option<BackendState> {
        self.shared.state.lock().last_state.clone()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    /// Stop checking and drop any open stream. Safe to call repeatedly and
    /// at any point, including after the tracker settled.
    pub fn destroy(&self) {
        let task = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.callbacks.clear();
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        // Ready is final even when the destroy lands while callbacks fire.
        let outcome = if self.is_ready() {
            ReadinessOutcome::Ready
        } else {
            ReadinessOutcome::Cancelled
        };
        self.shared.settle(outcome);
        debug!(target = "harbor::readiness", "readiness tracker destroyed");
    }
}

impl std::fmt::Debug for ReadinessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessTracker")
            .field("ready", &self.is_ready())
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Handle returned by [`ReadinessTracker::on_ready`].
#[derive(Debug)]
#[must_use = "dropping the subscription keeps the callback registered; call unsubscribe to remove it"]
pub struct ReadySubscription {
    id: Option<u64>,
    shared: Weak<Shared>,
}

impl ReadySubscription {
    fn inert() -> Self {
        Self {
            id: None,
            shared: Weak::new(),
        }
    }

    /// Whether the callback is still waiting to fire.
    pub fn is_pending(&self) -> bool {
        let (Some(id), Some(shared)) = (self.id, self.shared.upgrade()) else {
            return false;
        };
        shared
            .state
            .lock()
            .callbacks
            .iter()
            .any(|(pending, _)| *pending == id)
    }

    /// Remove the callback if it has not fired yet. Returns whether it was removed.
    pub fn unsubscribe(self) -> bool {
        let (Some(id), Some(shared)) = (self.id, self.shared.upgrade()) else {
            return false;
        };
        let mut state = shared.state.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(pending, _)| *pending != id);
        state.callbacks.len() != before
    }
}

enum Progress {
    Ready,
    StreamClosed,
}

async fn run(shared: Arc<Shared>, source: Box<dyn StatusSource>, options: ReadinessOptions) {
    let check = follow_until_ready(&shared, source.as_ref(), &options);
    let result = match options.ready_timeout {
        Some(limit) => match tokio::time::timeout(limit, check).await {
            Ok(result) => result,
            Err(_) => Err(ReadinessError::Timeout {
                stage: "readiness wait",
                after: limit,
            }),
        },
        None => check.await,
    };

    match result {
        Ok(Progress::Ready) => shared.mark_ready(),
        Ok(Progress::StreamClosed) => {
            warn!(
                target = "harbor::readiness",
                "status stream closed before backend reported ready"
            );
            shared.settle(ReadinessOutcome::StreamClosed);
        }
        Err(err) => {
            warn!(
                target = "harbor::readiness",
                error = %err,
                "backend will not become ready"
            );
            shared.settle(ReadinessOutcome::Failed(err));
        }
    }
}

async fn follow_until_ready(
    shared: &Shared,
    source: &dyn StatusSource,
    options: &ReadinessOptions,
) -> Result<Progress, ReadinessError> {
    let body = match options.status_timeout {
        Some(limit) => tokio::time::timeout(limit, source.fetch_status())
            .await
            .map_err(|_| ReadinessError::Timeout {
                stage: "status request",
                after: limit,
            })??,
        None => source.fetch_status().await?,
    };
    debug!(
        target = "harbor::readiness",
        status = %body.trim(),
        "backend status"
    );

    match classify_status_body(&body) {
        InitialStatus::Ready => return Ok(Progress::Ready),
        InitialStatus::Terminal(label) => return Err(ReadinessError::TerminalState(label)),
        InitialStatus::Pending => {
            let state = if body.contains("Loading") {
                BackendState::Loading
            } else {
                BackendState::Starting
            };
            shared.record_state(state);
        }
    }

    // Dropping the stream on any return cancels the subscription.
    let mut stream = source.open_stream().await?;
    let mut lines = LineBuffer::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in lines.push(&chunk)? {
            if apply_line(shared, &line)? {
                return Ok(Progress::Ready);
            }
        }
    }
    if let Some(line) = lines.finish() {
        if apply_line(shared, &line)? {
            return Ok(Progress::Ready);
        }
    }
    Ok(Progress::StreamClosed)
}

/// Returns `true` once the backend reports ready.
fn apply_line(shared: &Shared, line: &str) -> Result<bool, ReadinessError> {
    match decode_line(line)? {
        None => Ok(false),
        Some(DecodedLine::Malformed(err)) => {
            warn!(
                target = "harbor::readiness",
                error = %err,
                "skipping malformed status event"
            );
            Ok(false)
        }
        Some(DecodedLine::Event(event)) => {
            debug!(
                target = "harbor::readiness",
                state = %event.state,
                time = %event.time,
                "status event"
            );
            let state = event.state.clone();
            shared.record_event(event);
            if state.is_ready() {
                Ok(true)
            } else if state.is_terminal() {
                Err(ReadinessError::TerminalState(state.as_str().to_string()))
            } else {
                Ok(false)
            }
        }
    }
}
