use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use harbor_spawn::SpawnResult;
use serde::Serialize;
use tracing::info;
use url::Url;

use crate::channel::BufferedChannel;
use crate::error::{ReadinessError, SessionError};
use crate::readiness::{ReadinessOptions, ReadinessTracker, ReadySubscription};
use crate::socketio::SocketIoTransport;
use crate::status::StatusEvent;
use crate::transport::{Listener, RealtimeTransport};

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub readiness: ReadinessOptions,
    /// Overrides the bearer token carried by the spawn result.
    pub bearer_token: Option<String>,
}

impl SessionOptions {
    pub fn with_readiness(mut self, readiness: ReadinessOptions) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Where a session's backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoints {
    pub url: Url,
    pub status_url: String,
    pub name: Option<String>,
}

impl SessionEndpoints {
    pub fn parse(url: &str, status_url: &str) -> Result<Self, SessionError> {
        let url = Url::parse(url.trim())
            .map_err(|err| SessionError::InvalidUrl(format!("'{url}': {err}")))?;
        Ok(Self {
            url,
            status_url: status_url.trim().to_string(),
            name: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One connection to one spawned backend: readiness plus a buffered channel.
///
/// Not reusable once destroyed; open a new session instead.
pub struct Session {
    endpoints: SessionEndpoints,
    tracker: ReadinessTracker,
    channel: BufferedChannel,
    destroyed: AtomicBool,
}

impl Session {
    /// Start tracking and (once ready) connecting to the backend described by
    /// a spawn result. Must be called from within a tokio runtime.
    pub fn open(result: &SpawnResult, options: SessionOptions) -> Result<Self, SessionError> {
        let endpoints = SessionEndpoints::parse(&result.url, &result.status_url)?
            .with_name(result.name.clone());
        let tracker = ReadinessTracker::from_status_url(&endpoints.status_url, options.readiness)?;
        let token = options.bearer_token.or_else(|| result.bearer_token.clone());
        let transport = SocketIoTransport::new(&endpoints.url).with_bearer_token(token);
        info!(
            target = "harbor::session",
            name = %result.name,
            socket = %transport.endpoint(),
            "session opened"
        );
        Ok(Self::from_parts(tracker, Arc::new(transport), endpoints))
    }

    /// Assemble a session over any transport.
    pub fn from_parts(
        tracker: ReadinessTracker,
        transport: Arc<dyn RealtimeTransport>,
        endpoints: SessionEndpoints,
    ) -> Self {
        let channel = BufferedChannel::new(transport, &tracker);
        Self {
            endpoints,
            tracker,
            channel,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &Url {
        &self.endpoints.url
    }

    pub fn status_url(&self) -> &str {
        &self.endpoints.status_url
    }

    pub fn name(&self) -> Option<&str> {
        self.endpoints.name.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.tracker.is_ready()
    }

    pub fn on_ready<F>(&self, callback: F) -> ReadySubscription
    where
        F: FnOnce() + Send + 'static,
    {
        self.tracker.on_ready(callback)
    }

    pub async fn wait_ready(&self) -> Result<(), ReadinessError> {
        self.tracker.wait().await
    }

    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.tracker.statuses()
    }

    pub fn tracker(&self) -> &ReadinessTracker {
        &self.tracker
    }

    pub fn channel(&self) -> &BufferedChannel {
        &self.channel
    }

    pub fn send<T>(&self, channel: &str, payload: &T)
    where
        T: Serialize + ?Sized,
    {
        self.channel.send(channel, payload);
    }

    pub fn add_listener(&self, channel: &str, listener: Listener) {
        self.channel.add_listener(channel, listener);
    }

    pub fn remove_listener(&self, channel: &str, listener: &Listener) {
        self.channel.remove_listener(channel, listener);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Close the channel, then stop readiness tracking. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channel.destroy();
        self.tracker.destroy();
        info!(
            target = "harbor::session",
            url = %self.endpoints.url,
            "session destroyed"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.endpoints.url.as_str())
            .field("status_url", &self.endpoints.status_url)
            .field("ready", &self.is_ready())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_reject_unparseable_url() {
        assert!(matches!(
            SessionEndpoints::parse("::nope", "https://api.test/status"),
            Err(SessionError::InvalidUrl(_))
        ));
        let endpoints = SessionEndpoints::parse(" https://b.test/abc/ ", "https://api.test/s ")
            .unwrap()
            .with_name("abc");
        assert_eq!(endpoints.url.as_str(), "https://b.test/abc/");
        assert_eq!(endpoints.status_url, "https://api.test/s");
        assert_eq!(endpoints.name.as_deref(), Some("abc"));
    }

    #[test]
    fn open_outside_runtime_reports_readiness_error() {
        let result = SpawnResult {
            url: "https://b.test/abc".into(),
            name: "abc".into(),
            ready_url: None,
            status_url: "https://api.test/backend/abc/status".into(),
            spawned: true,
            bearer_token: None,
        };
        assert!(matches!(
            Session::open(&result, SessionOptions::default()),
            Err(SessionError::Readiness(ReadinessError::NoRuntime))
        ));
    }
}
