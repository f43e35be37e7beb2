//! Asynchronous client for the backend control plane.
//!
//! A spawn call asks the control plane for a fresh backend instance of a
//! service and returns where to reach it: the realtime `url` the browser or
//! agent connects to, and the `status_url` that reports startup progress.
//! Readiness tracking and messaging live in `harbor-session`.

mod config;

pub use config::{DEFAULT_API_URL, ENV_ACCOUNT, ENV_API_URL, ENV_TOKEN, SpawnConfig};

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{CACHE_CONTROL, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("invalid spawn configuration: {0}")]
    InvalidConfig(String),
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}

/// Optional spawn parameters; unset fields are left out of the request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpawnRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_bearer_token: Option<bool>,
}

impl SpawnRequest {
    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_grace_period(mut self, seconds: u32) -> Self {
        self.grace_period_seconds = Some(seconds);
        self
    }

    pub fn require_bearer_token(mut self, required: bool) -> Self {
        self.require_bearer_token = Some(required);
        self
    }
}

/// Connection details of a spawned (or, with a lock, already running) backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResult {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub ready_url: Option<String>,
    pub status_url: String,
    #[serde(default)]
    pub spawned: bool,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SpawnClient {
    http: Client,
    config: SpawnConfig,
}

impl SpawnClient {
    pub fn new(config: SpawnConfig) -> Result<Self, SpawnError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self, SpawnError> {
        Self::new(SpawnConfig::from_env()?)
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Spawn a backend for `service`.
    pub async fn spawn(
        &self,
        service: &str,
        request: &SpawnRequest,
    ) -> Result<SpawnResult, SpawnError> {
        let url = self.config.spawn_url(service)?;
        debug!(
            target = "harbor::spawn",
            account = %self.config.account(),
            service = %service,
            lock = ?request.lock,
            "requesting backend"
        );

        let res = self
            .http
            .post(url)
            .bearer_auth(self.config.token())
            .header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
            .json(request)
            .send()
            .await?;

        if res.status().is_success() {
            let result = res.json::<SpawnResult>().await?;
            debug!(
                target = "harbor::spawn",
                name = %result.name,
                spawned = result.spawned,
                status_url = %result.status_url,
                "backend assigned"
            );
            Ok(result)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(
                target = "harbor::spawn",
                service = %service,
                status = %status,
                "control plane rejected spawn"
            );
            Err(SpawnError::UnexpectedStatus { status, body })
        }
    }
}
