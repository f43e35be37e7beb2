use std::env;

use url::Url;

use crate::SpawnError;

pub const DEFAULT_API_URL: &str = "https://api.jamsocket.com";

pub const ENV_API_URL: &str = "HARBOR_API_URL";
pub const ENV_ACCOUNT: &str = "HARBOR_ACCOUNT";
pub const ENV_TOKEN: &str = "HARBOR_TOKEN";

/// Control-plane credentials and endpoint used to spawn backends.
#[derive(Clone)]
pub struct SpawnConfig {
    api_url: Url,
    account: String,
    token: String,
}

impl SpawnConfig {
    pub fn new(
        api_url: impl AsRef<str>,
        account: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, SpawnError> {
        let raw = api_url.as_ref().trim();
        if raw.is_empty() {
            return Err(SpawnError::InvalidConfig("api url cannot be empty".into()));
        }
        let api_url = Url::parse(raw)
            .map_err(|err| SpawnError::InvalidConfig(format!("invalid api url '{raw}': {err}")))?;
        if api_url.cannot_be_a_base() {
            return Err(SpawnError::InvalidConfig(format!(
                "api url '{raw}' cannot carry a path"
            )));
        }

        let account = account.into().trim().to_string();
        if account.is_empty() {
            return Err(SpawnError::InvalidConfig("account cannot be empty".into()));
        }
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(SpawnError::InvalidConfig("token cannot be empty".into()));
        }

        Ok(Self {
            api_url,
            account,
            token,
        })
    }

    /// Load configuration from `HARBOR_API_URL`, `HARBOR_ACCOUNT` and `HARBOR_TOKEN`.
    pub fn from_env() -> Result<Self, SpawnError> {
        let api_url = env::var(ENV_API_URL)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let account = env::var(ENV_ACCOUNT).map_err(|_| SpawnError::MissingEnv(ENV_ACCOUNT))?;
        let token = env::var(ENV_TOKEN).map_err(|_| SpawnError::MissingEnv(ENV_TOKEN))?;
        Self::new(api_url, account, token)
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// `{api}/user/{account}/service/{service}/spawn`
    pub fn spawn_url(&self, service: &str) -> Result<Url, SpawnError> {
        let service = service.trim();
        if service.is_empty() {
            return Err(SpawnError::InvalidConfig("service cannot be empty".into()));
        }
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| SpawnError::InvalidConfig("api url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["user", self.account.as_str(), "service", service, "spawn"]);
        Ok(url)
    }
}

impl std::fmt::Debug for SpawnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnConfig")
            .field("api_url", &self.api_url.as_str())
            .field("account", &self.account)
            .field("token", &"<redacted>")
            .finish()
    }
}
