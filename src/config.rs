use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::schedule::{LEAD_TIME, MIN_DELAY};
use crate::store::SessionKeys;

/// Endpoint, storage and timing settings for a [`SessionManager`](crate::SessionManager).
///
/// The only required field is the backend base URL; everything else has a
/// default matching the reservation backend and can be overridden by chaining.
///
/// ```rust,ignore
/// use rr_session::SessionConfig;
///
/// let config = SessionConfig::new("https://reserve.example.com".parse()?)
///     .with_key_namespace("supabase_")
///     .with_login_path("/rr/login/");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    pub(crate) base_url: Url,
    pub(crate) refresh_path: String,
    pub(crate) sign_in_path: String,
    pub(crate) sign_out_path: String,
    pub(crate) validate_path: String,
    pub(crate) current_user_path: String,
    pub(crate) keys: SessionKeys,
    pub(crate) login_path: String,
    pub(crate) refresh_lead: Duration,
    pub(crate) min_refresh_delay: Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            refresh_path: "/rr/api/refresh-token".into(),
            sign_in_path: "/rr/api/sign-in".into(),
            sign_out_path: "/rr/api/sign-out".into(),
            validate_path: "/rr/api/validate-session".into(),
            current_user_path: "/rr/api/user".into(),
            keys: SessionKeys::default(),
            login_path: "/rr/sign-in".into(),
            refresh_lead: LEAD_TIME,
            min_refresh_delay: MIN_DELAY,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `RR_BASE_URL`: backend origin (must be a valid URL)
    ///
    /// # Optional env vars
    /// - `RR_KEY_NAMESPACE`: prefix for the persisted session keys
    /// - `RR_LOGIN_PATH`: where the host should send the user after sign-out
    /// - `RR_REFRESH_LEAD_SECS`: refresh this long before expiry
    /// - `RR_MIN_REFRESH_DELAY_SECS`: never schedule a refresh sooner than this
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required var is missing or a value is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let base_url = std::env::var("RR_BASE_URL")
            .map_err(|_| Error::Config("RR_BASE_URL is required".into()))?;
        let base_url: Url = base_url
            .parse()
            .map_err(|e| Error::Config(format!("RR_BASE_URL: {e}")))?;

        let mut config = Self::new(base_url);

        if let Ok(namespace) = std::env::var("RR_KEY_NAMESPACE") {
            config = config.with_key_namespace(namespace);
        }
        if let Ok(path) = std::env::var("RR_LOGIN_PATH") {
            config = config.with_login_path(path);
        }
        if let Some(lead) = secs_from_env("RR_REFRESH_LEAD_SECS")? {
            config = config.with_refresh_lead(lead);
        }
        if let Some(delay) = secs_from_env("RR_MIN_REFRESH_DELAY_SECS")? {
            config = config.with_min_refresh_delay(delay);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    #[must_use]
    pub fn with_sign_in_path(mut self, path: impl Into<String>) -> Self {
        self.sign_in_path = path.into();
        self
    }

    #[must_use]
    pub fn with_sign_out_path(mut self, path: impl Into<String>) -> Self {
        self.sign_out_path = path.into();
        self
    }

    #[must_use]
    pub fn with_validate_path(mut self, path: impl Into<String>) -> Self {
        self.validate_path = path.into();
        self
    }

    #[must_use]
    pub fn with_current_user_path(mut self, path: impl Into<String>) -> Self {
        self.current_user_path = path.into();
        self
    }

    /// Prefix every persisted key, e.g. `"supabase_"`.
    #[must_use]
    pub fn with_key_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.keys = SessionKeys::new(namespace);
        self
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// How long before expiry the proactive refresh fires (default 5 minutes).
    #[must_use]
    pub fn with_refresh_lead(mut self, lead: Duration) -> Self {
        self.refresh_lead = lead;
        self
    }

    /// Floor on the refresh delay (default 1 minute).
    #[must_use]
    pub fn with_min_refresh_delay(mut self, delay: Duration) -> Self {
        self.min_refresh_delay = delay;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn refresh_lead(&self) -> Duration {
        self.refresh_lead
    }

    #[must_use]
    pub fn min_refresh_delay(&self) -> Duration {
        self.min_refresh_delay
    }

    /// Resolve an endpoint path against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("endpoint '{path}': {e}")))
    }
}

fn secs_from_env(var: &str) -> Result<Option<Duration>, Error> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| Error::Config(format!("{var}: {e}"))),
        Err(_) => Ok(None),
    }
}
