use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio::task::AbortHandle;

use crate::client::{AuthApi, RawResponse, anonymous_headers, bearer_headers};
use crate::config::SessionConfig;
use crate::error::Error;
use crate::notifier::{SessionEnd, SessionNotifier};
use crate::schedule::{RefreshPlan, refresh_delay};
use crate::store::KeyValueStore;
use crate::types::{
    AccessToken, ApiReply, Expiry, RefreshToken, SessionState, TokenSet, UserRecord, redact,
};

/// Single authority for the authenticated session.
///
/// Owns the tokens, the user record and the expiry; persists them through a
/// [`KeyValueStore`]; refreshes the access token before it expires and when
/// the server answers 401; and tells the host through a [`SessionNotifier`]
/// when the session is gone for good.
///
/// Cloning is cheap and every clone manages the same session. Construct one
/// per store namespace and hand clones to whatever needs to make requests.
///
/// ```rust,ignore
/// let manager = SessionManager::new(config, Arc::new(store), Arc::new(notifier));
/// manager.restore();
///
/// let reply = manager
///     .perform_request(Method::GET, "/rr/api/reservations", None, true)
///     .await;
/// ```
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    api: AuthApi,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn SessionNotifier>,
    state: Mutex<State>,
    // Serializes refreshes so the timer and a 401 never both spend the refresh token.
    refresh_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct State {
    access_token: Option<AccessToken>,
    refresh_token: Option<RefreshToken>,
    user: Option<UserRecord>,
    expiry: Option<Expiry>,
    refreshing: bool,
    /// Epoch whose refresh was rejected; later callers fail fast instead of retrying.
    failed_refresh_epoch: Option<u64>,
    /// Bumped whenever the session is replaced, refreshed or cleared.
    epoch: u64,
    timer: Option<RefreshTimer>,
    next_timer_id: u64,
}

impl State {
    fn is_present(&self) -> bool {
        self.access_token.is_some() && self.user.is_some()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            tracing::debug!(timer_id = timer.id, "refresh timer cancelled");
        }
    }
}

struct RefreshTimer {
    id: u64,
    handle: AbortHandle,
}

/// Clears `refreshing` when a refresh ends, including when its future is
/// dropped mid-request. A newer epoch owns the flag and is left alone.
struct RefreshingFlag<'a> {
    manager: &'a SessionManager,
    epoch: u64,
}

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.lock();
        if state.epoch == self.epoch {
            state.refreshing = false;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_timer();
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        Self::from_api(AuthApi::new(config), store, notifier)
    }

    /// Build on a preconfigured [`AuthApi`] (custom HTTP client, etc.).
    #[must_use]
    pub fn from_api(
        api: AuthApi,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                notifier,
                state: Mutex::new(State::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        self.inner.api.config()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the session persisted by a previous run. No network call.
    ///
    /// Partial or unreadable state counts as no session and is wiped. An
    /// already-expired session is cleared and reported as
    /// [`SessionEnd::Expired`] instead of being scheduled for refresh.
    pub fn restore(&self) -> SessionState {
        let Some(loaded) = self.load_persisted() else {
            tracing::debug!("no usable persisted session");
            self.clear_session();
            return SessionState::Anonymous;
        };

        if let Some(expiry) = loaded.expiry {
            if expiry.is_expired(OffsetDateTime::now_utc()) {
                tracing::info!(expires_at = ?expiry, "persisted session already expired");
                self.expire();
                return SessionState::Anonymous;
            }
        }

        {
            let mut state = self.lock();
            state.access_token = Some(loaded.access_token);
            state.refresh_token = loaded.refresh_token;
            state.user = Some(loaded.user);
            state.expiry = loaded.expiry;
            state.refreshing = false;
            state.epoch += 1;
        }
        tracing::info!("session restored");
        self.schedule_refresh();
        SessionState::Authenticated
    }

    fn load_persisted(&self) -> Option<PersistedSession> {
        let keys = self.config().keys();
        let read = |key: &str| match self.inner.store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty() && v.as_str() != "null"),
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read session key");
                None
            }
        };

        let access_token = read(keys.access_token()).map(AccessToken::from);
        let refresh_token = read(keys.refresh_token()).map(RefreshToken::from);
        let user = read(keys.user());
        let expiry = read(keys.token_expiry());

        let (Some(access_token), Some(user)) = (access_token, user) else {
            return None;
        };
        let user = match serde_json::from_str::<JsonValue>(&user) {
            Ok(JsonValue::Null) => return None,
            Ok(json) => UserRecord(json),
            Err(e) => {
                tracing::warn!(error = %e, "persisted user record is not JSON");
                return None;
            }
        };
        let expiry = match expiry.map(|text| Expiry::parse(&text)).transpose() {
            Ok(expiry) => expiry,
            Err(e) => {
                tracing::warn!(error = %e, "persisted expiry is unreadable");
                return None;
            }
        };

        Some(PersistedSession {
            access_token,
            refresh_token,
            user,
            expiry,
        })
    }

    /// Replace the session with a fresh token set and user, persist it, and
    /// reschedule the refresh.
    pub fn set_session(&self, tokens: TokenSet, user: UserRecord) {
        {
            let mut state = self.lock();
            state.access_token = Some(tokens.access_token);
            state.refresh_token = Some(tokens.refresh_token);
            state.user = Some(user);
            state.expiry = Some(tokens.expires_at);
            state.refreshing = false;
            state.epoch += 1;
            self.persist(&state);
        }
        tracing::info!(expires_at = ?tokens.expires_at, "session set");
        self.schedule_refresh();
    }

    /// Drop the session from memory and the store and cancel the refresh
    /// timer. Safe to call without a session.
    pub fn clear_session(&self) {
        let mut state = self.lock();
        state.cancel_timer();
        state.access_token = None;
        state.refresh_token = None;
        state.user = None;
        state.expiry = None;
        state.refreshing = false;
        state.epoch += 1;

        for key in self.config().keys().all() {
            if let Err(e) = self.inner.store.remove(key) {
                tracing::warn!(key, error = %e, "failed to remove session key");
            }
        }
    }

    /// Headers for an authenticated request; empty without an access token.
    #[must_use]
    pub fn auth_headers(&self) -> HeaderMap {
        bearer_headers(self.lock().access_token.as_ref())
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock().is_present()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        let state = self.lock();
        if !state.is_present() {
            SessionState::Anonymous
        } else if state.refreshing {
            SessionState::Refreshing
        } else {
            SessionState::Authenticated
        }
    }

    #[must_use]
    pub fn user(&self) -> Option<UserRecord> {
        self.lock().user.clone()
    }

    #[must_use]
    pub fn expiry(&self) -> Option<Expiry> {
        self.lock().expiry
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// The user record is left untouched. On failure nothing changes; the
    /// caller decides whether to sign out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRefreshToken`] without any network call when there is
    /// no refresh token, [`Error::SessionChanged`] if the session was cleared
    /// or replaced before the response arrived, and otherwise the error from
    /// the refresh endpoint.
    pub async fn refresh_access_token(&self) -> Result<TokenSet, Error> {
        let _guard = self.inner.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Make sure the access token is usable, refreshing unless another task
    /// already replaced `rejected` while this one waited.
    ///
    /// Both the timer and the 401 path go through here.
    ///
    /// # Errors
    ///
    /// Same as [`refresh_access_token`](Self::refresh_access_token).
    pub async fn ensure_valid_token(&self, rejected: Option<&AccessToken>) -> Result<(), Error> {
        let _guard = self.inner.refresh_lock.lock().await;
        let epoch = {
            let state = self.lock();
            if state.failed_refresh_epoch == Some(state.epoch) {
                tracing::debug!("refresh already rejected for this session");
                return Err(Error::AuthRequired);
            }
            if let Some(current) = state.access_token.as_ref() {
                if Some(current) != rejected {
                    tracing::debug!("access token already replaced; skipping refresh");
                    return Ok(());
                }
            }
            state.epoch
        };
        match self.refresh_locked().await {
            Ok(_) => Ok(()),
            Err(Error::SessionChanged) => Err(Error::SessionChanged),
            Err(e) => {
                // The caller ends this session; later waiters must not retry.
                let mut state = self.lock();
                if state.epoch == epoch {
                    state.failed_refresh_epoch = Some(epoch);
                }
                Err(e)
            }
        }
    }

    async fn refresh_locked(&self) -> Result<TokenSet, Error> {
        let (refresh_token, epoch) = {
            let mut state = self.lock();
            let Some(refresh_token) = state.refresh_token.clone() else {
                tracing::debug!("no refresh token available");
                return Err(Error::NoRefreshToken);
            };
            state.refreshing = true;
            (refresh_token, state.epoch)
        };
        let _flag = RefreshingFlag {
            manager: self,
            epoch,
        };

        tracing::debug!(refresh_token = %redact(refresh_token.as_str()), "refreshing access token");
        let result = self.inner.api.refresh(&refresh_token).await;

        let mut state = self.lock();
        if state.epoch != epoch || !state.is_present() {
            tracing::info!("session changed during refresh; discarding response");
            return Err(Error::SessionChanged);
        }
        state.refreshing = false;

        let tokens = match result {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed");
                return Err(e);
            }
        };

        state.access_token = Some(tokens.access_token.clone());
        state.refresh_token = Some(tokens.refresh_token.clone());
        state.expiry = Some(tokens.expires_at);
        state.epoch += 1;
        self.persist(&state);
        drop(state);

        tracing::info!(expires_at = ?tokens.expires_at, "access token refreshed");
        self.schedule_refresh();
        Ok(tokens)
    }

    /// Best-effort server sign-out, then clear the session and notify the host.
    pub async fn sign_out(&self) {
        self.end_session(SessionEnd::SignedOut).await;
    }

    async fn end_session(&self, reason: SessionEnd) {
        let access_token = self.lock().access_token.clone();
        if let Some(token) = access_token.as_ref() {
            if let Err(e) = self.inner.api.sign_out(Some(token)).await {
                tracing::warn!(error = %e, "sign-out request failed; clearing session anyway");
            }
        }
        self.clear_session();
        tracing::info!(?reason, "session ended");
        self.inner
            .notifier
            .session_ended(reason, self.config().login_path());
    }

    /// Local-only teardown for a token that is already dead.
    fn expire(&self) {
        self.clear_session();
        tracing::info!(reason = ?SessionEnd::Expired, "session ended");
        self.inner
            .notifier
            .session_ended(SessionEnd::Expired, self.config().login_path());
    }

    /// Arm the one-shot refresh timer for the current expiry, replacing any
    /// pending one.
    fn schedule_refresh(&self) {
        let config = self.config();
        let mut state = self.lock();
        state.cancel_timer();

        let (Some(expiry), Some(token)) = (state.expiry, state.access_token.clone()) else {
            tracing::debug!("no expiry set; refresh timer not started");
            return;
        };

        let delay = match refresh_delay(
            expiry,
            OffsetDateTime::now_utc(),
            config.refresh_lead(),
            config.min_refresh_delay(),
        ) {
            RefreshPlan::After(delay) => delay,
            RefreshPlan::Expired => {
                drop(state);
                tracing::info!(expires_at = ?expiry, "access token already expired");
                self.expire();
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime; proactive refresh disabled");
            return;
        };

        let id = state.next_timer_id;
        state.next_timer_id += 1;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        // Spawned while holding the lock so the task cannot fire before it is registered.
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.on_refresh_timer(id, token).await;
            }
        });
        state.timer = Some(RefreshTimer {
            id,
            handle: handle.abort_handle(),
        });
        tracing::debug!(timer_id = id, delay_secs = delay.as_secs(), "refresh scheduled");
    }

    async fn on_refresh_timer(&self, id: u64, token: AccessToken) {
        {
            let mut state = self.lock();
            if state.timer.as_ref().map(|timer| timer.id) != Some(id) {
                return;
            }
            state.timer = None;
        }

        tracing::info!(timer_id = id, "refresh timer fired");
        match self.ensure_valid_token(Some(&token)).await {
            Ok(()) => {}
            Err(Error::SessionChanged | Error::AuthRequired) => {
                tracing::debug!("session changed or already ending; scheduled refresh skipped");
            }
            Err(e) => {
                tracing::warn!(error = %e, "scheduled refresh failed; signing out");
                self.end_session(SessionEnd::RefreshFailed).await;
            }
        }
    }

    /// Sign in with email and password and install the returned session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] with the server's message on rejected
    /// credentials, or [`Error::Http`] on network failure.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserRecord, Error> {
        let (tokens, user) = self.inner.api.sign_in(email, password).await?;
        self.set_session(tokens, user.clone());
        Ok(user)
    }

    /// Ask the server whether the session is still active. An inactive
    /// session is cleared and reported as [`SessionEnd::Invalidated`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure; the session is kept.
    pub async fn validate_session(&self) -> Result<bool, Error> {
        let (token, epoch) = {
            let state = self.lock();
            match state.access_token.clone() {
                Some(token) => (token, state.epoch),
                None => return Ok(false),
            }
        };

        if self.inner.api.validate(&token).await? {
            return Ok(true);
        }

        let unchanged = self.lock().epoch == epoch;
        if unchanged {
            self.clear_session();
            tracing::info!(reason = ?SessionEnd::Invalidated, "session ended");
            self.inner
                .notifier
                .session_ended(SessionEnd::Invalidated, self.config().login_path());
        }
        Ok(false)
    }

    /// Fetch the signed-in user's profile and store it as the session user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthRequired`] if the session could not be recovered,
    /// or [`Error::Api`] with the server's message.
    pub async fn current_user(&self) -> Result<UserRecord, Error> {
        let path = self.config().current_user_path.clone();
        let reply = self.perform_request(Method::GET, &path, None, true).await;
        if reply.is_auth_required() {
            return Err(Error::AuthRequired);
        }
        if !reply.success {
            return Err(Error::Api {
                operation: "current user",
                status: reply.status,
                message: reply.message.unwrap_or_default(),
            });
        }

        let user = UserRecord(reply.data);
        let mut state = self.lock();
        if state.is_present() {
            state.user = Some(user.clone());
            self.persist_user(&user);
        }
        Ok(user)
    }

    /// Send a JSON request, authenticated or not.
    ///
    /// With `require_auth`, a 401 triggers exactly one refresh and one retry.
    /// If the refresh fails or the retry is rejected again, the session is
    /// ended with [`SessionEnd::Unauthorized`] and an auth-required reply is
    /// returned. Failures never escape as errors.
    pub async fn perform_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
        require_auth: bool,
    ) -> ApiReply {
        match self.try_perform_request(method, path, body, require_auth).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(path, error = %e, "request failed");
                ApiReply::from_error(&e)
            }
        }
    }

    async fn try_perform_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
        require_auth: bool,
    ) -> Result<ApiReply, Error> {
        if !require_auth {
            let raw = self
                .inner
                .api
                .send(method, path, body, anonymous_headers())
                .await?;
            return Ok(into_reply(raw));
        }

        let token = self.lock().access_token.clone();
        let raw = self
            .inner
            .api
            .send(method.clone(), path, body, bearer_headers(token.as_ref()))
            .await?;
        if !raw.is_unauthorized() {
            return Ok(into_reply(raw));
        }

        tracing::info!(path, "request unauthorized; refreshing access token");
        match self.ensure_valid_token(token.as_ref()).await {
            Ok(()) => {}
            // Another caller already rejected or replaced this session and ends it.
            Err(Error::SessionChanged | Error::AuthRequired) => {
                return Ok(ApiReply::auth_required());
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "could not recover from 401");
                self.end_session(SessionEnd::Unauthorized).await;
                return Ok(ApiReply::auth_required());
            }
        }

        let retry = self
            .inner
            .api
            .send(method, path, body, self.auth_headers())
            .await?;
        if retry.is_unauthorized() {
            tracing::warn!(path, "request still unauthorized after refresh");
            self.end_session(SessionEnd::Unauthorized).await;
            return Ok(ApiReply::auth_required());
        }
        Ok(into_reply(retry))
    }

    fn persist(&self, state: &State) {
        let keys = self.config().keys();
        if let Some(token) = &state.access_token {
            self.write(keys.access_token(), token.as_str());
        }
        if let Some(token) = &state.refresh_token {
            self.write(keys.refresh_token(), token.as_str());
        }
        if let Some(user) = &state.user {
            self.persist_user(user);
        }
        if let Some(expiry) = &state.expiry {
            match expiry.to_rfc3339() {
                Ok(text) => self.write(keys.token_expiry(), &text),
                Err(e) => tracing::warn!(error = %e, "failed to format expiry"),
            }
        }
    }

    fn persist_user(&self, user: &UserRecord) {
        match serde_json::to_string(user) {
            Ok(json) => self.write(self.config().keys().user(), &json),
            Err(e) => tracing::warn!(error = %e, "failed to serialize user record"),
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.inner.store.set(key, value) {
            tracing::warn!(key, error = %e, "failed to persist session key");
        }
    }

    #[cfg(test)]
    fn pending_timer(&self) -> Option<u64> {
        self.lock().timer.as_ref().map(|timer| timer.id)
    }
}

struct PersistedSession {
    access_token: AccessToken,
    refresh_token: Option<RefreshToken>,
    user: UserRecord,
    expiry: Option<Expiry>,
}

fn into_reply(raw: RawResponse) -> ApiReply {
    ApiReply::from_body(raw.status.as_u16(), raw.body)
}
