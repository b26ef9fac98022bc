use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::config::SessionConfig;
use crate::error::Error;
use crate::types::{
    AccessToken, Envelope, RefreshRequest, RefreshToken, SignInData, SignInRequest, TokenSet,
    UserRecord,
};

/// Raw status and JSON body of a response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: JsonValue,
}

impl RawResponse {
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }
}

/// Typed calls to the backend auth endpoints.
///
/// Holds no session state; the [`SessionManager`](crate::SessionManager)
/// passes tokens in explicitly.
#[derive(Debug, Clone)]
pub struct AuthApi {
    config: SessionConfig,
    http: reqwest::Client,
}

impl AuthApi {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Exchange a refresh token for a new token set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, [`Error::Api`] if the
    /// server rejects the token, or [`Error::Decode`] on a malformed body.
    pub async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenSet, Error> {
        let url = self.config.endpoint(&self.config.refresh_path)?;
        let response = self
            .http
            .post(url)
            .json(&RefreshRequest {
                token: refresh_token.as_str(),
            })
            .send()
            .await?;

        Self::read_envelope(response, "token refresh").await
    }

    /// Authenticate with email and password.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or [`Error::Api`] carrying
    /// the server's message (e.g. "Incorrect Password").
    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(TokenSet, UserRecord), Error> {
        let url = self.config.endpoint(&self.config.sign_in_path)?;
        let response = self
            .http
            .post(url)
            .json(&SignInRequest { email, password })
            .send()
            .await?;

        let data: SignInData = Self::read_envelope(response, "sign-in").await?;
        Ok((data.session, data.user))
    }

    /// Tell the server the session is over.
    ///
    /// A 401 counts as success: the server already considers the token dead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure or [`Error::Api`] on any
    /// other error status.
    pub async fn sign_out(&self, access_token: Option<&AccessToken>) -> Result<(), Error> {
        let url = self.config.endpoint(&self.config.sign_out_path)?;
        let response = self
            .http
            .get(url)
            .headers(bearer_headers(access_token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Api {
            operation: "sign-out",
            status: Some(status.as_u16()),
            message: body,
        })
    }

    /// Ask the server whether the access token still names an active session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure. Any answer from the server
    /// is `Ok`.
    pub async fn validate(&self, access_token: &AccessToken) -> Result<bool, Error> {
        let url = self.config.endpoint(&self.config.validate_path)?;
        let response = self
            .http
            .get(url)
            .headers(bearer_headers(Some(access_token)))
            .send()
            .await?;

        let status = response.status();
        let body: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
        // The backend omits `success` on this endpoint, so a 2xx alone counts.
        let success = body
            .get("success")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true);
        if !(status.is_success() && success) {
            tracing::debug!(
                status = status.as_u16(),
                message = body.get("message").and_then(JsonValue::as_str),
                "session reported invalid"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Send an arbitrary JSON request. `path` may be absolute or relative to
    /// the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure or [`Error::Config`] if the
    /// URL cannot be resolved. Error statuses are returned as `Ok`.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
        headers: HeaderMap,
    ) -> Result<RawResponse, Error> {
        let url = self.config.endpoint(path)?;
        let mut request = self.http.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            JsonValue::Null
        } else if status.is_success() {
            serde_json::from_str(&text)?
        } else {
            // Error pages are often HTML; the status still has to reach the caller.
            serde_json::from_str(&text).unwrap_or(JsonValue::Null)
        };
        Ok(RawResponse { status, body })
    }

    /// Decodes the `{ success, message, data }` envelope; `success: false`
    /// or an error status becomes [`Error::Api`].
    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<T, Error> {
        let status = response.status();
        let text = response.text().await?;
        let envelope = match serde_json::from_str::<Envelope<T>>(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(Error::Api {
                    operation,
                    status: Some(status.as_u16()),
                    message: format!("HTTP {}", status.as_u16()),
                });
            }
            Err(e) => return Err(Error::Decode(format!("{operation}: {e}"))),
        };

        if !status.is_success() || !envelope.success {
            return Err(Error::Api {
                operation,
                status: Some(status.as_u16()),
                message: envelope
                    .message
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            });
        }

        envelope
            .data
            .ok_or_else(|| Error::Decode(format!("{operation}: missing data")))
    }
}

/// `Authorization: Bearer …` plus a JSON content type, or nothing without a token.
pub(crate) fn bearer_headers(access_token: Option<&AccessToken>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(token) = access_token else {
        return headers;
    };
    match HeaderValue::from_str(&format!("Bearer {}", token.as_str())) {
        Ok(value) => {
            headers.insert(AUTHORIZATION, value);
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Err(_) => tracing::warn!(token = ?token, "access token is not a valid header value"),
    }
    headers
}

pub(crate) fn anonymous_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}
