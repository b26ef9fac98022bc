use derive_more::{Display, From, Into};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::error::Error;

/// Bearer credential sent on authenticated requests.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct AccessToken(pub String);

/// Credential used only to mint a new access token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct RefreshToken(pub String);

impl AccessToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RefreshToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens end up in tracing output through `Debug`; only the prefix is shown.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccessToken({})", redact(&self.0))
    }
}

impl std::fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RefreshToken({})", redact(&self.0))
    }
}

pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}…")
}

/// Absolute instant after which the access token is rejected by the server.
///
/// Always stored and serialized as RFC 3339. Deserialization also accepts
/// Unix seconds (integer, float, or a numeric string) so that values written
/// by older clients still restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Expiry(OffsetDateTime);

impl Expiry {
    #[must_use]
    pub fn at(instant: OffsetDateTime) -> Self {
        Self(instant)
    }

    /// Expiry `ttl` from now.
    #[must_use]
    pub fn in_duration(ttl: Duration) -> Self {
        Self(OffsetDateTime::now_utc() + ttl)
    }

    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the timestamp is out of range.
    pub fn from_unix_seconds(secs: i64) -> Result<Self, Error> {
        OffsetDateTime::from_unix_timestamp(secs)
            .map(Self)
            .map_err(|e| Error::Decode(format!("expiry: {e}")))
    }

    /// Parse either RFC 3339 or numeric Unix seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the text is neither.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let text = text.trim();
        if let Ok(dt) = OffsetDateTime::parse(text, &Rfc3339) {
            return Ok(Self(dt));
        }
        match text.parse::<f64>() {
            Ok(secs) => Self::from_fractional_seconds(secs),
            Err(_) => Err(Error::Decode(format!("expiry: unrecognized timestamp '{text}'"))),
        }
    }

    fn from_fractional_seconds(secs: f64) -> Result<Self, Error> {
        if !secs.is_finite() {
            return Err(Error::Decode("expiry: non-finite timestamp".into()));
        }
        let nanos = (secs * 1_000_000_000.0) as i128;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map(Self)
            .map_err(|e| Error::Decode(format!("expiry: {e}")))
    }

    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the instant cannot be formatted.
    pub fn to_rfc3339(&self) -> Result<String, Error> {
        self.0
            .format(&Rfc3339)
            .map_err(|e| Error::Decode(format!("expiry: {e}")))
    }

    #[must_use]
    pub fn as_datetime(&self) -> OffsetDateTime {
        self.0
    }

    /// Time left until expiry; negative once expired.
    #[must_use]
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        self.0 - now
    }

    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.0 <= now
    }
}

impl Serialize for Expiry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = self.to_rfc3339().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for Expiry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Float(f64),
            Text(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Int(secs) => Self::from_unix_seconds(secs),
            Raw::Float(secs) => Self::from_fractional_seconds(secs),
            Raw::Text(text) => Self::parse(&text),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

/// Token pair plus absolute expiry, as issued by `sign-in` and `refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    #[serde(alias = "access_token")]
    pub access_token: AccessToken,
    #[serde(alias = "refresh_token")]
    pub refresh_token: RefreshToken,
    #[serde(alias = "expires_at")]
    pub expires_at: Expiry,
}

impl TokenSet {
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: Expiry,
    ) -> Self {
        Self {
            access_token: AccessToken(access_token.into()),
            refresh_token: RefreshToken(refresh_token.into()),
            expires_at,
        }
    }
}

/// User profile returned at sign-in. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct UserRecord(pub JsonValue);

impl UserRecord {
    /// Gets a profile field by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }
}

/// Coarse session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    Refreshing,
}

/// Why a failed [`ApiReply`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The request never produced a response.
    Network,
    /// The server rejected the credentials and the session was ended.
    AuthRequired,
    /// The server answered with an error status or `success: false`.
    Server,
    /// The response body was not the expected JSON.
    Decode,
}

/// Outcome of [`SessionManager::perform_request`](crate::SessionManager::perform_request).
///
/// Failures are values: `success` is `false` and `message` carries text fit
/// for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(skip)]
    pub status: Option<u16>,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

impl ApiReply {
    pub(crate) const AUTH_REQUIRED: &'static str = "Authentication required";
    pub(crate) const GENERIC_ERROR: &'static str = "An error occurred";

    /// Build a reply from a response status and its JSON body.
    ///
    /// A body without `success` takes it from the status code.
    #[must_use]
    pub fn from_body(status: u16, body: JsonValue) -> Self {
        let ok_status = (200..300).contains(&status);
        let success = body
            .get("success")
            .and_then(JsonValue::as_bool)
            .unwrap_or(ok_status)
            && ok_status;
        let mut message = body
            .get("message")
            .and_then(JsonValue::as_str)
            .map(ToOwned::to_owned);
        if !success && message.is_none() {
            message = Some(Self::GENERIC_ERROR.to_owned());
        }
        let data = body.get("data").cloned().unwrap_or(JsonValue::Null);
        Self {
            success,
            message,
            data,
            status: Some(status),
            failure: (!success).then_some(FailureKind::Server),
        }
    }

    #[must_use]
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: JsonValue::Null,
            status: None,
            failure: Some(kind),
        }
    }

    #[must_use]
    pub fn auth_required() -> Self {
        Self::failure(FailureKind::AuthRequired, Self::AUTH_REQUIRED)
    }

    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::Http(_) => FailureKind::Network,
            Error::AuthRequired | Error::NoRefreshToken | Error::SessionChanged => {
                FailureKind::AuthRequired
            }
            Error::Decode(_) => FailureKind::Decode,
            _ => FailureKind::Server,
        };
        let mut reply = Self::failure(kind, err.to_string());
        if let Error::Api {
            status, message, ..
        } = err
        {
            reply.status = *status;
            reply.message = Some(message.clone());
        }
        reply
    }

    #[must_use]
    pub fn is_auth_required(&self) -> bool {
        self.failure == Some(FailureKind::AuthRequired)
    }
}

/// `{ success, message, data }` envelope used by every auth endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub(crate) success: bool,
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default = "Option::default")]
    pub(crate) data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SignInData {
    pub(crate) session: TokenSet,
    pub(crate) user: UserRecord,
}

#[derive(Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub(crate) token: &'a str,
}

#[derive(Serialize)]
pub(crate) struct SignInRequest<'a> {
    pub(crate) email: &'a str,
    pub(crate) password: &'a str,
}
