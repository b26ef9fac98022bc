#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with `success: false` or a non-2xx status.
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// The server rejected the access token and no refresh could recover it.
    #[error("Authentication required")]
    AuthRequired,

    #[error("No refresh token available")]
    NoRefreshToken,

    /// The session was cleared or replaced while a request was in flight.
    #[error("Session changed while the request was in flight")]
    SessionChanged,

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
