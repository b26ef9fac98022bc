use tokio::sync::mpsc;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Explicit sign-out.
    SignedOut,
    /// A request was rejected with 401 and no refresh could recover it.
    Unauthorized,
    /// The scheduled refresh failed.
    RefreshFailed,
    /// The restored session had already expired.
    Expired,
    /// The server reported the session invalid.
    Invalidated,
}

/// Host-provided hook invoked when the session is torn down.
///
/// The host typically navigates to `login_path`. Called after the session has
/// been cleared, from whichever task ended it.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionNotifier for AppShell {
///     fn session_ended(&self, reason: SessionEnd, login_path: &str) {
///         self.router.navigate(login_path);
///         if reason != SessionEnd::SignedOut {
///             self.toasts.error("Your session has expired. Please sign in again.");
///         }
///     }
/// }
/// ```
pub trait SessionNotifier: Send + Sync + 'static {
    fn session_ended(&self, reason: SessionEnd, login_path: &str);
}

/// Ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl SessionNotifier for NoopNotifier {
    fn session_ended(&self, _reason: SessionEnd, _login_path: &str) {}
}

/// Forwards notifications into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<(SessionEnd, String)>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SessionEnd, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionNotifier for ChannelNotifier {
    fn session_ended(&self, reason: SessionEnd, login_path: &str) {
        if self.tx.send((reason, login_path.to_owned())).is_err() {
            tracing::debug!(?reason, "session notifier receiver dropped");
        }
    }
}
