#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
pub mod notifier;
pub mod schedule;
pub mod session;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use client::{AuthApi, RawResponse};
pub use config::SessionConfig;
pub use error::Error;
pub use notifier::{ChannelNotifier, NoopNotifier, SessionEnd, SessionNotifier};
pub use reqwest::Method;
pub use schedule::{LEAD_TIME, MIN_DELAY, RefreshPlan, refresh_delay};
pub use session::SessionManager;
pub use store::{FileStore, KeyValueStore, MemoryStore, SessionKeys, StoreError};
pub use types::{
    AccessToken, ApiReply, Expiry, FailureKind, RefreshToken, SessionState, TokenSet, UserRecord,
};
