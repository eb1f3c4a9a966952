//! Crate-wide error type.
//!
//! Best-effort paths (reactions, dedup persistence, cleanup) catch `GatewayError`
//! at the call site, log it, and continue; critical-path callers (agent dispatch,
//! send-with-no-fallback) propagate it with `?`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("provider: {0}")]
    Provider(String),

    #[error("agent dispatch: {0}")]
    Dispatch(String),

    #[error("permission denied{}", .grant_url.as_deref().map(|u| format!(" (grant: {u})")).unwrap_or_default())]
    PermissionDenied { grant_url: Option<String> },
}

impl GatewayError {
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }
}
