//! Error kinds shared across the miner.
//!
//! The control-flow kinds (`ExitRequest`, `ReloadRequest`, `RequestInvalid`)
//! are plain `Err` values recovered at well-known boundaries: `ExitRequest`
//! and `ReloadRequest` only by the top-level run loop, `RequestInvalid` by
//! the caller that owns the expiring credential.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MinerError>;

#[derive(Debug, Error)]
pub enum MinerError {
    /// The user requested termination. Propagates to the top level; no report.
    #[error("exit requested")]
    ExitRequest,

    /// Internal request to restart the main run loop.
    #[error("reload requested")]
    ReloadRequest,

    /// A credential used by the in-flight request expired mid-flight.
    /// The caller re-fetches the credential and retries.
    #[error("request invalidated by credential expiry")]
    RequestInvalid,

    /// The pub/sub transport closed. `received` is true when the remote
    /// side closed the connection (reconnect), false when we did (exit).
    #[error("websocket closed (received: {received})")]
    WebsocketClosed { received: bool },

    /// Credentials supplied by the user are wrong or unusable.
    #[error("login failed: {0}")]
    Login(String),

    /// The platform demands a captcha the non-interactive flow cannot satisfy.
    #[error("captcha required, cannot continue non-interactively")]
    CaptchaRequired,

    /// Any other fatal inconsistency: GQL error, merge conflict,
    /// unexpected payload.
    #[error("{0}")]
    Miner(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MinerError {
    /// Fatal inconsistency with a formatted message.
    pub fn miner(msg: impl Into<String>) -> Self {
        Self::Miner(msg.into())
    }

    /// Whether this error is one of the control-flow kinds that must not be
    /// swallowed by local recovery.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::ExitRequest | Self::ReloadRequest | Self::RequestInvalid
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
