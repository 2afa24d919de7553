//! Error kinds for the proxy data plane, one `thiserror` enum per module
//! boundary rather than a single crate-wide error type.

use thiserror::Error;

/// Errors raised while parsing or encoding the SOCKS5 wire protocol, or
/// while running a session's state machine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0:#x}")]
    BadVersion(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("unsupported address type {0:#x}")]
    BadAtyp(u8),

    #[error("unsupported SOCKS command {0:#x}")]
    BadCommand(u8),

    #[error("domain name length was zero")]
    EmptyDomain,

    #[error("username length was zero")]
    EmptyUsername,

    #[error("truncated PDU: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("authentication failed for user {0:?}")]
    AuthFailure(String),

    #[error("target denied by policy: {host:?} matched rule {rule_id}")]
    PolicyDenied { host: String, rule_id: String },

    #[error("failed to dial upstream {target}: {source}")]
    DialFailure {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the synchronous store layer. Never fatal to the data
/// plane: every caller treats a `StoreError` as a logged, retried-next-tick
/// outage rather than a hard failure (spec §7, `StoreOutage`).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task panicked: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
