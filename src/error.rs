//! Typed errors for the proxy core.
//!
//! Every per-connection error is confined to that connection: the dispatcher
//! logs it, issues the best protocol-level reply it can, and tears the
//! connection down. None of these ever reach another connection or corrupt
//! the registry beyond the normal `release`.

use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum DuoproxyError {
    #[error("client not in admission list: {0}")]
    AdmissionDenied(IpAddr),

    #[error("protocol framing error: {0}")]
    ProtocolFramingError(String),

    #[error("unsupported protocol feature: {0}")]
    UnsupportedProtocolFeature(String),

    #[error("failed to dial upstream {0}: {1}")]
    UpstreamDialFailure(String, #[source] std::io::Error),

    #[error("peer io error: {0}")]
    PeerIoError(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("reverse dns lookup timed out")]
    ReverseDnsTimeout,
}

pub type Result<T> = std::result::Result<T, DuoproxyError>;
