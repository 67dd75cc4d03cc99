//! TLS error types.

use thiserror::Error;

/// Errors raised while setting up TLS.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// The handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server name is not a valid DNS name or IP address.
    #[error("invalid server name for TLS: {0}")]
    InvalidServerName(String),

    /// A configured root certificate was rejected.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The rustls configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// Transport I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
