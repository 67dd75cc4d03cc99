//! Authentication error types.

use thiserror::Error;

/// Errors raised while building credentials or authenticating.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// A required option is missing for the chosen variant.
    #[error("the \"{field}\" option is required for \"{auth_type}\" authentication")]
    MissingOption {
        /// Authentication type name.
        auth_type: &'static str,
        /// Missing option.
        field: &'static str,
    },

    /// An option value is malformed.
    #[error("invalid authentication option: {0}")]
    InvalidOption(String),

    /// Unknown authentication type name.
    #[error("unknown authentication type: {0}")]
    UnknownType(String),

    /// NTLM message could not be parsed or built.
    #[error("NTLM error: {0}")]
    Ntlm(String),

    /// Token acquisition failed.
    #[error("failed to acquire token: {0}")]
    TokenAcquisition(String),

    /// No way to obtain a token for this variant.
    #[error("unsupported authentication method: {0}")]
    UnsupportedMethod(String),
}
