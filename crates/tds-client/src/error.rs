//! Client error types.

use std::fmt;

use tds_protocol::ServerMessage;
use thiserror::Error;

/// Server error numbers that mark a failed login as worth retrying.
///
/// These cover databases that are starting up, failing over or throttling
/// connections.
pub const TRANSIENT_ERROR_NUMBERS: [i32; 13] = [
    4060, 4221, 10928, 10929, 40197, 40501, 40540, 40613, 42108, 42109, 49918, 49919, 49920,
];

/// An ERROR token raised by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class (0-25).
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: Option<String>,
    /// Procedure name.
    pub procedure: Option<String>,
    /// Line number in the batch or procedure.
    pub line: i32,
}

impl ServerError {
    /// Whether the server flags this error as transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        TRANSIENT_ERROR_NUMBERS.contains(&self.number)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (error {}, class {})", self.message, self.number, self.class)
    }
}

impl From<ServerMessage> for ServerError {
    fn from(msg: ServerMessage) -> Self {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Self {
            number: msg.number,
            state: msg.state,
            class: msg.class,
            message: msg.message,
            server: non_empty(msg.server),
            procedure: non_empty(msg.procedure),
            line: msg.line,
        }
    }
}

/// Errors produced by a [`Connection`](crate::Connection).
///
/// The variants follow the lifetime of the failure: configuration errors are
/// raised before any I/O, connect and login errors end a connection attempt,
/// server errors fail a single request, and fatal errors end a running
/// connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The server rejected the login.
    #[error("login failed: {0}")]
    Login(ServerError),

    /// A request failed on the server. The connection stays usable.
    #[error("request failed: {0}")]
    Server(ServerError),

    /// The running connection failed and was closed.
    #[error("connection lost: {0}")]
    Fatal(String),

    /// The connection was closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request was canceled.
    #[error("Canceled.")]
    Canceled,

    /// A connect, request or cancel timer expired.
    #[error("{0}")]
    Timeout(String),

    /// The operation is not allowed in the connection's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Authentication failed before reaching the server.
    #[error("authentication error: {0}")]
    Auth(#[from] tds_auth::AuthError),

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(#[from] tds_tls::TlsError),

    /// Malformed data on the wire.
    #[error("protocol error: {0}")]
    Protocol(#[from] tds_protocol::ProtocolError),

    /// Framing error.
    #[error("codec error: {0}")]
    Codec(#[from] tds_codec::CodecError),

    /// Socket error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Login(e) | Self::Server(e) => e.is_transient(),
            Self::Timeout(_) | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether the connection is unusable after this error.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Login(_)
                | Self::Fatal(_)
                | Self::ConnectionClosed
                | Self::Tls(_)
                | Self::Auth(_)
                | Self::Codec(_)
                | Self::Io(_)
        )
    }

    /// The server error, if this error carries one.
    #[must_use]
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Login(e) | Self::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Severity class of a server error.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        self.server_error().map(|e| e.class)
    }

    /// A copy for a second recipient; errors wrapping a source keep only
    /// its message.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::Config(s) => Self::Config(s.clone()),
            Self::Connect(s) => Self::Connect(s.clone()),
            Self::Login(e) => Self::Login(e.clone()),
            Self::Server(e) => Self::Server(e.clone()),
            Self::Fatal(s) => Self::Fatal(s.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Canceled => Self::Canceled,
            Self::Timeout(s) => Self::Timeout(s.clone()),
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            other => Self::Fatal(other.to_string()),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
