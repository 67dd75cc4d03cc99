//! # tds-tls
//!
//! TLS for TDS 7.x connections.
//!
//! After PRELOGIN negotiates encryption, the TLS handshake records travel
//! inside PRELOGIN packets. [`TlsPreloginWrapper`] adds and strips that
//! framing during the handshake and becomes a pass-through afterwards, so
//! the resulting [`TlsStream`] runs directly over the original socket.
//!
//! ```rust,ignore
//! let connector = TlsConnector::new(TlsConfig::new().trust_server_certificate(true))?;
//! let tls = connector.upgrade(tcp_stream, "db.example.com").await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod prelogin_wrapper;

pub use config::TlsConfig;
pub use connector::{TlsConnector, TlsStream};
pub use error::TlsError;
pub use prelogin_wrapper::TlsPreloginWrapper;
