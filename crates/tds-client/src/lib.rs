//! # tds-client
//!
//! Async SQL Server client driven by an explicit connection state machine.
//!
//! Each [`Connection`] owns one physical connection and runs it from a
//! dedicated task:
//!
//! ```text
//! Initialized -> Connecting -> SentPrelogin -> [SentTLSSSLNegotiation]
//!     -> SentLogin7{WithStandardLogin,WithNTLMLogin,WithFedauth}
//!     -> LoggedInSendingInitialSql -> LoggedIn <-> SentClientRequest <-> SentAttention
//!
//! ReRouting, TransientFailureRetry -> Connecting
//! any state -> Final
//! ```
//!
//! The transition table lives in [`StateMachine`] and is pure; the driver
//! performs each state's I/O and feeds the outcome back as the next
//! [`Event`]. Requests run one at a time. A request can be canceled before
//! it is written (it never reaches the server), while it is being written
//! (the message is closed with the IGNORE bit) or after (an attention is
//! sent and its acknowledgement awaited).
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_client::{Config, Connection, IsolationLevel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tds_client::Error> {
//!     let config = Config::from_connection_string(
//!         "Server=localhost;Database=test;User Id=sa;Password=Password123;",
//!     )?;
//!     let conn = Connection::new(config)?;
//!     conn.connect().await?;
//!
//!     let response = conn.execute_batch("select name from sys.databases").await?;
//!     println!("{} databases", response.rows().count());
//!
//!     conn.transaction(IsolationLevel::ReadCommitted, |tx| async move {
//!         tx.execute_batch("insert into audit values (1)").await?;
//!         Ok(())
//!     })
//!     .await?;
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod connector;
mod driver;
pub mod error;
pub mod events;
mod handler;
mod instance;
pub mod request;
pub mod state;
mod timers;
mod transaction;
mod transport;

pub use config::{Config, DEFAULT_PORT, SQL_BROWSER_PORT};
pub use connection::{Connection, PreparedStatement, SessionStatus};
pub use connector::{SocketConnector, TcpConnector};
pub use error::{Error, Result, ServerError, TRANSIENT_ERROR_NUMBERS};
pub use events::ConnectionEvent;
pub use request::{CancelHandle, Request, Response, ResponseFuture, ResultSet};
pub use state::{Event, State, StateMachine, Transition, TransitionError};

pub use tds_auth::{
    Authentication, AuthenticationBuilder, AuthenticationType, StaticTokenProvider, TokenProvider,
    TokenRequest,
};
pub use tds_protocol::{IsolationLevel, RpcParam, RpcRequest, RpcValue, TdsVersion};
