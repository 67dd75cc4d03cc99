//! # tds-testing
//!
//! Test infrastructure for tds-client.
//!
//! - [`MockTdsServer`]: a loopback TDS server that walks a client through
//!   login (standard, NTLM, federated, routed, failing) and answers
//!   requests with canned responses
//! - [`MockBrowser`]: a SQL Browser responder for named instance lookup
//! - [`tokens`]: encoders for the server side of the token stream
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::{LoginBehavior, MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_rerouted_login() {
//!     let target = MockTdsServer::builder().build().await.unwrap();
//!     let gateway = MockTdsServer::builder()
//!         .with_login(LoginBehavior::Route {
//!             host: target.host(),
//!             port: target.port(),
//!         })
//!         .build()
//!         .await
//!         .unwrap();
//!     // Connect to gateway; the client should end up logged in on target.
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod browser;
pub mod mock_server;
pub mod tokens;

pub use browser::MockBrowser;
pub use mock_server::{
    LoginBehavior, MockResponse, MockServerBuilder, MockServerConfig, MockServerError,
    MockTdsServer, Observed, TRANSIENT_LOGIN_ERROR,
};
