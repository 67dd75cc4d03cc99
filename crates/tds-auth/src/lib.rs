//! # tds-auth
//!
//! Authentication for TDS connections, kept apart from connection logic.
//!
//! | Variant | Login flow |
//! |---------|------------|
//! | `Default` | user name and password inside LOGIN7 |
//! | `Ntlm` | NTLM negotiate / challenge / authenticate over SSPI tokens |
//! | `AzureAdAccessToken` | bearer token inside the LOGIN7 FEDAUTH feature |
//! | other `AzureAd*` | FEDAUTHINFO from the server, token fetched by a [`TokenProvider`] |
//!
//! [`Authentication`] values are built through [`AuthenticationBuilder`],
//! which rejects missing fields before any socket is opened.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod authentication;
#[cfg(feature = "azure-identity")]
pub mod azure_identity_auth;
pub mod error;
pub mod fedauth;
pub mod ntlm;
pub mod provider;

pub use authentication::{Authentication, AuthenticationBuilder, AuthenticationType, LoginFlow};
#[cfg(feature = "azure-identity")]
pub use azure_identity_auth::AzureIdentityProvider;
pub use error::AuthError;
pub use fedauth::{FedAuthLibrary, FedAuthWorkflow};
pub use ntlm::{Challenge, NtlmCredentials};
pub use provider::{NoTokenProvider, StaticTokenProvider, TokenProvider, TokenRequest};
