//! Out-of-band bearer token acquisition.
//!
//! The connection calls a [`TokenProvider`] after the server sends
//! FEDAUTHINFO. Token fetching is the only suspension point during login
//! that does not touch the socket.

use async_trait::async_trait;

use crate::authentication::Authentication;
use crate::error::AuthError;
use crate::fedauth::scope_for_spn;

/// What the server asked for in FEDAUTHINFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// Security token service URL.
    pub sts_url: String,
    /// Service principal name of the server.
    pub spn: String,
}

impl TokenRequest {
    /// The OAuth scope derived from the SPN.
    #[must_use]
    pub fn scope(&self) -> String {
        scope_for_spn(&self.spn)
    }
}

/// Fetches bearer tokens for the federated authentication variants.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a token for `auth` that the server described in `request`.
    async fn token(
        &self,
        auth: &Authentication,
        request: &TokenRequest,
    ) -> Result<String, AuthError>;
}

/// Hands out a fixed token regardless of the request.
///
/// Useful behind an identity service the application already talks to,
/// and in tests.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(
        &self,
        _auth: &Authentication,
        request: &TokenRequest,
    ) -> Result<String, AuthError> {
        tracing::debug!(spn = %request.spn, "returning static federated auth token");
        Ok(self.token.clone())
    }
}

/// Provider used when nothing else is configured: only an access token
/// descriptor can be satisfied.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTokenProvider;

#[async_trait]
impl TokenProvider for NoTokenProvider {
    async fn token(
        &self,
        auth: &Authentication,
        _request: &TokenRequest,
    ) -> Result<String, AuthError> {
        match auth {
            Authentication::AzureAdAccessToken { token } => Ok(token.clone()),
            other => Err(AuthError::UnsupportedMethod(format!(
                "no token provider configured for {}",
                other.auth_type()
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::authentication::{AuthenticationBuilder, AuthenticationType};

    fn request() -> TokenRequest {
        TokenRequest {
            sts_url: "https://login.windows.net/tenant".into(),
            spn: "https://database.windows.net/".into(),
        }
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("abc");
        let auth = AuthenticationBuilder::new(AuthenticationType::AzureAdMsiVm)
            .build()
            .unwrap();
        assert_eq!(provider.token(&auth, &request()).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_no_provider_rejects_msi() {
        let auth = AuthenticationBuilder::new(AuthenticationType::AzureAdDefault)
            .build()
            .unwrap();
        let err = NoTokenProvider.token(&auth, &request()).await.unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedMethod(_)));
    }

    #[test]
    fn test_no_provider_passes_access_token_through() {
        let auth = Authentication::access_token("t0k");
        let token = tokio_test::block_on(NoTokenProvider.token(&auth, &request())).unwrap();
        assert_eq!(token, "t0k");
    }

    #[test]
    fn test_request_scope() {
        assert_eq!(request().scope(), "https://database.windows.net/.default");
    }
}
