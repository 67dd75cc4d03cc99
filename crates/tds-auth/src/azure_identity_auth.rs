//! Token acquisition through `azure_identity`.
//!
//! | Variant | Credential |
//! |---------|------------|
//! | `AzureAdMsiVm`, `AzureAdMsiAppService` | `ManagedIdentityCredential` |
//! | `AzureAdServicePrincipalSecret` | `ClientSecretCredential` |
//! | `AzureAdDefault` | managed identity, then the Azure CLI |
//! | `AzureAdAccessToken` | the token itself |
//!
//! `AzureAdPassword` is not offered by `azure_identity` and fails with
//! [`AuthError::UnsupportedMethod`].

use std::sync::Arc;

use async_trait::async_trait;
use azure_core::credentials::{Secret, TokenCredential};
use azure_identity::{
    AzureCliCredential, ClientSecretCredential, ManagedIdentityCredential,
    ManagedIdentityCredentialOptions, UserAssignedId,
};

use crate::authentication::Authentication;
use crate::error::AuthError;
use crate::provider::{TokenProvider, TokenRequest};

/// [`TokenProvider`] backed by `azure_identity` credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct AzureIdentityProvider;

impl AzureIdentityProvider {
    /// New provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn managed_identity(
    client_id: Option<&String>,
) -> Result<Arc<ManagedIdentityCredential>, AuthError> {
    let options = client_id.map(|id| ManagedIdentityCredentialOptions {
        user_assigned_id: Some(UserAssignedId::ClientId(id.clone())),
        ..Default::default()
    });
    ManagedIdentityCredential::new(options).map_err(|e| AuthError::TokenAcquisition(e.to_string()))
}

async fn fetch(credential: Arc<dyn TokenCredential>, scope: &str) -> Result<String, AuthError> {
    let token = credential
        .get_token(&[scope], None)
        .await
        .map_err(|e| AuthError::TokenAcquisition(e.to_string()))?;
    Ok(token.token.secret().to_string())
}

#[async_trait]
impl TokenProvider for AzureIdentityProvider {
    async fn token(
        &self,
        auth: &Authentication,
        request: &TokenRequest,
    ) -> Result<String, AuthError> {
        let scope = request.scope();
        tracing::debug!(auth_type = %auth.auth_type(), scope = %scope, "acquiring token");

        match auth {
            Authentication::AzureAdAccessToken { token } => Ok(token.clone()),
            Authentication::AzureAdMsiVm { client_id }
            | Authentication::AzureAdMsiAppService { client_id } => {
                fetch(managed_identity(client_id.as_ref())?, &scope).await
            }
            Authentication::AzureAdServicePrincipalSecret {
                client_id,
                client_secret,
                tenant_id,
            } => {
                let credential = ClientSecretCredential::new(
                    tenant_id,
                    client_id.clone(),
                    Secret::new(client_secret.clone()),
                    None,
                )
                .map_err(|e| AuthError::TokenAcquisition(e.to_string()))?;
                fetch(credential, &scope).await
            }
            Authentication::AzureAdDefault { client_id } => {
                let msi = match managed_identity(client_id.as_ref()) {
                    Ok(credential) => fetch(credential, &scope).await,
                    Err(e) => Err(e),
                };
                match msi {
                    Ok(token) => Ok(token),
                    Err(e) => {
                        tracing::debug!(error = %e, "managed identity unavailable, trying Azure CLI");
                        let cli = AzureCliCredential::new(None)
                            .map_err(|e| AuthError::TokenAcquisition(e.to_string()))?;
                        fetch(cli, &scope).await
                    }
                }
            }
            other => Err(AuthError::UnsupportedMethod(format!(
                "{} is not available through azure_identity",
                other.auth_type()
            ))),
        }
    }
}
