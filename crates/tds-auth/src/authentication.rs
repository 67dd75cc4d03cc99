//! The authentication descriptor and its validating builder.
//!
//! [`Authentication`] is a closed set of credential strategies. Every value
//! that escapes [`AuthenticationBuilder::build`] carries the fields its
//! variant needs, so login code never re-checks option combinations.

use std::fmt;
use std::str::FromStr;

use crate::error::AuthError;
use crate::fedauth::FedAuthWorkflow;

/// How the LOGIN7 exchange proceeds for a given authentication variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFlow {
    /// Credentials (or an embedded access token) travel in LOGIN7 itself.
    Standard,
    /// NTLM negotiate/challenge/authenticate over SSPI tokens.
    Ntlm,
    /// The server answers with FEDAUTHINFO and a token is sent afterwards.
    FedAuth,
}

/// Credential strategy used to log in.
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    /// SQL Server authentication.
    Default {
        /// Login name.
        username: Option<String>,
        /// Password.
        password: Option<String>,
    },
    /// NTLM authentication against a Windows domain.
    Ntlm {
        /// User name without the domain part.
        username: Option<String>,
        /// Password.
        password: Option<String>,
        /// Domain, always upper case.
        domain: String,
    },
    /// Azure AD user name and password.
    AzureAdPassword {
        /// User principal name.
        username: String,
        /// Password.
        password: String,
        /// Application (client) id.
        client_id: String,
        /// Tenant id; the common tenant when absent.
        tenant_id: Option<String>,
    },
    /// A bearer token obtained by the caller.
    AzureAdAccessToken {
        /// The token.
        token: String,
    },
    /// Managed identity on an Azure VM.
    AzureAdMsiVm {
        /// Client id of a user-assigned identity.
        client_id: Option<String>,
    },
    /// Managed identity on Azure App Service.
    AzureAdMsiAppService {
        /// Client id of a user-assigned identity.
        client_id: Option<String>,
    },
    /// Whatever credential the environment provides.
    AzureAdDefault {
        /// Client id of a user-assigned identity.
        client_id: Option<String>,
    },
    /// Service principal with a client secret.
    AzureAdServicePrincipalSecret {
        /// Application (client) id.
        client_id: String,
        /// Client secret.
        client_secret: String,
        /// Tenant id.
        tenant_id: String,
    },
}

impl Authentication {
    /// SQL Server authentication with a login name and password.
    pub fn sql(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Default {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Authentication with a caller-supplied access token.
    pub fn access_token(token: impl Into<String>) -> Self {
        Self::AzureAdAccessToken {
            token: token.into(),
        }
    }

    /// Start a builder for the given variant.
    pub fn builder(auth_type: AuthenticationType) -> AuthenticationBuilder {
        AuthenticationBuilder::new(auth_type)
    }

    /// The variant's type tag.
    #[must_use]
    pub fn auth_type(&self) -> AuthenticationType {
        match self {
            Self::Default { .. } => AuthenticationType::Default,
            Self::Ntlm { .. } => AuthenticationType::Ntlm,
            Self::AzureAdPassword { .. } => AuthenticationType::AzureAdPassword,
            Self::AzureAdAccessToken { .. } => AuthenticationType::AzureAdAccessToken,
            Self::AzureAdMsiVm { .. } => AuthenticationType::AzureAdMsiVm,
            Self::AzureAdMsiAppService { .. } => AuthenticationType::AzureAdMsiAppService,
            Self::AzureAdDefault { .. } => AuthenticationType::AzureAdDefault,
            Self::AzureAdServicePrincipalSecret { .. } => {
                AuthenticationType::AzureAdServicePrincipalSecret
            }
        }
    }

    /// Which login sub-exchange this variant drives.
    #[must_use]
    pub fn login_flow(&self) -> LoginFlow {
        match self {
            Self::Default { .. } | Self::AzureAdAccessToken { .. } => LoginFlow::Standard,
            Self::Ntlm { .. } => LoginFlow::Ntlm,
            _ => LoginFlow::FedAuth,
        }
    }

    /// The ADAL workflow announced in the FEDAUTH feature, for variants that
    /// fetch a token after FEDAUTHINFO.
    #[must_use]
    pub fn fedauth_workflow(&self) -> Option<FedAuthWorkflow> {
        match self {
            Self::AzureAdPassword { .. } => Some(FedAuthWorkflow::UserPass),
            Self::AzureAdMsiVm { .. }
            | Self::AzureAdMsiAppService { .. }
            | Self::AzureAdDefault { .. }
            | Self::AzureAdServicePrincipalSecret { .. } => Some(FedAuthWorkflow::Integrated),
            Self::Default { .. } | Self::Ntlm { .. } | Self::AzureAdAccessToken { .. } => None,
        }
    }

    /// Whether a FEDAUTH feature extension goes into LOGIN7.
    #[must_use]
    pub fn uses_fedauth_feature(&self) -> bool {
        !matches!(self, Self::Default { .. } | Self::Ntlm { .. })
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets never reach logs.
        match self {
            Self::Default { username, .. } => f
                .debug_struct("Default")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Ntlm {
                username, domain, ..
            } => f
                .debug_struct("Ntlm")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .field("domain", domain)
                .finish(),
            Self::AzureAdPassword {
                username,
                client_id,
                tenant_id,
                ..
            } => f
                .debug_struct("AzureAdPassword")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .field("client_id", client_id)
                .field("tenant_id", tenant_id)
                .finish(),
            Self::AzureAdAccessToken { .. } => f
                .debug_struct("AzureAdAccessToken")
                .field("token", &"[REDACTED]")
                .finish(),
            Self::AzureAdMsiVm { client_id } => f
                .debug_struct("AzureAdMsiVm")
                .field("client_id", client_id)
                .finish(),
            Self::AzureAdMsiAppService { client_id } => f
                .debug_struct("AzureAdMsiAppService")
                .field("client_id", client_id)
                .finish(),
            Self::AzureAdDefault { client_id } => f
                .debug_struct("AzureAdDefault")
                .field("client_id", client_id)
                .finish(),
            Self::AzureAdServicePrincipalSecret {
                client_id,
                tenant_id,
                ..
            } => f
                .debug_struct("AzureAdServicePrincipalSecret")
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .field("tenant_id", tenant_id)
                .finish(),
        }
    }
}

impl Default for Authentication {
    fn default() -> Self {
        Self::Default {
            username: None,
            password: None,
        }
    }
}

/// Authentication type names, as accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationType {
    /// `default`
    Default,
    /// `ntlm`
    Ntlm,
    /// `azure-active-directory-password`
    AzureAdPassword,
    /// `azure-active-directory-access-token`
    AzureAdAccessToken,
    /// `azure-active-directory-msi-vm`
    AzureAdMsiVm,
    /// `azure-active-directory-msi-app-service`
    AzureAdMsiAppService,
    /// `azure-active-directory-default`
    AzureAdDefault,
    /// `azure-active-directory-service-principal-secret`
    AzureAdServicePrincipalSecret,
}

impl AuthenticationType {
    /// The configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Ntlm => "ntlm",
            Self::AzureAdPassword => "azure-active-directory-password",
            Self::AzureAdAccessToken => "azure-active-directory-access-token",
            Self::AzureAdMsiVm => "azure-active-directory-msi-vm",
            Self::AzureAdMsiAppService => "azure-active-directory-msi-app-service",
            Self::AzureAdDefault => "azure-active-directory-default",
            Self::AzureAdServicePrincipalSecret => {
                "azure-active-directory-service-principal-secret"
            }
        }
    }
}

impl fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [AuthenticationType; 8] = [
            AuthenticationType::Default,
            AuthenticationType::Ntlm,
            AuthenticationType::AzureAdPassword,
            AuthenticationType::AzureAdAccessToken,
            AuthenticationType::AzureAdMsiVm,
            AuthenticationType::AzureAdMsiAppService,
            AuthenticationType::AzureAdDefault,
            AuthenticationType::AzureAdServicePrincipalSecret,
        ];
        let name = s.trim();
        ALL.into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| AuthError::UnknownType(name.to_string()))
    }
}

/// Collects loosely typed options and produces a checked [`Authentication`].
#[derive(Clone, Default)]
pub struct AuthenticationBuilder {
    auth_type: Option<AuthenticationType>,
    username: Option<String>,
    password: Option<String>,
    domain: Option<String>,
    token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    tenant_id: Option<String>,
}

impl fmt::Debug for AuthenticationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationBuilder")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl AuthenticationBuilder {
    /// New builder for `auth_type`.
    pub fn new(auth_type: AuthenticationType) -> Self {
        Self {
            auth_type: Some(auth_type),
            ..Self::default()
        }
    }

    /// Set the user name.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the NTLM domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the access token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the Azure AD client id.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the Azure AD client secret.
    #[must_use]
    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Set the Azure AD tenant id.
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Validate the collected options.
    pub fn build(self) -> Result<Authentication, AuthError> {
        let auth_type = self.auth_type.unwrap_or(AuthenticationType::Default);
        let name = auth_type.as_str();
        let required = |value: Option<String>, field: &'static str| {
            value
                .filter(|v| !v.is_empty())
                .ok_or(AuthError::MissingOption {
                    auth_type: name,
                    field,
                })
        };

        let auth = match auth_type {
            AuthenticationType::Default => Authentication::Default {
                username: self.username,
                password: self.password,
            },
            AuthenticationType::Ntlm => Authentication::Ntlm {
                domain: required(self.domain, "domain")?.to_uppercase(),
                username: self.username,
                password: self.password,
            },
            AuthenticationType::AzureAdPassword => Authentication::AzureAdPassword {
                username: required(self.username, "userName")?,
                password: required(self.password, "password")?,
                client_id: required(self.client_id, "clientId")?,
                tenant_id: self.tenant_id.filter(|t| !t.is_empty()),
            },
            AuthenticationType::AzureAdAccessToken => Authentication::AzureAdAccessToken {
                token: required(self.token, "token")?,
            },
            AuthenticationType::AzureAdMsiVm => Authentication::AzureAdMsiVm {
                client_id: self.client_id,
            },
            AuthenticationType::AzureAdMsiAppService => Authentication::AzureAdMsiAppService {
                client_id: self.client_id,
            },
            AuthenticationType::AzureAdDefault => Authentication::AzureAdDefault {
                client_id: self.client_id,
            },
            AuthenticationType::AzureAdServicePrincipalSecret => {
                Authentication::AzureAdServicePrincipalSecret {
                    client_id: required(self.client_id, "clientId")?,
                    client_secret: required(self.client_secret, "clientSecret")?,
                    tenant_id: required(self.tenant_id, "tenantId")?,
                }
            }
        };

        tracing::debug!(auth_type = name, "authentication configured");
        Ok(auth)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ntlm_requires_domain() {
        let err = AuthenticationBuilder::new(AuthenticationType::Ntlm)
            .username("bob")
            .password("pw")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::MissingOption {
                field: "domain",
                ..
            }
        ));
    }

    #[test]
    fn test_ntlm_domain_uppercased() {
        let auth = AuthenticationBuilder::new(AuthenticationType::Ntlm)
            .username("bob")
            .password("pw")
            .domain("corp.local")
            .build()
            .unwrap();
        assert!(matches!(
            auth,
            Authentication::Ntlm { ref domain, .. } if domain == "CORP.LOCAL"
        ));
    }

    #[test]
    fn test_service_principal_requires_all_fields() {
        let base = AuthenticationBuilder::new(AuthenticationType::AzureAdServicePrincipalSecret)
            .client_id("app")
            .tenant_id("tenant");
        let err = base.clone().build().unwrap_err();
        assert!(err.to_string().contains("clientSecret"));

        let auth = base.client_secret("s3cret").build().unwrap();
        assert_eq!(auth.login_flow(), LoginFlow::FedAuth);
        assert_eq!(auth.fedauth_workflow(), Some(FedAuthWorkflow::Integrated));
    }

    #[test]
    fn test_azure_password_requires_client_id() {
        let err = AuthenticationBuilder::new(AuthenticationType::AzureAdPassword)
            .username("user@contoso.com")
            .password("pw")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("clientId"));
    }

    #[test]
    fn test_empty_token_rejected() {
        let err = AuthenticationBuilder::new(AuthenticationType::AzureAdAccessToken)
            .token("")
            .build()
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingOption { field: "token", .. }));
    }

    #[test]
    fn test_login_flow_per_variant() {
        assert_eq!(Authentication::sql("sa", "pw").login_flow(), LoginFlow::Standard);
        assert_eq!(
            Authentication::access_token("t").login_flow(),
            LoginFlow::Standard
        );
        assert!(Authentication::access_token("t").uses_fedauth_feature());
        assert!(!Authentication::sql("sa", "pw").uses_fedauth_feature());
        let msi = AuthenticationBuilder::new(AuthenticationType::AzureAdMsiVm)
            .build()
            .unwrap();
        assert_eq!(msi.login_flow(), LoginFlow::FedAuth);
    }

    #[test]
    fn test_type_names_parse() {
        for name in [
            "default",
            "ntlm",
            "azure-active-directory-password",
            "azure-active-directory-access-token",
            "azure-active-directory-msi-vm",
            "azure-active-directory-msi-app-service",
            "azure-active-directory-default",
            "azure-active-directory-service-principal-secret",
        ] {
            let parsed: AuthenticationType = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name);
        }
        assert!("kerberos".parse::<AuthenticationType>().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let auth = Authentication::sql("sa", "hunter2");
        let shown = format!("{auth:?}");
        assert!(shown.contains("sa"));
        assert!(!shown.contains("hunter2"));

        let token = format!("{:?}", Authentication::access_token("eyJ0eXAi"));
        assert!(!token.contains("eyJ0eXAi"));
    }
}
