//! TLS configuration.

use rustls::pki_types::CertificateDer;

/// TLS settings for one connection.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Accept any server certificate. Only for development.
    pub trust_server_certificate: bool,
    /// Extra trust anchors; the webpki roots are used when empty.
    pub root_certificates: Vec<CertificateDer<'static>>,
    /// Name checked against the certificate instead of the host name.
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Create a configuration with certificate validation enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the server certificate without validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Add a trust anchor.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Override the name used for certificate validation.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}
