//! TLS settings for upstream channels.
//!
//! By default the platform's native roots verify the control plane. A
//! private deployment can pin its own CA and present a client certificate.

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Client certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Client certificate and private key must be configured together")]
    IncompleteIdentity,

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Build the client TLS configuration for upstream channels.
///
/// # Errors
///
/// Returns an error if:
/// - a configured file does not exist or cannot be read
/// - only one of the client certificate and key is configured
pub async fn client_tls_config(config: &TlsConfig) -> Result<ClientTlsConfig, TlsError> {
    let mut tls = ClientTlsConfig::new().with_native_roots();

    if let Some(ca_cert_path) = &config.ca_cert_path {
        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path.clone()));
        }
        let ca_pem = fs::read(ca_cert_path).await?;
        tls = tls.ca_certificate(Certificate::from_pem(ca_pem));
    }

    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            if !cert_path.exists() {
                return Err(TlsError::CertNotFound(cert_path.clone()));
            }
            if !key_path.exists() {
                return Err(TlsError::KeyNotFound(key_path.clone()));
            }
            let cert_pem = fs::read(cert_path).await?;
            let key_pem = fs::read(key_path).await?;
            tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
        }
        (None, None) => {}
        _ => return Err(TlsError::IncompleteIdentity),
    }

    if let Some(domain_name) = &config.domain_name {
        tls = tls.domain_name(domain_name.clone());
    }

    Ok(tls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_uses_native_roots() {
        assert!(client_tls_config(&TlsConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_ca_is_reported() {
        let config = TlsConfig {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            ..Default::default()
        };

        let result = client_tls_config(&config).await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }

    #[tokio::test]
    async fn test_identity_requires_cert_and_key() {
        let config = TlsConfig {
            cert_path: Some(PathBuf::from("/tmp/client.crt")),
            ..Default::default()
        };

        let result = client_tls_config(&config).await;
        assert!(matches!(result, Err(TlsError::IncompleteIdentity)));
    }
}
