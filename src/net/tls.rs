//! TLS client configuration.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TLS Configuration                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │   TrustStore       - CA bundle loaded from tls.ca_path      │
//! │   TlsClientBuilder - Builds the rustls connector used for   │
//! │                      encrypted data connections             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same CA bundle is handed to the HTTP client for the streaming
//! configuration transport.

use anyhow::{Context, Result};

/// Trust store for CA certificates.
#[derive(Debug, Clone)]
pub struct TrustStore {
    /// CA certificates in PEM format.
    pub ca_certs_pem: Vec<u8>,
    /// Number of certificates loaded.
    pub cert_count: usize,
}

impl TrustStore {
    /// Load a trust store from a CA bundle file.
    pub fn load(ca_path: &str) -> Result<Self> {
        let ca_certs_pem = std::fs::read(ca_path)
            .with_context(|| format!("failed to read CA bundle: {}", ca_path))?;
        Self::from_pem(ca_certs_pem)
            .with_context(|| format!("no certificates in CA bundle: {}", ca_path))
    }

    /// Build a trust store from PEM bytes.
    pub fn from_pem(ca_certs_pem: Vec<u8>) -> Result<Self> {
        let text = String::from_utf8_lossy(&ca_certs_pem);
        let cert_count = text.matches("-----BEGIN CERTIFICATE-----").count();
        if cert_count == 0 {
            anyhow::bail!("CA bundle contains no PEM certificates");
        }
        Ok(Self {
            ca_certs_pem,
            cert_count,
        })
    }
}

/// Builds the client-side TLS connector.
#[derive(Debug, Clone)]
pub struct TlsClientBuilder {
    trust: TrustStore,
}

impl TlsClientBuilder {
    pub fn new(trust: TrustStore) -> Self {
        Self { trust }
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// Build a connector that verifies servers against the trust store.
    #[cfg(feature = "tls")]
    pub fn build(&self) -> Result<tokio_rustls::TlsConnector> {
        use std::sync::Arc;
        use tokio_rustls::rustls::pki_types::pem::PemObject;
        use tokio_rustls::rustls::pki_types::CertificateDer;
        use tokio_rustls::rustls::{ClientConfig, RootCertStore};

        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(&self.trust.ca_certs_pem) {
            let cert = cert.context("invalid certificate in CA bundle")?;
            roots.add(cert).context("rejected certificate in CA bundle")?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
    }
}
