//! mTLS configuration for gRPC sessions
//!
//! A [`TransportIdentity`] is the validated local key material: leaf
//! certificate, private key, and trusted root bundle. Both sides build their
//! tonic TLS configuration from it; the agent additionally binds the server
//! name it expects to see in the server certificate.
//!
//! Loading fails with [`MtlsError::IdentityLoad`] when the leaf or key cannot
//! be used and [`MtlsError::TrustStore`] when the root bundle cannot be
//! decoded. Both are fatal at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use acert_common::AgentId;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use tracing::debug;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::pki::{CertificateInfo, CertificateStatus};

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// Leaf certificate or private key unusable
    #[error("failed to load identity: {0}")]
    IdentityLoad(String),

    /// Trusted root bundle unusable
    #[error("failed to load trust store: {0}")]
    TrustStore(String),

    /// Peer certificate missing or does not name a valid agent
    #[error("invalid peer certificate: {0}")]
    PeerCertificate(String),
}

/// Locations of PEM files making up a transport identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    /// Leaf certificate
    pub cert: PathBuf,
    /// Private key for the leaf
    pub key: PathBuf,
    /// Trusted root bundle
    pub ca: PathBuf,
}

/// Validated local certificate, key, and trusted roots
#[derive(Clone)]
pub struct TransportIdentity {
    cert_pem: String,
    key_pem: Zeroizing<String>,
    ca_pem: String,
    leaf: CertificateInfo,
}

impl std::fmt::Debug for TransportIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportIdentity")
            .field("leaf", &self.leaf)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl TransportIdentity {
    /// Validate PEM material held in memory
    pub fn from_pem(
        cert_pem: String,
        key_pem: Zeroizing<String>,
        ca_pem: String,
    ) -> Result<Self, MtlsError> {
        let leaf = CertificateInfo::from_pem(&cert_pem)
            .map_err(|e| MtlsError::IdentityLoad(format!("leaf certificate: {}", e)))?;
        validate_private_key(&key_pem)?;
        validate_trust_bundle(&ca_pem)?;

        Ok(Self {
            cert_pem,
            key_pem,
            ca_pem,
            leaf,
        })
    }

    /// Read and validate PEM files
    pub fn from_files(paths: &IdentityPaths) -> Result<Self, MtlsError> {
        let cert_pem = read_pem(&paths.cert).map_err(MtlsError::IdentityLoad)?;
        let key_pem = Zeroizing::new(read_pem(&paths.key).map_err(MtlsError::IdentityLoad)?);
        let ca_pem = read_pem(&paths.ca).map_err(MtlsError::TrustStore)?;
        let identity = Self::from_pem(cert_pem, key_pem, ca_pem)?;
        debug!(
            cert = %paths.cert.display(),
            common_name = identity.leaf.common_name.as_deref().unwrap_or("<none>"),
            not_after = identity.leaf.validity.not_after,
            "Loaded transport identity"
        );
        Ok(identity)
    }

    /// Parsed leaf certificate
    pub fn leaf(&self) -> &CertificateInfo {
        &self.leaf
    }

    /// Agent identity named by the leaf CN
    pub fn agent_id(&self) -> Result<AgentId, MtlsError> {
        self.leaf
            .agent_id()
            .map_err(|e| MtlsError::IdentityLoad(e.to_string()))
    }

    /// Classify the leaf validity at `now` (unix seconds)
    pub fn status(&self, now: i64, renewal_window: Duration) -> CertificateStatus {
        self.leaf.validity.status(now, renewal_window)
    }

    /// Trusted root bundle PEM
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    fn tonic_identity(&self) -> Identity {
        Identity::from_pem(&self.cert_pem, self.key_pem.as_bytes())
    }
}

/// Server-side mTLS configuration
#[derive(Debug, Clone)]
pub struct ServerMtlsConfig {
    identity: TransportIdentity,
}

impl ServerMtlsConfig {
    /// Create a new server mTLS config
    pub fn new(identity: TransportIdentity) -> Self {
        Self { identity }
    }

    /// Build a tonic ServerTlsConfig that requires client certificates
    /// signed by the trusted roots
    pub fn to_tonic_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.tonic_identity())
            .client_ca_root(Certificate::from_pem(&self.identity.ca_pem))
    }
}

/// Client-side mTLS configuration
#[derive(Debug, Clone)]
pub struct ClientMtlsConfig {
    identity: TransportIdentity,
    server_name: String,
}

impl ClientMtlsConfig {
    /// Create a new client mTLS config verifying the server as `server_name`
    pub fn new(identity: TransportIdentity, server_name: impl Into<String>) -> Self {
        Self {
            identity,
            server_name: server_name.into(),
        }
    }

    /// Local identity presented to the server
    pub fn identity(&self) -> &TransportIdentity {
        &self.identity
    }

    /// Server name checked against the server certificate
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Build a tonic ClientTlsConfig
    pub fn to_tonic_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .identity(self.identity.tonic_identity())
            .ca_certificate(Certificate::from_pem(&self.identity.ca_pem))
            .domain_name(self.server_name.clone())
    }
}

/// Extract the agent identity from a peer's DER certificate
pub fn extract_agent_id_from_cert(cert_der: &[u8]) -> Result<AgentId, MtlsError> {
    crate::pki::extract_agent_id(cert_der).map_err(|e| MtlsError::PeerCertificate(e.to_string()))
}

fn read_pem(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))
}

fn validate_private_key(key_pem: &str) -> Result<(), MtlsError> {
    let block = ::pem::parse(key_pem.as_bytes())
        .map_err(|e| MtlsError::IdentityLoad(format!("private key: {}", e)))?;
    let der = block.contents().to_vec();
    let key = match block.tag() {
        "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)),
        "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der)),
        "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der)),
        other => {
            return Err(MtlsError::IdentityLoad(format!(
                "private key: unsupported PEM block '{}'",
                other
            )))
        }
    };

    rustls::crypto::ring::default_provider()
        .key_provider
        .load_private_key(key)
        .map(|_| ())
        .map_err(|e| MtlsError::IdentityLoad(format!("private key: {}", e)))
}

fn validate_trust_bundle(ca_pem: &str) -> Result<(), MtlsError> {
    let blocks =
        ::pem::parse_many(ca_pem.as_bytes()).map_err(|e| MtlsError::TrustStore(e.to_string()))?;
    let certs: Vec<_> = blocks
        .iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .collect();
    if certs.is_empty() {
        return Err(MtlsError::TrustStore(
            "bundle contains no certificates".to_string(),
        ));
    }
    for block in certs {
        X509Certificate::from_der(block.contents())
            .map_err(|e| MtlsError::TrustStore(format!("root certificate: {}", e)))?;
    }
    Ok(())
}
