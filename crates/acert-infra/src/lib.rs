//! Transport identity for acert sessions
//!
//! - **mTLS**: loads and validates the local certificate, key, and trusted
//!   roots, and turns them into tonic client/server TLS configuration
//! - **PKI**: reads agent identity and validity windows out of certificates
//!
//! # Public API
//!
//! ## mTLS
//! - [`mtls::TransportIdentity`]: validated key material
//! - [`mtls::ServerMtlsConfig`], [`mtls::ClientMtlsConfig`]: TLS configuration for gRPC
//! - [`mtls::MtlsError`]: `IdentityLoad` / `TrustStore` failures
//!
//! ## PKI
//! - [`pki::CertificateInfo`], [`pki::CertificateValidity`], [`pki::CertificateStatus`]

pub mod mtls;
pub mod pki;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use mtls::{
    extract_agent_id_from_cert, ClientMtlsConfig, IdentityPaths, MtlsError, ServerMtlsConfig,
    TransportIdentity,
};
pub use pki::{CertificateStatus, CertificateValidity, DEFAULT_RENEWAL_WINDOW};
