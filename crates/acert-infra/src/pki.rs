//! Certificate inspection for agent identities
//!
//! Issuance happens elsewhere (cert-manager in the bootstrap plan). This
//! module only reads certificates: the subject CN names the agent and the
//! validity window decides whether the local identity needs attention.
//!
//! # Renewal window
//!
//! A certificate inside its validity window but with less than the renewal
//! window remaining is [`CertificateStatus::ExpiringSoon`]. Agents log it and
//! keep connecting; the server still accepts the certificate until it expires.

use std::time::Duration;

use acert_common::{AgentId, AgentIdError};
use thiserror::Error;
use x509_parser::prelude::*;

/// Default renewal window for leaf certificates (7 days)
pub const DEFAULT_RENEWAL_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// PEM or DER could not be parsed
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate subject has no common name
    #[error("certificate subject has no common name")]
    MissingCommonName,

    /// Common name is not a valid agent identity
    #[error("certificate common name is not a valid agent id: {0}")]
    InvalidAgentId(#[from] AgentIdError),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity window of a certificate, as unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateValidity {
    /// When the certificate becomes valid
    pub not_before: i64,
    /// When the certificate expires
    pub not_after: i64,
}

/// Classification of a validity window at an instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStatus {
    /// `now` is before `not_before`
    NotYetValid,
    /// Valid with more than the renewal window remaining
    Valid,
    /// Valid, but expires within the renewal window
    ExpiringSoon {
        /// Time left until `not_after`
        remaining: Duration,
    },
    /// `now` is past `not_after`
    Expired,
}

impl CertificateStatus {
    /// Whether the certificate can currently be presented
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            CertificateStatus::Valid | CertificateStatus::ExpiringSoon { .. }
        )
    }
}

impl CertificateValidity {
    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining at `now` (negative once expired)
    pub fn remaining_secs(&self, now: i64) -> i64 {
        self.not_after - now
    }

    /// Classify this window at `now` (unix seconds)
    pub fn status(&self, now: i64, renewal_window: Duration) -> CertificateStatus {
        if now < self.not_before {
            return CertificateStatus::NotYetValid;
        }
        let remaining = self.remaining_secs(now);
        if remaining <= 0 {
            return CertificateStatus::Expired;
        }
        let remaining = Duration::from_secs(remaining as u64);
        if remaining <= renewal_window {
            CertificateStatus::ExpiringSoon { remaining }
        } else {
            CertificateStatus::Valid
        }
    }
}

/// Parsed view of a leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name, if present
    pub common_name: Option<String>,
    /// Validity window
    pub validity: CertificateValidity,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        Ok(Self {
            common_name,
            validity: CertificateValidity {
                not_before: cert.validity().not_before.timestamp(),
                not_after: cert.validity().not_after.timestamp(),
            },
        })
    }

    /// Agent identity named by the subject CN
    pub fn agent_id(&self) -> Result<AgentId> {
        let cn = self
            .common_name
            .as_deref()
            .ok_or(PkiError::MissingCommonName)?;
        Ok(AgentId::new(cn)?)
    }
}

/// Extract the agent identity from a DER certificate's subject CN
pub fn extract_agent_id(cert_der: &[u8]) -> Result<AgentId> {
    CertificateInfo::from_der(cert_der)?.agent_id()
}
