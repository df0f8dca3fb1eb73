//! Opening session channels
//!
//! The session loop only needs "give me a fresh channel" and "how healthy is
//! my certificate". [`Connector`] is that seam; [`GrpcConnector`] is the real
//! mTLS implementation.

use std::time::Duration;

use acert_infra::pki::CertificateInfo;
use acert_infra::{CertificateStatus, ClientMtlsConfig, IdentityPaths, TransportIdentity};
use async_trait::async_trait;
use tracing::debug;

use crate::channel::{ConnectError, SessionChannel};

/// Source of fresh session channels
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new channel to the server
    async fn connect(&self) -> Result<SessionChannel, ConnectError>;

    /// Validity of the identity the next attempt will present, classified at
    /// `now` (unix seconds). `None` if it cannot be determined.
    fn certificate_status(&self, now: i64) -> Option<CertificateStatus>;
}

/// Where the connector gets its key material
#[derive(Debug, Clone)]
pub enum IdentitySource {
    /// Loaded once
    Static(TransportIdentity),
    /// Re-read from disk before every attempt, so rotated files are picked
    /// up without a restart
    Files(IdentityPaths),
}

/// mTLS gRPC connector
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    endpoint: String,
    server_name: String,
    source: IdentitySource,
    connect_timeout: Duration,
    renewal_window: Duration,
}

impl GrpcConnector {
    /// Create a connector for `endpoint`, verifying the server as `server_name`
    pub fn new(
        endpoint: impl Into<String>,
        server_name: impl Into<String>,
        source: IdentitySource,
        connect_timeout: Duration,
        renewal_window: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            server_name: server_name.into(),
            source,
            connect_timeout,
            renewal_window,
        }
    }

    /// Server endpoint URI
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn load_identity(&self) -> Result<TransportIdentity, ConnectError> {
        match &self.source {
            IdentitySource::Static(identity) => Ok(identity.clone()),
            IdentitySource::Files(paths) => TransportIdentity::from_files(paths)
                .map_err(|e| ConnectError::Identity(e.to_string())),
        }
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self) -> Result<SessionChannel, ConnectError> {
        let identity = self.load_identity()?;
        let tls = ClientMtlsConfig::new(identity, self.server_name.clone());
        debug!(endpoint = %self.endpoint, server_name = %self.server_name, "Dialing server");
        SessionChannel::open(&self.endpoint, &tls, self.connect_timeout).await
    }

    fn certificate_status(&self, now: i64) -> Option<CertificateStatus> {
        match &self.source {
            IdentitySource::Static(identity) => Some(identity.status(now, self.renewal_window)),
            IdentitySource::Files(paths) => {
                let pem = std::fs::read_to_string(&paths.cert).ok()?;
                let info = CertificateInfo::from_pem(&pem).ok()?;
                Some(info.validity.status(now, self.renewal_window))
            }
        }
    }
}
