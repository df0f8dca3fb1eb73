//! acert session server
//!
//! Accepts mutually authenticated `Poll` streams from agents, keeps one live
//! session per agent identity, routes tasks to agents, and evicts agents that
//! stop sending heartbeats.
//!
//! ```text
//! agent ──Poll──► AgentServer ──► drive_session ──► SessionRegistry ◄── sweeper
//!   ▲                                                   │
//!   └──────── response stream ◄── ServerSession ◄───────┘ dispatch / notify
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod sweeper;

use std::net::SocketAddr;
use std::sync::Arc;

use acert_common::ConfigError;
use acert_infra::{MtlsError, ServerMtlsConfig, TransportIdentity};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::ServerConfig;
pub use registry::{DispatchError, SessionRegistry, SharedSessionRegistry, SESSION_ESTABLISHED};
pub use server::AgentServer;
pub use session::{ServerSession, SessionId};
pub use sweeper::{join_sweeper, spawn_sweeper};

/// Errors that stop the server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Timings are inconsistent
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Server identity or client trust roots unusable
    #[error(transparent)]
    Mtls(#[from] MtlsError),

    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// gRPC transport failure
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Run the server until `shutdown` fires.
///
/// Loads the identity, starts the sweeper, and serves agent streams. Identity
/// and configuration errors are returned before anything is bound.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    config.timings.validate()?;
    let identity = TransportIdentity::from_files(&config.identity)?;
    let mtls = ServerMtlsConfig::new(identity);

    let registry = Arc::new(SessionRegistry::new(config.timings.liveness_timeout));
    let sweeper = spawn_sweeper(
        registry.clone(),
        config.timings.sweep_interval,
        shutdown.clone(),
    );

    info!(
        listen = %config.listen,
        liveness_timeout_secs = config.timings.liveness_timeout.as_secs(),
        sweep_interval_secs = config.timings.sweep_interval.as_secs(),
        "Session server starting"
    );

    let result = AgentServer::new(registry)
        .serve_with_mtls(config.listen, &mtls, shutdown.clone())
        .await;

    shutdown.cancel();
    join_sweeper(sweeper).await;
    result
}
