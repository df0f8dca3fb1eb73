//! acert agent
//!
//! Keeps one mutually authenticated `Poll` stream open to the server, sends
//! heartbeats on a fixed interval, hands server tasks to a [`TaskExecutor`],
//! and reconnects with backoff whenever the stream fails.
//!
//! ```text
//!                 ┌──────────── AgentSession ────────────┐
//!  Connector ───► │ SessionChannel ── heartbeat ticker ──┼──► server
//!                 │        └──── inbound task ───────────┼──◄ tasks / status
//!                 └───────────────┬──────────────────────┘
//!                          TaskExecutor / StatusSink
//! ```

#![deny(missing_docs)]

pub mod channel;
pub mod config;
pub mod connector;
pub mod executor;
pub mod session;

use std::sync::Arc;

use acert_infra::{MtlsError, TransportIdentity};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use channel::{ChannelReceiver, ChannelSender, ClosedError, ConnectError, SendError, SessionChannel};
pub use config::AgentConfig;
pub use connector::{Connector, GrpcConnector, IdentitySource};
pub use executor::{LoggingExecutor, LoggingStatusSink, StatusSink, TaskExecutor};
pub use session::{AgentSession, SessionConfig, SessionError, SessionState};

/// Errors that stop the agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// Identity files missing or unusable at startup
    #[error(transparent)]
    Mtls(#[from] MtlsError),

    /// Session loop gave up
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Run the agent until `shutdown` fires.
///
/// The identity is loaded once up front so a misconfigured agent fails fast.
/// After that every connection attempt re-reads the files, so rotated
/// certificates are used without a restart.
pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> Result<(), AgentError> {
    let identity = TransportIdentity::from_files(&config.identity)?;
    let agent_id = identity.agent_id()?;

    let status = identity.status(acert_common::unix_now(), config.session.renewal_window);
    if !status.is_usable() {
        warn!(agent = %agent_id, ?status, "Client certificate is not currently usable");
    }

    info!(
        agent = %agent_id,
        endpoint = %config.endpoint,
        server_name = %config.server_name,
        heartbeat_interval_secs = config.session.heartbeat_interval.as_secs(),
        "Agent starting"
    );

    let connector = GrpcConnector::new(
        config.endpoint,
        config.server_name,
        IdentitySource::Files(config.identity),
        config.connect_timeout,
        config.session.renewal_window,
    );

    AgentSession::new(Arc::new(connector), config.session)
        .run(shutdown)
        .await?;
    Ok(())
}
