//! Common types for acert: agent identity, session timings, retry, logging

#![deny(missing_docs)]

pub mod config;
pub mod identity;
pub mod retry;
pub mod telemetry;

pub use config::{parse_duration, ConfigError, SessionTimings};
pub use identity::{AgentId, AgentIdError};

/// Default port for the gRPC server (agent sessions)
pub const DEFAULT_GRPC_PORT: u16 = 50051;

/// Default TLS server name agents verify against
pub const DEFAULT_SERVER_NAME: &str = "server.acert.localhost";

/// Namespace for acert system resources (CA, issuers, server certificate)
pub const ACERT_SYSTEM_NAMESPACE: &str = "acert-system";

/// Current wall-clock time as unix seconds
///
/// Clamps to 0 if the system clock is before the epoch.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
