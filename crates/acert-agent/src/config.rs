//! Agent configuration

use std::time::Duration;

use acert_common::{DEFAULT_GRPC_PORT, DEFAULT_SERVER_NAME};
use acert_infra::IdentityPaths;

use crate::session::SessionConfig;

/// Default dial timeout for a single connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the agent needs to run its session loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server endpoint URI (`https://host:port`)
    pub endpoint: String,
    /// Name the server certificate is verified against
    pub server_name: String,
    /// Client certificate, key and CA bundle on disk
    pub identity: IdentityPaths,
    /// Dial timeout per attempt
    pub connect_timeout: Duration,
    /// Session loop tunables
    pub session: SessionConfig,
}

impl AgentConfig {
    /// Config for `server_addr` with defaults for everything else.
    ///
    /// `server_addr` may be `host`, `host:port` or a full URI; a missing
    /// scheme becomes `https://` and a missing port the default gRPC port.
    pub fn new(server_addr: &str, identity: IdentityPaths) -> Self {
        Self {
            endpoint: normalize_endpoint(server_addr),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            identity,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

/// Turn a user-supplied address into a dialable URI
pub fn normalize_endpoint(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    let (scheme, authority) = match addr.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("https", addr),
    };

    let has_port = match authority.rsplit_once(':') {
        // Bracketed IPv6 without a port ends in ']'
        Some((_, port)) => !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()),
        None => false,
    };

    if has_port {
        format!("{scheme}://{authority}")
    } else {
        format!("{scheme}://{authority}:{DEFAULT_GRPC_PORT}")
    }
}
