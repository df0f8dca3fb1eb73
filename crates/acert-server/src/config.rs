//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};

use acert_common::{SessionTimings, DEFAULT_GRPC_PORT};
use acert_infra::IdentityPaths;

/// Configuration for the session server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept agent streams on
    pub listen: SocketAddr,
    /// Server certificate, key, and the root that signs agent certificates
    pub identity: IdentityPaths,
    /// Liveness timeout and sweep interval
    pub timings: SessionTimings,
}

impl ServerConfig {
    /// Config listening on all interfaces at the default gRPC port
    pub fn new(identity: IdentityPaths) -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_GRPC_PORT)),
            identity,
            timings: SessionTimings::default(),
        }
    }
}
