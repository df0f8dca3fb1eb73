//! `acert server`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use acert_common::{parse_duration, SessionTimings};
use acert_infra::IdentityPaths;
use acert_server::ServerConfig;
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Server arguments
#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "ACERT_LISTEN", default_value = "0.0.0.0:50051")]
    pub listen: SocketAddr,

    /// Server certificate (PEM)
    #[arg(long, env = "ACERT_CERT")]
    pub cert: PathBuf,

    /// Server private key (PEM)
    #[arg(long, env = "ACERT_KEY")]
    pub key: PathBuf,

    /// CA bundle agent certificates must chain to (PEM)
    #[arg(long, env = "ACERT_CA")]
    pub ca: PathBuf,

    /// Heartbeat interval agents are expected to use
    #[arg(long, env = "ACERT_HEARTBEAT_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub heartbeat_interval: Duration,

    /// Evict agents whose last heartbeat is older than this
    #[arg(long, env = "ACERT_LIVENESS_TIMEOUT", default_value = "20s", value_parser = parse_duration)]
    pub liveness_timeout: Duration,

    /// How often to look for stale agents
    #[arg(long, env = "ACERT_SWEEP_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub sweep_interval: Duration,
}

impl ServerArgs {
    /// Build and validate the server configuration
    pub fn into_config(self) -> Result<ServerConfig> {
        let timings = SessionTimings {
            heartbeat_interval: self.heartbeat_interval,
            liveness_timeout: self.liveness_timeout,
            sweep_interval: self.sweep_interval,
        };
        timings.validate()?;

        let mut config = ServerConfig::new(IdentityPaths {
            cert: self.cert,
            key: self.key,
            ca: self.ca,
        });
        config.listen = self.listen;
        config.timings = timings;
        Ok(config)
    }
}

/// Run the server until `shutdown` fires
pub async fn run(args: ServerArgs, shutdown: CancellationToken) -> Result<()> {
    let config = args.into_config()?;
    acert_server::run(config, shutdown).await?;
    Ok(())
}
