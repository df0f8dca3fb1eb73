//! `acert agent`

use std::path::PathBuf;
use std::time::Duration;

use acert_agent::AgentConfig;
use acert_common::{parse_duration, DEFAULT_SERVER_NAME};
use acert_infra::IdentityPaths;
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Agent arguments
#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Server address (`host`, `host:port` or a full URI)
    #[arg(long, env = "ACERT_SERVER_ADDR", default_value = "127.0.0.1:50051")]
    pub server_addr: String,

    /// Name the server certificate must be valid for
    #[arg(long, env = "ACERT_SERVER_NAME", default_value = DEFAULT_SERVER_NAME)]
    pub server_name: String,

    /// Client certificate (PEM); its CN is the agent id
    #[arg(long, env = "ACERT_CERT")]
    pub cert: PathBuf,

    /// Client private key (PEM)
    #[arg(long, env = "ACERT_KEY")]
    pub key: PathBuf,

    /// CA bundle trusted for the server certificate (PEM)
    #[arg(long, env = "ACERT_CA")]
    pub ca: PathBuf,

    /// Interval between heartbeats
    #[arg(long, env = "ACERT_HEARTBEAT_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub heartbeat_interval: Duration,

    /// Remaining certificate lifetime below which renewal is reported
    #[arg(long, env = "ACERT_RENEWAL_WINDOW", default_value = "168h", value_parser = parse_duration)]
    pub renewal_window: Duration,

    /// Consecutive failed attempts before giving up (0 = retry forever)
    #[arg(long, env = "ACERT_MAX_RETRIES", default_value_t = 0)]
    pub max_retries: u32,

    /// Dial timeout per connection attempt
    #[arg(long, env = "ACERT_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub connect_timeout: Duration,
}

impl AgentArgs {
    /// Build the agent configuration
    pub fn into_config(self) -> Result<AgentConfig> {
        if self.heartbeat_interval.is_zero() || self.connect_timeout.is_zero() {
            return Err(crate::Error::validation("--heartbeat-interval and --connect-timeout must be greater than zero"));
        }

        let mut config = AgentConfig::new(
            &self.server_addr,
            IdentityPaths {
                cert: self.cert,
                key: self.key,
                ca: self.ca,
            },
        );
        config.server_name = self.server_name;
        config.connect_timeout = self.connect_timeout;
        config.session.heartbeat_interval = self.heartbeat_interval;
        config.session.renewal_window = self.renewal_window;
        config.session.retry.max_attempts = self.max_retries;
        Ok(config)
    }
}

/// Run the agent until `shutdown` fires
pub async fn run(args: AgentArgs, shutdown: CancellationToken) -> Result<()> {
    let config = args.into_config()?;
    acert_agent::run(config, shutdown).await?;
    Ok(())
}
