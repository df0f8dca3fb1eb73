//! acert CLI library

#![deny(missing_docs)]

pub mod commands;
pub mod error;
pub mod provision;
pub mod schema;

pub use error::{Error, Result};

use acert_common::telemetry::LogFormat;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// acert - certificate management toolbox with an agent and a server
#[derive(Parser, Debug)]
#[command(name = "acert")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format (text or json)
    #[arg(long, global = true, env = "ACERT_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Top level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent: keep a session open to the server and execute tasks
    Agent(commands::agent::AgentArgs),

    /// Run the session server
    Server(commands::server::ServerArgs),

    /// Render the PKI resources and cert-manager release acert depends on
    Bootstrap(commands::bootstrap::BootstrapArgs),
}

impl Cli {
    /// Run the selected command until it finishes or `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        match self.command {
            Commands::Agent(args) => commands::agent::run(args, shutdown).await,
            Commands::Server(args) => commands::server::run(args, shutdown).await,
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
        }
    }
}
