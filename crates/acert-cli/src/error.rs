//! Error types for the CLI

use acert_agent::AgentError;
use acert_common::ConfigError;
use acert_server::ServerError;

use crate::provision::ProvisionError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Agent session failed
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    /// Server failed
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// Writing bootstrap resources failed
    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Invalid timings or durations
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Terminal or file I/O failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid command line input
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong
        message: String,
    },
}

impl Error {
    /// Build a [`Error::Validation`]
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}
