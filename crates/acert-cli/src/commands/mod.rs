//! CLI commands

pub mod agent;
pub mod bootstrap;
pub mod server;
