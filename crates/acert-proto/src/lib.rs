//! Protocol definitions for acert agent-server sessions.
//!
//! Agents open a single long-lived bidirectional gRPC stream (`Poll`) to the
//! server over mutual TLS. The stream carries typed frames in both directions:
//!
//! ```text
//! ┌──────────────┐   AgentRequest (Heartbeat)      ┌──────────────┐
//! │    Agent     │ ──────────────────────────────► │    Server    │
//! │ session loop │ ◄────────────────────────────── │   registry   │
//! └──────────────┘   ServerResponse (Task|Status)  └──────────────┘
//! ```
//!
//! Frames are FIFO within one direction of one stream. Nothing is ordered
//! across streams or between the two directions.
//!
//! # Key Message Types
//!
//! ## Agent to Server ([`AgentRequest`])
//!
//! - [`AgentHeartbeat`]: periodic liveness signal carrying unix seconds
//!
//! ## Server to Agent ([`ServerResponse`])
//!
//! - [`ServerTask`]: a lifecycle task for the agent (e.g. `renew`, `rotate`)
//! - [`ServerStatus`]: informational status text
//!
//! The message structs are declared with prost derives; the service client
//! and server stubs are generated by `build.rs`.

pub mod frame;

pub use frame::{Direction, Frame, FrameError};

/// Agent to server message. Tagged with the sending agent's identity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentRequest {
    /// Identity of the sending agent (the CN of its leaf certificate)
    #[prost(string, tag = "1")]
    pub agent_id: ::prost::alloc::string::String,
    /// Frame payload
    #[prost(oneof = "agent_request::Payload", tags = "2")]
    pub payload: ::core::option::Option<agent_request::Payload>,
}

/// Nested types for [`AgentRequest`]
pub mod agent_request {
    /// Frame payload sent by an agent
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// Liveness heartbeat
        #[prost(message, tag = "2")]
        Heartbeat(super::AgentHeartbeat),
    }
}

/// Liveness heartbeat
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AgentHeartbeat {
    /// Unix timestamp (seconds) at which the heartbeat was emitted
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
}

/// Server to agent message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerResponse {
    /// Frame payload
    #[prost(oneof = "server_response::Payload", tags = "1, 2")]
    pub payload: ::core::option::Option<server_response::Payload>,
}

/// Nested types for [`ServerResponse`]
pub mod server_response {
    /// Frame payload sent by the server
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// Lifecycle task for the agent
        #[prost(message, tag = "1")]
        Task(super::ServerTask),
        /// Informational status
        #[prost(message, tag = "2")]
        Status(super::ServerStatus),
    }
}

/// Lifecycle task pushed to a specific agent
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ServerTask {
    /// Server-assigned task identifier
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    /// Command to execute (e.g. "renew", "rotate")
    #[prost(string, tag = "2")]
    pub command: ::prost::alloc::string::String,
}

impl ServerTask {
    /// Create a task
    pub fn new(task_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            command: command.into(),
        }
    }
}

/// Informational status pushed to an agent
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ServerStatus {
    /// Human readable status text
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}

// Generated service stubs don't have docs
#[allow(missing_docs)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/acert.agent.v1.AgentService.rs"));
}

pub use generated::{agent_service_client, agent_service_server};
