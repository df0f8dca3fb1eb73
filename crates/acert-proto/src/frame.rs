//! Typed frame exchanged on a session stream.
//!
//! [`Frame`] is the domain view of the wire messages. Each variant is only
//! legal in one direction; conversions into wire messages enforce that.

use crate::{
    agent_request, server_response, AgentHeartbeat, AgentRequest, ServerResponse, ServerStatus,
    ServerTask,
};

/// Which side of the stream may emit a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Agent to server
    AgentToServer,
    /// Server to agent
    ServerToAgent,
}

/// A single typed message on a session stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Liveness signal from the agent
    Heartbeat(AgentHeartbeat),
    /// Lifecycle task from the server
    Task(ServerTask),
    /// Informational status from the server
    Status(ServerStatus),
}

/// Errors converting between frames and wire messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame kind cannot travel in the requested direction
    #[error("{kind} frames cannot be sent {direction:?}")]
    WrongDirection {
        /// Frame kind
        kind: &'static str,
        /// Attempted direction
        direction: Direction,
    },
    /// Wire message carried no payload
    #[error("message has no payload")]
    MissingPayload,
}

impl Frame {
    /// Heartbeat frame stamped with the given unix seconds
    pub fn heartbeat(timestamp: i64) -> Self {
        Frame::Heartbeat(AgentHeartbeat { timestamp })
    }

    /// Task frame
    pub fn task(task_id: impl Into<String>, command: impl Into<String>) -> Self {
        Frame::Task(ServerTask::new(task_id, command))
    }

    /// Status frame
    pub fn status(message: impl Into<String>) -> Self {
        Frame::Status(ServerStatus {
            message: message.into(),
        })
    }

    /// Short name of the frame kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Heartbeat(_) => "heartbeat",
            Frame::Task(_) => "task",
            Frame::Status(_) => "status",
        }
    }

    /// Direction this frame is allowed to travel
    pub fn direction(&self) -> Direction {
        match self {
            Frame::Heartbeat(_) => Direction::AgentToServer,
            Frame::Task(_) | Frame::Status(_) => Direction::ServerToAgent,
        }
    }

    /// Wrap this frame in an [`AgentRequest`] tagged with `agent_id`
    pub fn into_request(self, agent_id: impl Into<String>) -> Result<AgentRequest, FrameError> {
        let payload = match self {
            Frame::Heartbeat(hb) => agent_request::Payload::Heartbeat(hb),
            other => {
                return Err(FrameError::WrongDirection {
                    kind: other.kind(),
                    direction: Direction::AgentToServer,
                })
            }
        };
        Ok(AgentRequest {
            agent_id: agent_id.into(),
            payload: Some(payload),
        })
    }

    /// Wrap this frame in a [`ServerResponse`]
    pub fn into_response(self) -> Result<ServerResponse, FrameError> {
        let payload = match self {
            Frame::Task(task) => server_response::Payload::Task(task),
            Frame::Status(status) => server_response::Payload::Status(status),
            other => {
                return Err(FrameError::WrongDirection {
                    kind: other.kind(),
                    direction: Direction::ServerToAgent,
                })
            }
        };
        Ok(ServerResponse {
            payload: Some(payload),
        })
    }
}

impl From<agent_request::Payload> for Frame {
    fn from(payload: agent_request::Payload) -> Self {
        match payload {
            agent_request::Payload::Heartbeat(hb) => Frame::Heartbeat(hb),
        }
    }
}

impl From<server_response::Payload> for Frame {
    fn from(payload: server_response::Payload) -> Self {
        match payload {
            server_response::Payload::Task(task) => Frame::Task(task),
            server_response::Payload::Status(status) => Frame::Status(status),
        }
    }
}

impl TryFrom<ServerResponse> for Frame {
    type Error = FrameError;

    fn try_from(msg: ServerResponse) -> Result<Self, Self::Error> {
        msg.payload.map(Frame::from).ok_or(FrameError::MissingPayload)
    }
}

impl TryFrom<AgentRequest> for Frame {
    type Error = FrameError;

    fn try_from(msg: AgentRequest) -> Result<Self, Self::Error> {
        msg.payload.map(Frame::from).ok_or(FrameError::MissingPayload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn heartbeat_request_carries_agent_id() {
        let req = Frame::heartbeat(1_700_000_000)
            .into_request("agent-1")
            .expect("heartbeat is agent-to-server");
        assert_eq!(req.agent_id, "agent-1");
        assert_eq!(
            req.payload,
            Some(agent_request::Payload::Heartbeat(AgentHeartbeat {
                timestamp: 1_700_000_000
            }))
        );
    }

    #[test]
    fn server_frames_cannot_become_requests() {
        let err = Frame::task("t1", "rotate")
            .into_request("agent-1")
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::WrongDirection {
                kind: "task",
                direction: Direction::AgentToServer
            }
        );
    }

    #[test]
    fn heartbeats_cannot_become_responses() {
        let err = Frame::heartbeat(1).into_response().unwrap_err();
        assert!(matches!(err, FrameError::WrongDirection { kind: "heartbeat", .. }));
    }

    #[test]
    fn response_without_payload_is_rejected() {
        let err = Frame::try_from(ServerResponse { payload: None }).unwrap_err();
        assert_eq!(err, FrameError::MissingPayload);
    }

    #[test]
    fn task_survives_wire_encoding() {
        let resp = Frame::task("t1", "rotate").into_response().unwrap();
        let bytes = resp.encode_to_vec();
        let decoded = ServerResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(Frame::try_from(decoded).unwrap(), Frame::task("t1", "rotate"));
    }

    #[test]
    fn directions_match_kinds() {
        assert_eq!(Frame::heartbeat(0).direction(), Direction::AgentToServer);
        assert_eq!(Frame::status("hi").direction(), Direction::ServerToAgent);
        assert_eq!(Frame::task("a", "b").direction(), Direction::ServerToAgent);
    }
}
