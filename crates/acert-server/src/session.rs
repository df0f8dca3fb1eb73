//! Server side of one agent stream
//!
//! A [`ServerSession`] wraps the outbound half of a single `Poll` stream.
//! Frames are queued with [`ServerSession::try_send`] and drained by tonic
//! into the response stream. The response stream ends once every handle to
//! the session is dropped, after the queued frames have been delivered.

use std::sync::atomic::{AtomicU64, Ordering};

use acert_common::AgentId;
use acert_proto::{Frame, FrameError, ServerResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::debug;

/// Outbound queue depth per session
pub const OUTBOUND_CAPACITY: usize = 32;

/// Item type of the outbound response stream
pub type Outbound = Result<ServerResponse, Status>;

/// Process-unique identifier of a session
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Errors queueing a frame on a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionSendError {
    /// Session was closed or the agent went away
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// Outbound queue is full
    #[error("session {0} outbound queue is full")]
    Full(SessionId),

    /// Frame cannot travel server to agent
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One live stream to one agent
#[derive(Debug)]
pub struct ServerSession {
    id: SessionId,
    agent_id: AgentId,
    created_at: i64,
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl ServerSession {
    /// Create a session and the receiver tonic drains into the response stream
    pub fn new(agent_id: AgentId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            agent_id,
            created_at: acert_common::unix_now(),
            outbound,
            closed: CancellationToken::new(),
        };
        (session, rx)
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Agent that owns this session
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Unix seconds at which the stream was accepted
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, frame: Frame) -> Result<(), SessionSendError> {
        if self.is_closed() {
            return Err(SessionSendError::Closed(self.id));
        }
        let response = frame.into_response()?;
        self.outbound.try_send(Ok(response)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionSendError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => SessionSendError::Closed(self.id),
        })
    }

    /// Queue a terminal RPC status for the agent
    pub fn reject(&self, status: Status) {
        if self.outbound.try_send(Err(status)).is_err() {
            debug!(agent = %self.agent_id, session = self.id, "Could not queue rejection");
        }
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(agent = %self.agent_id, session = self.id, "Closing session");
            self.closed.cancel();
        }
    }

    /// Whether the session was closed or the agent dropped the stream
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves once [`ServerSession::close`] is called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
