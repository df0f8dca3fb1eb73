//! Agent side of a session stream
//!
//! A [`SessionChannel`] is one live `Poll` stream. It is split into an owned
//! [`ChannelSender`] and [`ChannelReceiver`] so the heartbeat loop and the
//! inbound loop can use the two directions concurrently. A channel is never
//! reused: every connection attempt opens a fresh one.

use std::pin::Pin;
use std::time::Duration;

use acert_common::AgentId;
use acert_infra::ClientMtlsConfig;
use acert_proto::agent_service_client::AgentServiceClient;
use acert_proto::{AgentRequest, Frame, FrameError, ServerResponse};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};

/// Outbound queue depth
pub const OUTBOUND_CAPACITY: usize = 32;

/// Inbound stream of server responses
pub type InboundStream =
    Pin<Box<dyn Stream<Item = Result<ServerResponse, tonic::Status>> + Send + 'static>>;

/// Failure opening a channel
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Server address is not a valid URI
    #[error("invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint {
        /// Configured endpoint
        endpoint: String,
        /// Parser message
        message: String,
    },

    /// Local identity could not be loaded for this attempt
    #[error("identity unavailable: {0}")]
    Identity(String),

    /// Dial or TLS handshake failed
    #[error("connection failed: {0}")]
    Transport(String),

    /// Server refused the stream
    #[error("stream rejected: {0}")]
    Rejected(tonic::Status),
}

/// Failure sending a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Send direction was closed locally or the stream is gone
    #[error("channel closed")]
    Closed,

    /// Frame cannot travel agent to server
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Inbound direction ended
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClosedError {
    /// Server finished the stream
    #[error("stream ended by server")]
    EndOfStream,

    /// Stream ended with an RPC status
    #[error("stream failed: {code:?}: {message}")]
    Status {
        /// gRPC status code
        code: tonic::Code,
        /// Status message
        message: String,
    },
}

impl From<tonic::Status> for ClosedError {
    fn from(status: tonic::Status) -> Self {
        ClosedError::Status {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// One live, authenticated stream to the server
pub struct SessionChannel {
    agent_id: AgentId,
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

impl SessionChannel {
    /// Dial `endpoint` with mTLS and open the `Poll` stream.
    ///
    /// The agent identity is the CN of the client certificate in `tls`.
    pub async fn open(
        endpoint: &str,
        tls: &ClientMtlsConfig,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let agent_id = tls
            .identity()
            .agent_id()
            .map_err(|e| ConnectError::Identity(e.to_string()))?;

        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| ConnectError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?
            .connect_timeout(connect_timeout)
            .keep_alive_timeout(Duration::from_secs(20))
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .tls_config(tls.to_tonic_config())
            .map_err(|e| ConnectError::Transport(e.to_string()))?
            .connect()
            .await
            .map_err(|e| ConnectError::Transport(transport_error_chain(&e)))?;

        let mut client = AgentServiceClient::new(channel);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let response = client
            .poll(ReceiverStream::new(rx))
            .await
            .map_err(ConnectError::Rejected)?;

        info!(%endpoint, agent = %agent_id, "Session stream opened");
        Ok(Self::from_parts(
            agent_id,
            tx,
            Box::pin(response.into_inner()),
        ))
    }

    /// Assemble a channel from an outbound queue and an inbound stream
    pub fn from_parts(
        agent_id: AgentId,
        outbound: mpsc::Sender<AgentRequest>,
        inbound: InboundStream,
    ) -> Self {
        Self {
            sender: ChannelSender {
                agent_id: agent_id.clone(),
                tx: Some(outbound),
            },
            receiver: ChannelReceiver {
                inbound,
                finished: false,
            },
            agent_id,
        }
    }

    /// Agent this channel belongs to
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Send half of a [`SessionChannel`]
pub struct ChannelSender {
    agent_id: AgentId,
    tx: Option<mpsc::Sender<AgentRequest>>,
}

impl ChannelSender {
    /// Send a frame, waiting for queue capacity
    pub async fn send(&self, frame: Frame) -> Result<(), SendError> {
        let tx = self.tx.as_ref().ok_or(SendError::Closed)?;
        let request = frame.into_request(self.agent_id.as_str())?;
        tx.send(request).await.map_err(|_| SendError::Closed)
    }

    /// Half-close: end the outbound stream. Idempotent.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!(agent = %self.agent_id, "Send direction closed");
        }
    }

    /// Whether the send direction is closed
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Receive half of a [`SessionChannel`]
pub struct ChannelReceiver {
    inbound: InboundStream,
    finished: bool,
}

impl ChannelReceiver {
    /// Next frame from the server.
    ///
    /// Frames without a payload are skipped. Once an error is returned every
    /// later call returns [`ClosedError::EndOfStream`].
    pub async fn receive(&mut self) -> Result<Frame, ClosedError> {
        loop {
            if self.finished {
                return Err(ClosedError::EndOfStream);
            }
            match self.inbound.next().await {
                Some(Ok(response)) => match Frame::try_from(response) {
                    Ok(frame) => return Ok(frame),
                    Err(_) => warn!("Received server frame with no payload"),
                },
                Some(Err(status)) => {
                    self.finished = true;
                    return Err(status.into());
                }
                None => {
                    self.finished = true;
                    return Err(ClosedError::EndOfStream);
                }
            }
        }
    }
}

/// Flatten a transport error and its sources into one line
fn transport_error_chain(err: &tonic::transport::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
