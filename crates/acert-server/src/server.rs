//! gRPC server for agent sessions
//!
//! Accepts `Poll` streams from agents over mutual TLS.
//!
//! # mTLS Security
//!
//! The server requires client certificates signed by the trusted root. The
//! agent identity is the CN of the presented leaf; every inbound frame must
//! carry that same identity or the stream is closed with `PermissionDenied`.
//!
//! # Stream lifecycle
//!
//! ```text
//! open stream ─► first heartbeat ─► register ─► heartbeats ... ─► end / error / close
//!                                   (supersedes                    └► unregister
//!                                    older session)
//! ```

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use acert_common::AgentId;
use acert_infra::{extract_agent_id_from_cert, ServerMtlsConfig};
use acert_proto::agent_request::Payload;
use acert_proto::agent_service_server::{AgentService, AgentServiceServer};
use acert_proto::{AgentRequest, ServerResponse};
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument, warn};

use crate::registry::SharedSessionRegistry;
use crate::session::{ServerSession, OUTBOUND_CAPACITY};
use crate::ServerError;

/// gRPC server for agent communication
#[derive(Clone)]
pub struct AgentServer {
    registry: SharedSessionRegistry,
}

/// Response stream type of the `Poll` RPC
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ServerResponse, Status>> + Send + 'static>>;

impl AgentServer {
    /// Create a new agent server backed by `registry`
    pub fn new(registry: SharedSessionRegistry) -> Self {
        Self { registry }
    }

    /// Registry this server registers sessions into
    pub fn registry(&self) -> &SharedSessionRegistry {
        &self.registry
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> AgentServiceServer<Self> {
        AgentServiceServer::new(self)
    }

    /// Start a session for an already authenticated agent.
    ///
    /// Spawns the inbound task and returns the outbound response stream.
    pub fn open_session<S>(&self, agent_id: AgentId, inbound: S) -> ResponseStream
    where
        S: Stream<Item = Result<AgentRequest, Status>> + Send + Unpin + 'static,
    {
        let (session, outbound_rx) = ServerSession::new(agent_id, OUTBOUND_CAPACITY);
        let session = Arc::new(session);
        debug!(agent = %session.agent_id(), session = session.id(), "Session opened");

        tokio::spawn(drive_session(self.registry.clone(), session, inbound));

        Box::pin(ReceiverStream::new(outbound_rx))
    }

    /// Serve on `listener` with mTLS until `shutdown` fires.
    ///
    /// On shutdown every live session is closed so that open streams end and
    /// the transport can drain.
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        mtls_config: &ServerMtlsConfig,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let registry = self.registry.clone();
        let signal = async move {
            shutdown.cancelled().await;
            let closed = registry.close_all();
            info!(sessions = closed, "Shutting down gRPC server");
        };

        Server::builder()
            .tls_config(mtls_config.to_tonic_config())?
            .add_service(self.into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await?;

        Ok(())
    }

    /// Bind `addr` and serve with mTLS until `shutdown` fires
    pub async fn serve_with_mtls(
        self,
        addr: SocketAddr,
        mtls_config: &ServerMtlsConfig,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(%addr, "Starting gRPC server with mTLS");
        self.serve_with_listener(listener, mtls_config, shutdown)
            .await
    }
}

/// Agent identity from the peer's leaf certificate
fn peer_agent_id<T>(request: &Request<T>) -> Result<AgentId, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("client certificate required"))?;
    let leaf = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("client certificate required"))?;
    let der: &[u8] = leaf.as_ref();
    extract_agent_id_from_cert(der).map_err(|e| Status::unauthenticated(e.to_string()))
}

/// Consume inbound frames for one session until the agent goes away, the
/// stream errors, or the session is closed by the registry.
///
/// A stream that has not sent its first heartbeat within the liveness
/// timeout is ended with `DeadlineExceeded`.
async fn drive_session<S>(registry: SharedSessionRegistry, session: Arc<ServerSession>, mut inbound: S)
where
    S: Stream<Item = Result<AgentRequest, Status>> + Unpin,
{
    let agent = session.agent_id().clone();
    let mut registered = false;
    let registration_deadline = tokio::time::sleep(registry.liveness_timeout());
    tokio::pin!(registration_deadline);

    loop {
        let next = tokio::select! {
            () = session.closed() => {
                debug!(agent = %agent, session = session.id(), "Session closed by server");
                break;
            }
            () = &mut registration_deadline, if !registered => {
                warn!(
                    agent = %agent,
                    session = session.id(),
                    timeout_secs = registry.liveness_timeout().as_secs(),
                    "No heartbeat before registration deadline, closing stream"
                );
                session.reject(Status::deadline_exceeded("no heartbeat received"));
                break;
            }
            next = inbound.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(status)) => {
                warn!(agent = %agent, error = %status, "Error receiving agent frame");
                break;
            }
            None => {
                debug!(agent = %agent, session = session.id(), "Agent closed stream");
                break;
            }
        };

        if msg.agent_id != agent.as_str() {
            warn!(
                agent = %agent,
                claimed = %msg.agent_id,
                "Frame agent_id does not match client certificate"
            );
            session.reject(Status::permission_denied(format!(
                "agent_id '{}' does not match client certificate",
                msg.agent_id
            )));
            break;
        }

        match msg.payload {
            Some(Payload::Heartbeat(hb)) => {
                if !registered {
                    registry.register(session.clone());
                    registered = true;
                }
                let received_at = acert_common::unix_now();
                if !registry.record_heartbeat(agent.as_str(), session.id(), hb.timestamp, received_at) {
                    debug!(agent = %agent, session = session.id(), "Heartbeat for a session no longer registered");
                }
            }
            None => {
                warn!(agent = %agent, "Received frame with no payload");
            }
        }
    }

    if registered {
        registry.unregister(agent.as_str(), session.id());
    }
}

#[tonic::async_trait]
impl AgentService for AgentServer {
    type PollStream = ResponseStream;

    #[instrument(skip(self, request))]
    async fn poll(
        &self,
        request: Request<Streaming<AgentRequest>>,
    ) -> Result<Response<Self::PollStream>, Status> {
        let agent_id = peer_agent_id(&request)?;
        let remote_addr = request.remote_addr();
        info!(agent = %agent_id, ?remote_addr, "New agent stream");

        Ok(Response::new(
            self.open_session(agent_id, request.into_inner()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::{SessionRegistry, SESSION_ESTABLISHED};
    use acert_proto::{Frame, ServerTask};
    use tokio::sync::mpsc;
    use tonic::Code;

    struct TestStream {
        tx: mpsc::Sender<Result<AgentRequest, Status>>,
        responses: ResponseStream,
    }

    impl TestStream {
        async fn heartbeat(&self, agent: &str, ts: i64) {
            let req = Frame::heartbeat(ts).into_request(agent).unwrap();
            self.tx.send(Ok(req)).await.unwrap();
        }

        async fn next(&mut self) -> Option<Result<ServerResponse, Status>> {
            tokio::time::timeout(Duration::from_secs(5), self.responses.next())
                .await
                .expect("response within timeout")
        }

        async fn next_frame(&mut self) -> Frame {
            let resp = self.next().await.expect("stream open").expect("ok frame");
            Frame::try_from(resp).expect("payload present")
        }
    }

    fn setup() -> (AgentServer, SharedSessionRegistry) {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(20)));
        (AgentServer::new(registry.clone()), registry)
    }

    fn open(server: &AgentServer, agent: &str) -> TestStream {
        let (tx, rx) = mpsc::channel(8);
        let responses = server.open_session(AgentId::new(agent).unwrap(), ReceiverStream::new(rx));
        TestStream { tx, responses }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_first_heartbeat_registers_session() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");

        stream.heartbeat("agent-1", 1000).await;
        assert_eq!(stream.next_frame().await, Frame::status(SESSION_ESTABLISHED));
        wait_until(|| registry.last_heartbeat("agent-1") == Some(1000)).await;

        stream.heartbeat("agent-1", 1005).await;
        wait_until(|| registry.last_heartbeat("agent-1") == Some(1005)).await;
    }

    #[tokio::test]
    async fn test_dispatch_reaches_stream() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");
        stream.heartbeat("agent-1", 1000).await;
        let _welcome = stream.next_frame().await;

        registry
            .dispatch("agent-1", ServerTask::new("t1", "rotate"))
            .unwrap();
        assert_eq!(stream.next_frame().await, Frame::task("t1", "rotate"));
    }

    #[tokio::test]
    async fn test_mismatched_agent_id_is_permission_denied() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");

        stream.heartbeat("agent-2", 1000).await;
        let err = stream.next().await.expect("error item").unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert!(stream.next().await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_payloadless_frame_is_ignored() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");

        stream
            .tx
            .send(Ok(AgentRequest {
                agent_id: "agent-1".to_string(),
                payload: None,
            }))
            .await
            .unwrap();
        stream.heartbeat("agent-1", 1000).await;

        assert_eq!(stream.next_frame().await, Frame::status(SESSION_ESTABLISHED));
        wait_until(|| registry.last_heartbeat("agent-1") == Some(1000)).await;
    }

    #[tokio::test]
    async fn test_agent_hangup_unregisters() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");
        stream.heartbeat("agent-1", 1000).await;
        let _welcome = stream.next_frame().await;
        wait_until(|| registry.is_connected("agent-1")).await;

        drop(stream.tx);
        assert!(stream.responses.next().await.is_none());
        wait_until(|| !registry.is_connected("agent-1")).await;
    }

    #[tokio::test]
    async fn test_reconnect_ends_previous_stream() {
        let (server, registry) = setup();
        let mut old = open(&server, "agent-1");
        old.heartbeat("agent-1", 1000).await;
        let _welcome = old.next_frame().await;

        let mut new = open(&server, "agent-1");
        new.heartbeat("agent-1", 1001).await;
        let _welcome = new.next_frame().await;

        // Old response stream finishes once its session is superseded
        assert!(old.next().await.is_none());
        let new_id = registry.session_id("agent-1");
        assert!(new_id.is_some());

        registry
            .dispatch("agent-1", ServerTask::new("t2", "renew"))
            .unwrap();
        assert_eq!(new.next_frame().await, Frame::task("t2", "renew"));
        assert_eq!(registry.session_id("agent-1"), new_id);
    }

    #[tokio::test]
    async fn test_eviction_ends_stream() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");
        stream.heartbeat("agent-1", 1000).await;
        let _welcome = stream.next_frame().await;
        wait_until(|| registry.last_heartbeat("agent-1") == Some(1000)).await;

        assert_eq!(registry.sweep(acert_common::unix_now() + 21).len(), 1);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_closed_at_registration_deadline() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");
        let started = tokio::time::Instant::now();

        let err = stream.responses.next().await.expect("error item").unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(started.elapsed() >= registry.liveness_timeout());
        assert!(stream.responses.next().await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_stream_outlives_registration_deadline() {
        let (server, registry) = setup();
        let mut stream = open(&server, "agent-1");
        stream.heartbeat("agent-1", 1000).await;
        assert_eq!(stream.next_frame().await, Frame::status(SESSION_ESTABLISHED));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.is_connected("agent-1"));
        registry.notify("agent-1", "still here").unwrap();
        assert_eq!(stream.next_frame().await, Frame::status("still here"));
    }

    #[test]
    fn test_missing_peer_certificate_is_unauthenticated() {
        let err = peer_agent_id(&Request::new(())).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }
}
