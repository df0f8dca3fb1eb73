//! Agent session loop
//!
//! Owns the outbound connection and cycles through
//!
//! ```text
//! DISCONNECTED ──► CONNECTING ──► CONNECTED ──► DISCONNECTED ──► ...
//!      ▲  (backoff)     │ fail                      │ send / receive failure
//!      └────────────────┴───────────────────────────┘
//! ```
//!
//! While connected two tasks run side by side: the heartbeat ticker (in the
//! loop itself) and the inbound consumer (spawned). Either failing tears the
//! channel down and the loop reconnects after a backoff. Only shutdown or an
//! exhausted attempt cap ends the loop.

use std::sync::Arc;
use std::time::Duration;

use acert_common::config::DEFAULT_HEARTBEAT_INTERVAL;
use acert_common::retry::{Backoff, RetryConfig};
use acert_infra::{CertificateStatus, DEFAULT_RENEWAL_WINDOW};
use acert_proto::Frame;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelReceiver, ClosedError, SendError, SessionChannel};
use crate::connector::Connector;
use crate::executor::{LoggingExecutor, LoggingStatusSink, StatusSink, TaskExecutor};

/// Connection state of the session loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No channel; waiting to (re)connect
    Disconnected,
    /// Handshake and stream establishment in progress
    Connecting,
    /// Stream open, heartbeats flowing
    Connected,
}

/// Errors that end the session loop
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The configured number of consecutive attempts failed
    #[error("gave up after {attempts} consecutive failed attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },
}

/// Tunables for the session loop
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Remaining lifetime below which the certificate is reported as expiring
    pub renewal_window: Duration,
    /// Reconnect backoff and attempt cap
    pub retry: RetryConfig,
    /// How long to wait for the server to finish the stream on shutdown
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            renewal_window: DEFAULT_RENEWAL_WINDOW,
            retry: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            },
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Why a connected period ended
#[derive(Debug)]
enum Disconnect {
    Shutdown,
    Send(SendError),
    Receive(ClosedError),
}

/// The agent session loop
pub struct AgentSession {
    connector: Arc<dyn Connector>,
    executor: Arc<dyn TaskExecutor>,
    status_sink: Arc<dyn StatusSink>,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
}

impl AgentSession {
    /// Create a session loop with logging collaborators
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            connector,
            executor: Arc::new(LoggingExecutor),
            status_sink: Arc::new(LoggingStatusSink),
            config,
            state_tx,
        }
    }

    /// Use `executor` for inbound tasks
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Use `sink` for inbound status messages
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = sink;
        self
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Session state changed");
        }
    }

    /// Run until `shutdown` fires or the attempt cap is reached.
    ///
    /// The first attempt starts immediately. After any failure the loop waits
    /// a jittered exponential backoff; the backoff resets whenever a
    /// connection reaches CONNECTED.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let mut backoff = Backoff::new(self.config.retry.clone());

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.check_certificate();
            self.set_state(SessionState::Connecting);

            let attempt = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(channel) => {
                    backoff.reset();
                    self.set_state(SessionState::Connected);
                    info!(agent = %channel.agent_id(), "Connected to server");

                    match self.drive(channel, &shutdown).await {
                        Disconnect::Shutdown => break,
                        Disconnect::Send(e) => warn!(error = %e, "Heartbeat send failed, reconnecting"),
                        Disconnect::Receive(e) => warn!(error = %e, "Inbound stream closed, reconnecting"),
                    }
                }
                Err(e) => {
                    warn!(attempt = backoff.failures() + 1, error = %e, "Failed to connect to server");
                }
            }

            self.set_state(SessionState::Disconnected);

            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.failures(), "Giving up on server connection");
                return Err(SessionError::RetriesExhausted {
                    attempts: backoff.failures(),
                });
            };

            debug!(delay_ms = delay.as_millis(), "Waiting before reconnect");
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SessionState::Disconnected);
        info!("Agent session stopped");
        Ok(())
    }

    /// Log the health of the identity the next attempt will present
    fn check_certificate(&self) {
        let now = acert_common::unix_now();
        match self.connector.certificate_status(now) {
            Some(CertificateStatus::Valid) | None => {}
            Some(CertificateStatus::ExpiringSoon { remaining }) => {
                warn!(
                    remaining_secs = remaining.as_secs(),
                    "Client certificate expires soon, renewal required"
                );
            }
            Some(CertificateStatus::Expired) => {
                error!("Client certificate has expired, server will refuse the handshake");
            }
            Some(CertificateStatus::NotYetValid) => {
                error!("Client certificate is not yet valid, check the system clock");
            }
        }
    }

    /// Run one connected period
    async fn drive(&self, channel: SessionChannel, shutdown: &CancellationToken) -> Disconnect {
        let (mut sender, receiver) = channel.split();
        let mut inbound = spawn_inbound(
            receiver,
            self.executor.clone(),
            self.status_sink.clone(),
        );

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break Disconnect::Shutdown,
                joined = &mut inbound => {
                    let closed = joined.unwrap_or(ClosedError::EndOfStream);
                    return Disconnect::Receive(closed);
                }
                _ = ticker.tick() => {
                    if let Err(e) = sender.send(Frame::heartbeat(acert_common::unix_now())).await {
                        inbound.abort();
                        return Disconnect::Send(e);
                    }
                }
            }
        };

        // Graceful shutdown: no more heartbeats, end our direction, then give
        // the server a bounded window to finish the inbound stream.
        drop(ticker);
        sender.close();
        match tokio::time::timeout(self.config.shutdown_grace, &mut inbound).await {
            Ok(_) => debug!("Server finished the stream"),
            Err(_) => {
                debug!("Server did not finish the stream within the grace period");
                inbound.abort();
            }
        }
        outcome
    }
}

/// Consume inbound frames until the stream ends
fn spawn_inbound(
    mut receiver: ChannelReceiver,
    executor: Arc<dyn TaskExecutor>,
    status_sink: Arc<dyn StatusSink>,
) -> JoinHandle<ClosedError> {
    tokio::spawn(async move {
        loop {
            match receiver.receive().await {
                Ok(Frame::Task(task)) => {
                    info!(task_id = %task.task_id, command = %task.command, "Task received");
                    executor.execute(&task.task_id, &task.command).await;
                }
                Ok(Frame::Status(status)) => status_sink.status(&status.message),
                Ok(Frame::Heartbeat(_)) => warn!("Ignoring heartbeat frame from server"),
                Err(closed) => return closed,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::channel::{ConnectError, InboundStream};
    use crate::connector::MockConnector;
    use crate::executor::{MockStatusSink, MockTaskExecutor};
    use acert_common::AgentId;
    use acert_proto::{agent_request, AgentRequest, ServerResponse};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    type Inbound = mpsc::Sender<Result<ServerResponse, tonic::Status>>;

    /// Server-side ends of a fake channel
    struct FakeServer {
        requests: mpsc::Receiver<AgentRequest>,
        responses: Inbound,
    }

    impl FakeServer {
        async fn next_heartbeat(&mut self) -> Option<i64> {
            let req = self.requests.recv().await?;
            assert_eq!(req.agent_id, "agent-1");
            match req.payload {
                Some(agent_request::Payload::Heartbeat(hb)) => Some(hb.timestamp),
                None => panic!("heartbeat without payload"),
            }
        }

        async fn push(&self, frame: Frame) {
            self.responses
                .send(Ok(frame.into_response().unwrap()))
                .await
                .unwrap();
        }
    }

    fn fake_channel() -> (SessionChannel, FakeServer) {
        let (req_tx, requests) = mpsc::channel(8);
        let (responses, resp_rx) = mpsc::channel(8);
        let inbound: InboundStream = Box::pin(ReceiverStream::new(resp_rx));
        let channel = SessionChannel::from_parts(AgentId::new("agent-1").unwrap(), req_tx, inbound);
        (channel, FakeServer { requests, responses })
    }

    fn config(max_attempts: u32) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(5),
            renewal_window: Duration::from_secs(3600),
            retry: RetryConfig {
                max_attempts,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
                backoff_multiplier: 2.0,
            },
            shutdown_grace: Duration::from_secs(2),
        }
    }

    /// Connector handing out prepared results in order
    fn scripted_connector(
        results: Vec<Result<SessionChannel, ConnectError>>,
    ) -> (MockConnector, Arc<Mutex<usize>>) {
        let queue = Arc::new(Mutex::new(VecDeque::from(results)));
        let calls = Arc::new(Mutex::new(0usize));
        let calls_seen = calls.clone();

        let mut connector = MockConnector::new();
        connector
            .expect_certificate_status()
            .returning(|_| Some(CertificateStatus::Valid));
        connector.expect_connect().returning(move || {
            *calls.lock().unwrap() += 1;
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ConnectError::Transport("refused".to_string())))
        });
        (connector, calls_seen)
    }

    fn quiet_sink() -> Arc<MockStatusSink> {
        let mut sink = MockStatusSink::new();
        sink.expect_status().returning(|_| ());
        Arc::new(sink)
    }

    async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == want))
            .await
            .expect("state reached in time")
            .expect("session alive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_every_interval() {
        let (channel, mut server) = fake_channel();
        let (connector, _) = scripted_connector(vec![Ok(channel)]);
        let session = Arc::new(
            AgentSession::new(Arc::new(connector), config(0)).with_status_sink(quiet_sink()),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let session = session.clone();
            let shutdown = shutdown.clone();
            async move { session.run(shutdown).await }
        });

        let start = tokio::time::Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..3 {
            stamps.push(server.next_heartbeat().await.unwrap());
        }
        // First heartbeat is immediate, then two intervals
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(session.state(), SessionState::Connected);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_reaches_executor_verbatim() {
        let (channel, mut server) = fake_channel();
        let (connector, _) = scripted_connector(vec![Ok(channel)]);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut executor = MockTaskExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .returning(move |task_id, command| {
                seen_tx
                    .send((task_id.to_string(), command.to_string()))
                    .unwrap();
            });

        let session = AgentSession::new(Arc::new(connector), config(0))
            .with_executor(Arc::new(executor))
            .with_status_sink(quiet_sink());
        let shutdown = CancellationToken::new();
        let run = session.run(shutdown.clone());
        tokio::pin!(run);

        let drive = async {
            server.next_heartbeat().await;
            server.push(Frame::task("t1", "rotate")).await;
            let seen = seen_rx.recv().await.unwrap();
            shutdown.cancel();
            seen
        };

        let (result, seen) = tokio::join!(&mut run, drive);
        assert_eq!(result, Ok(()));
        assert_eq!(seen, ("t1".to_string(), "rotate".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reaches_sink() {
        let (channel, mut server) = fake_channel();
        let (connector, _) = scripted_connector(vec![Ok(channel)]);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut sink = MockStatusSink::new();
        sink.expect_status()
            .withf(|m| m == "session established")
            .times(1)
            .returning(move |m| seen_tx.send(m.to_string()).unwrap());

        let session = AgentSession::new(Arc::new(connector), config(0))
            .with_status_sink(Arc::new(sink));
        let shutdown = CancellationToken::new();

        let drive = async {
            server.next_heartbeat().await;
            server.push(Frame::status("session established")).await;
            let seen = seen_rx.recv().await.unwrap();
            shutdown.cancel();
            seen
        };

        let (result, seen) = tokio::join!(session.run(shutdown.clone()), drive);
        assert_eq!(result, Ok(()));
        assert_eq!(seen, "session established");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_failure_reconnects_with_fresh_channel() {
        let (first, first_server) = fake_channel();
        let (second, mut second_server) = fake_channel();
        let (connector, calls) = scripted_connector(vec![Ok(first), Ok(second)]);

        let session = Arc::new(
            AgentSession::new(Arc::new(connector), config(0)).with_status_sink(quiet_sink()),
        );
        let mut states = session.subscribe();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let session = session.clone();
            let shutdown = shutdown.clone();
            async move { session.run(shutdown).await }
        });

        wait_for_state(&mut states, SessionState::Connected).await;

        // Server drops the first stream
        drop(first_server);
        wait_for_state(&mut states, SessionState::Disconnected).await;

        // Second channel gets heartbeats after the backoff
        assert!(second_server.next_heartbeat().await.is_some());
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(session.state(), SessionState::Connected);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_reconnects() {
        let (first, first_server) = fake_channel();
        let (second, mut second_server) = fake_channel();
        let (connector, calls) = scripted_connector(vec![Ok(first), Ok(second)]);

        // Keep the inbound side open but stop accepting heartbeats
        let FakeServer {
            requests,
            responses: _keep_open,
        } = first_server;
        drop(requests);

        let session = AgentSession::new(Arc::new(connector), config(0))
            .with_status_sink(quiet_sink());
        let shutdown = CancellationToken::new();

        let drive = async {
            assert!(second_server.next_heartbeat().await.is_some());
            shutdown.cancel();
        };
        let (result, ()) = tokio::join!(session.run(shutdown.clone()), drive);

        assert_eq!(result, Ok(()));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap_returns_retries_exhausted() {
        let (connector, calls) = scripted_connector(vec![]);
        let session = AgentSession::new(Arc::new(connector), config(3));

        let start = tokio::time::Instant::now();
        let result = session.run(CancellationToken::new()).await;

        assert_eq!(result, Err(SessionError::RetriesExhausted { attempts: 3 }));
        assert_eq!(*calls.lock().unwrap(), 3);
        // Two backoff waits: ~1s then ~2s, each jittered 0.5x-1.5x
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1500), "{waited:?}");
        assert!(waited <= Duration::from_millis(4500), "{waited:?}");
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_connecting() {
        let (channel, server) = fake_channel();
        let results = vec![
            Err(ConnectError::Transport("down".to_string())),
            Err(ConnectError::Transport("down".to_string())),
            Ok(channel),
        ];
        let (connector, calls) = scripted_connector(results);
        let session = AgentSession::new(Arc::new(connector), config(3))
            .with_status_sink(quiet_sink());

        // Two failures, a connection that drops, then the attempt budget
        // starts over: three more failures are needed to give up.
        drop(server);
        let result = session.run(CancellationToken::new()).await;

        assert_eq!(result, Err(SessionError::RetriesExhausted { attempts: 3 }));
        assert_eq!(*calls.lock().unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_half_closes_and_waits_for_server() {
        let (channel, mut server) = fake_channel();
        let (connector, _) = scripted_connector(vec![Ok(channel)]);
        let session = AgentSession::new(Arc::new(connector), config(0))
            .with_status_sink(quiet_sink());
        let shutdown = CancellationToken::new();

        let drive = async {
            server.next_heartbeat().await;
            shutdown.cancel();
            // Agent ends its direction: no more heartbeats
            assert!(server.requests.recv().await.is_none());
            // Server finishes the inbound stream
            drop(server.responses);
        };

        let start = tokio::time::Instant::now();
        let (result, ()) = tokio::join!(session.run(shutdown.clone()), drive);
        assert_eq!(result, Ok(()));
        // Returned without burning the grace period
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_is_bounded() {
        let (channel, mut server) = fake_channel();
        let (connector, _) = scripted_connector(vec![Ok(channel)]);
        let session = AgentSession::new(Arc::new(connector), config(0))
            .with_status_sink(quiet_sink());
        let shutdown = CancellationToken::new();

        let drive = async {
            server.next_heartbeat().await;
            shutdown.cancel();
            // Never finish the inbound stream
            server
        };

        let start = tokio::time::Instant::now();
        let (result, _server) = tokio::join!(session.run(shutdown.clone()), drive);
        assert_eq!(result, Ok(()));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_stops_promptly() {
        let (connector, calls) = scripted_connector(vec![]);
        let session = AgentSession::new(
            Arc::new(connector),
            SessionConfig {
                retry: RetryConfig {
                    max_attempts: 0,
                    initial_delay: Duration::from_secs(600),
                    max_delay: Duration::from_secs(600),
                    backoff_multiplier: 1.0,
                },
                ..config(0)
            },
        );
        let shutdown = CancellationToken::new();

        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        };
        let start = tokio::time::Instant::now();
        let (result, ()) = tokio::join!(session.run(shutdown.clone()), cancel);

        assert_eq!(result, Ok(()));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_certificate_checked_before_each_attempt() {
        let mut connector = MockConnector::new();
        let mut seq = mockall::Sequence::new();
        for status in [
            CertificateStatus::ExpiringSoon {
                remaining: Duration::from_secs(60),
            },
            CertificateStatus::Expired,
        ] {
            connector
                .expect_certificate_status()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Some(status));
            connector
                .expect_connect()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|| Err(ConnectError::Transport("refused".to_string())));
        }

        let session = AgentSession::new(Arc::new(connector), config(2));
        assert_eq!(
            session.run(CancellationToken::new()).await,
            Err(SessionError::RetriesExhausted { attempts: 2 })
        );
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 0);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
    }
}
