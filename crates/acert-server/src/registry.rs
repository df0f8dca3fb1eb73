//! Session registry
//!
//! Maps each agent identity to its one live [`ServerSession`] and the last
//! heartbeat seen on it. All mutations of an entry happen under the DashMap
//! shard lock for that key, so registration, dispatch and sweep are
//! serialized per agent:
//!
//! - registering a new session closes the one it replaces
//! - dispatch only ever reaches the current session
//! - a late teardown of a superseded stream cannot evict its successor

use std::sync::Arc;
use std::time::Duration;

use acert_common::config::DEFAULT_LIVENESS_TIMEOUT;
use acert_common::AgentId;
use acert_proto::{Frame, ServerTask};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::session::{ServerSession, SessionId, SessionSendError};

/// Status text pushed to an agent when its session is registered
pub const SESSION_ESTABLISHED: &str = "session established";

/// Error delivering a frame to an agent
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No live session for this agent
    #[error("agent {agent} is not connected")]
    NotConnected {
        /// Target agent
        agent: String,
    },

    /// The agent is connected but not draining its queue
    #[error("outbound queue for agent {agent} is full")]
    QueueFull {
        /// Target agent
        agent: String,
    },
}

struct RegistryEntry {
    session: Arc<ServerSession>,
    /// Agent clock, reported back to callers
    last_heartbeat: Option<i64>,
    /// Server clock, used for eviction
    last_received: Option<i64>,
}

impl RegistryEntry {
    /// Server receive time of the last heartbeat; stream accept time before the first one
    fn last_seen(&self) -> i64 {
        self.last_received.unwrap_or(self.session.created_at())
    }
}

/// Registry of live agent sessions
pub struct SessionRegistry {
    entries: DashMap<AgentId, RegistryEntry>,
    liveness_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_TIMEOUT)
    }
}

impl SessionRegistry {
    /// Create an empty registry evicting sessions silent for `liveness_timeout`
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            liveness_timeout,
        }
    }

    /// Liveness timeout applied by [`SessionRegistry::sweep`]
    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Register a session, closing any session it supersedes.
    ///
    /// Returns the id of the superseded session, if any.
    pub fn register(&self, session: Arc<ServerSession>) -> Option<SessionId> {
        let agent = session.agent_id().clone();
        let session_id = session.id();

        if let Err(e) = session.try_send(Frame::status(SESSION_ESTABLISHED)) {
            debug!(agent = %agent, session = session_id, error = %e, "Could not queue welcome status");
        }

        let entry = RegistryEntry {
            session,
            last_heartbeat: None,
            last_received: None,
        };

        match self.entries.entry(agent.clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(entry);
                previous.session.close();
                info!(
                    agent = %agent,
                    session = session_id,
                    superseded = previous.session.id(),
                    "Agent reconnected, previous session closed"
                );
                Some(previous.session.id())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                info!(agent = %agent, session = session_id, "Agent connected");
                None
            }
        }
    }

    /// Remove the entry for `agent` if it still belongs to `session_id`,
    /// closing that session. Returns whether anything was removed.
    pub fn unregister(&self, agent: &str, session_id: SessionId) -> bool {
        match self
            .entries
            .remove_if(agent, |_, entry| entry.session.id() == session_id)
        {
            Some((_, entry)) => {
                entry.session.close();
                info!(agent = %agent, session = session_id, "Agent disconnected");
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat for the current session of `agent`.
    ///
    /// `timestamp` is the agent's clock and `received_at` the server's.
    /// Ignored (returns false) if `session_id` is not the current session.
    /// Neither stored value ever decreases. Only `received_at` counts
    /// towards liveness, so a skewed agent clock cannot cause or dodge
    /// eviction.
    pub fn record_heartbeat(
        &self,
        agent: &str,
        session_id: SessionId,
        timestamp: i64,
        received_at: i64,
    ) -> bool {
        match self.entries.get_mut(agent) {
            Some(mut entry) if entry.session.id() == session_id => {
                entry.last_heartbeat = Some(
                    entry
                        .last_heartbeat
                        .map_or(timestamp, |prev| prev.max(timestamp)),
                );
                entry.last_received = Some(
                    entry
                        .last_received
                        .map_or(received_at, |prev| prev.max(received_at)),
                );
                true
            }
            _ => false,
        }
    }

    /// Push a task to the agent's current session
    pub fn dispatch(&self, agent: &str, task: ServerTask) -> Result<(), DispatchError> {
        let task_id = task.task_id.clone();
        self.send_frame(agent, Frame::Task(task))?;
        debug!(agent = %agent, task_id = %task_id, "Task dispatched");
        Ok(())
    }

    /// Push a status message to the agent's current session
    pub fn notify(&self, agent: &str, message: impl Into<String>) -> Result<(), DispatchError> {
        self.send_frame(agent, Frame::status(message))
    }

    fn send_frame(&self, agent: &str, frame: Frame) -> Result<(), DispatchError> {
        let result = match self.entries.get(agent) {
            Some(entry) => entry.session.try_send(frame),
            None => {
                return Err(DispatchError::NotConnected {
                    agent: agent.to_string(),
                })
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(SessionSendError::Full(_)) => Err(DispatchError::QueueFull {
                agent: agent.to_string(),
            }),
            Err(SessionSendError::Closed(session_id)) => {
                self.unregister(agent, session_id);
                Err(DispatchError::NotConnected {
                    agent: agent.to_string(),
                })
            }
            Err(SessionSendError::Frame(e)) => {
                // Only server-to-agent frames are built above
                warn!(agent = %agent, error = %e, "Refusing to send frame");
                Err(DispatchError::NotConnected {
                    agent: agent.to_string(),
                })
            }
        }
    }

    /// Evict and close every session whose last heartbeat arrived before
    /// `now - liveness_timeout` on the server clock. Returns the evicted agents.
    pub fn sweep(&self, now: i64) -> Vec<AgentId> {
        let cutoff = now.saturating_sub(self.liveness_timeout.as_secs() as i64);
        let mut evicted = Vec::new();

        self.entries.retain(|agent, entry| {
            if entry.last_seen() < cutoff {
                entry.session.close();
                evicted.push(agent.clone());
                false
            } else {
                true
            }
        });

        for agent in &evicted {
            warn!(agent = %agent, timeout_secs = self.liveness_timeout.as_secs(), "Agent missed heartbeats, session evicted");
        }
        evicted
    }

    /// Close and remove every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        self.entries.retain(|_, entry| {
            entry.session.close();
            closed += 1;
            false
        });
        closed
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no agent is connected
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `agent` has a live session
    pub fn is_connected(&self, agent: &str) -> bool {
        self.entries.contains_key(agent)
    }

    /// Connected agents, sorted
    pub fn list_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.entries.iter().map(|e| e.key().clone()).collect();
        agents.sort();
        agents
    }

    /// Last heartbeat timestamp recorded for `agent`
    pub fn last_heartbeat(&self, agent: &str) -> Option<i64> {
        self.entries.get(agent).and_then(|e| e.last_heartbeat)
    }

    /// Id of the current session for `agent`
    pub fn session_id(&self, agent: &str) -> Option<SessionId> {
        self.entries.get(agent).map(|e| e.session.id())
    }
}

/// Wrap registry in Arc for sharing across tasks
pub type SharedSessionRegistry = Arc<SessionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use acert_proto::server_response::Payload;
    use tokio::sync::mpsc;

    fn new_session(name: &str) -> (Arc<ServerSession>, mpsc::Receiver<Outbound>) {
        let (session, rx) = ServerSession::new(AgentId::new(name).unwrap(), 16);
        (Arc::new(session), rx)
    }

    fn registry(liveness_secs: u64) -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(liveness_secs))
    }

    fn next_payload(rx: &mut mpsc::Receiver<Outbound>) -> Option<Payload> {
        rx.try_recv().ok().and_then(|r| r.ok()).and_then(|r| r.payload)
    }

    #[test]
    fn test_register_sends_welcome_status() {
        let registry = registry(20);
        let (session, mut rx) = new_session("agent-1");

        assert_eq!(registry.register(session), None);
        assert!(registry.is_connected("agent-1"));
        assert_eq!(registry.len(), 1);
        match next_payload(&mut rx) {
            Some(Payload::Status(status)) => assert_eq!(status.message, SESSION_ESTABLISHED),
            other => panic!("expected welcome status, got {:?}", other),
        }
    }

    #[test]
    fn test_register_supersedes_and_closes_previous() {
        let registry = registry(20);
        let (first, _rx1) = new_session("agent-1");
        let (second, mut rx2) = new_session("agent-1");
        let first_id = first.id();

        registry.register(first.clone());
        assert_eq!(registry.register(second.clone()), Some(first_id));

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.session_id("agent-1"), Some(second.id()));

        registry
            .dispatch("agent-1", ServerTask::new("t1", "rotate"))
            .unwrap();
        let _welcome = next_payload(&mut rx2);
        assert!(matches!(next_payload(&mut rx2), Some(Payload::Task(_))));
    }

    #[test]
    fn test_stale_unregister_keeps_successor() {
        let registry = registry(20);
        let (first, _rx1) = new_session("agent-1");
        let (second, _rx2) = new_session("agent-1");
        let first_id = first.id();

        registry.register(first);
        registry.register(second.clone());

        assert!(!registry.unregister("agent-1", first_id));
        assert!(registry.is_connected("agent-1"));
        assert!(registry.unregister("agent-1", second.id()));
        assert!(!registry.is_connected("agent-1"));
        assert!(second.is_closed());
    }

    #[test]
    fn test_dispatch_unknown_agent_is_not_connected() {
        let registry = registry(20);
        assert_eq!(
            registry.dispatch("ghost", ServerTask::new("t1", "renew")),
            Err(DispatchError::NotConnected {
                agent: "ghost".to_string()
            })
        );
    }

    #[test]
    fn test_dispatch_to_dropped_stream_removes_entry() {
        let registry = registry(20);
        let (session, rx) = new_session("agent-1");
        registry.register(session);
        drop(rx);

        assert!(matches!(
            registry.dispatch("agent-1", ServerTask::new("t1", "renew")),
            Err(DispatchError::NotConnected { .. })
        ));
        assert!(!registry.is_connected("agent-1"));
    }

    #[test]
    fn test_dispatch_arrives_verbatim() {
        let registry = registry(20);
        let (session, mut rx) = new_session("agent-1");
        registry.register(session);
        let _welcome = next_payload(&mut rx);

        registry
            .dispatch("agent-1", ServerTask::new("t1", "rotate"))
            .unwrap();
        assert_eq!(
            next_payload(&mut rx),
            Some(Payload::Task(ServerTask::new("t1", "rotate")))
        );
    }

    #[test]
    fn test_notify_pushes_status() {
        let registry = registry(20);
        let (session, mut rx) = new_session("agent-1");
        registry.register(session);
        let _welcome = next_payload(&mut rx);

        registry.notify("agent-1", "renewal scheduled").unwrap();
        match next_payload(&mut rx) {
            Some(Payload::Status(status)) => assert_eq!(status.message, "renewal scheduled"),
            other => panic!("expected status, got {:?}", other),
        }
        assert!(registry.notify("ghost", "hi").is_err());
    }

    #[test]
    fn test_heartbeat_is_monotonic() {
        let registry = registry(20);
        let (session, _rx) = new_session("agent-1");
        let id = session.id();
        registry.register(session);

        assert_eq!(registry.last_heartbeat("agent-1"), None);
        assert!(registry.record_heartbeat("agent-1", id, 1010, 1010));
        assert!(registry.record_heartbeat("agent-1", id, 1005, 1011));
        assert_eq!(registry.last_heartbeat("agent-1"), Some(1010));
        assert!(registry.record_heartbeat("agent-1", id, 1020, 1020));
        assert_eq!(registry.last_heartbeat("agent-1"), Some(1020));
    }

    #[test]
    fn test_heartbeat_for_superseded_session_ignored() {
        let registry = registry(20);
        let (old, _rx1) = new_session("agent-1");
        let (new, _rx2) = new_session("agent-1");
        let old_id = old.id();
        let new_id = new.id();
        registry.register(old);
        registry.register(new);

        assert!(!registry.record_heartbeat("agent-1", old_id, 5000, 5000));
        assert_eq!(registry.last_heartbeat("agent-1"), None);
        assert!(registry.record_heartbeat("agent-1", new_id, 100, 100));
        assert_eq!(registry.last_heartbeat("agent-1"), Some(100));
        assert!(!registry.record_heartbeat("ghost", new_id, 100, 100));
    }

    #[test]
    fn test_three_heartbeats_then_timeout() {
        let registry = registry(20);
        let (session, _rx) = new_session("agent-1");
        let id = session.id();
        registry.register(session.clone());

        for ts in [1000, 1005, 1010] {
            registry.record_heartbeat("agent-1", id, ts, ts);
            assert_eq!(registry.last_heartbeat("agent-1"), Some(ts));
        }

        // 16s since the last heartbeat: still live
        assert!(registry.sweep(1026).is_empty());
        // Exactly at the boundary: not older than now - L
        assert!(registry.sweep(1030).is_empty());
        // 21s since the last heartbeat: evicted
        let evicted = registry.sweep(1031);
        assert_eq!(evicted, vec![AgentId::new("agent-1").unwrap()]);
        assert!(session.is_closed());
        assert!(matches!(
            registry.dispatch("agent-1", ServerTask::new("t1", "renew")),
            Err(DispatchError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_sweep_only_evicts_stale_agents() {
        let registry = registry(20);
        let (a, _ra) = new_session("agent-a");
        let (b, _rb) = new_session("agent-b");
        let (a_id, b_id) = (a.id(), b.id());
        registry.register(a);
        registry.register(b);

        registry.record_heartbeat("agent-a", a_id, 1000, 1000);
        registry.record_heartbeat("agent-b", b_id, 1015, 1015);

        let evicted = registry.sweep(1030);
        assert_eq!(evicted, vec![AgentId::new("agent-a").unwrap()]);
        assert_eq!(registry.list_agents(), vec![AgentId::new("agent-b").unwrap()]);
    }

    #[test]
    fn test_sweep_uses_registration_time_before_first_heartbeat() {
        let registry = registry(20);
        let (session, _rx) = new_session("agent-1");
        let created = session.created_at();
        registry.register(session);

        assert!(registry.sweep(created + 20).is_empty());
        assert_eq!(registry.sweep(created + 21).len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_agent_clock_behind_is_not_evicted() {
        let registry = registry(20);
        let (session, _rx) = new_session("agent-1");
        let id = session.id();
        registry.register(session.clone());

        let now = 1_000_000;
        registry.record_heartbeat("agent-1", id, now - 30, now);

        assert_eq!(registry.last_heartbeat("agent-1"), Some(now - 30));
        assert!(registry.sweep(now).is_empty());
        assert!(registry.sweep(now + 20).is_empty());
        assert!(!session.is_closed());
    }

    #[test]
    fn test_agent_clock_ahead_is_still_evicted() {
        let registry = registry(20);
        let (session, _rx) = new_session("agent-1");
        let id = session.id();
        registry.register(session.clone());

        let now = 1_000_000;
        registry.record_heartbeat("agent-1", id, i64::MAX, now);

        assert_eq!(registry.last_heartbeat("agent-1"), Some(i64::MAX));
        let a_year_later = now + 365 * 24 * 3600;
        assert_eq!(
            registry.sweep(a_year_later),
            vec![AgentId::new("agent-1").unwrap()]
        );
        assert!(session.is_closed());
    }

    #[test]
    fn test_close_all_empties_registry() {
        let registry = registry(20);
        let (a, _ra) = new_session("agent-a");
        let (b, _rb) = new_session("agent-b");
        registry.register(a.clone());
        registry.register(b.clone());

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }

    #[test]
    fn test_concurrent_registration_leaves_one_live_session() {
        let registry = Arc::new(registry(20));
        let mut sessions = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..16 {
            let (s, rx) = new_session("agent-1");
            sessions.push(s);
            receivers.push(rx);
        }

        std::thread::scope(|scope| {
            for s in &sessions {
                let registry = registry.clone();
                let s = s.clone();
                scope.spawn(move || {
                    registry.register(s);
                });
            }
        });

        let live: Vec<_> = sessions.iter().filter(|s| !s.is_closed()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(registry.session_id("agent-1"), Some(live[0].id()));
    }
}
