//! Live session bookkeeping.
//!
//! The registry is owned by the [`Hub`](crate::server::Hub) and only ever
//! touched under the hub lock, so it needs no interior locking of its own.
//! Every entry is `Open`, and the entries are exactly the broadcast
//! audience: each one holds its session's [`Outbox`]. A session leaves the
//! registry in the same step that tears its connection down.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::broadcast::{Frame, Outbox};
use crate::error::SessionError;
use crate::identity::Identity;

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    Open,
    Closed,
}

/// Server-side record of one client connection.
#[derive(Debug)]
pub struct ClientSession {
    pub session_id: Uuid,
    pub identity: Identity,
    pub state: LifecycleState,
    pub connected_at: Instant,
    /// Dropped on close, which ends the session's subscriber stream
    outbox: Option<Outbox>,
}

impl ClientSession {
    /// A new session in the `Connecting` state.
    pub fn new(identity: Identity, outbox: Outbox) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            identity,
            state: LifecycleState::Connecting,
            connected_at: Instant::now(),
            outbox: Some(outbox),
        }
    }

    /// `Connecting -> Open`. No effect on a closed session.
    pub fn open(&mut self) {
        if self.state == LifecycleState::Connecting {
            self.state = LifecycleState::Open;
        }
    }

    pub fn close(&mut self) {
        self.state = LifecycleState::Closed;
        self.outbox = None;
    }

    pub fn is_open(&self) -> bool {
        self.state == LifecycleState::Open
    }

    pub fn token(&self) -> &str {
        &self.identity.token
    }

    /// Time since the connection was accepted.
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue a frame for this session. `false` if closed or nobody is reading.
    pub fn deliver(&self, frame: Frame) -> bool {
        self.is_open() && self.outbox.as_ref().is_some_and(|outbox| outbox.push(frame))
    }
}

/// The set of open sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, ClientSession>,
    /// Maximum concurrent sessions (None = unbounded)
    capacity: Option<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that refuses sessions beyond `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: HashMap::with_capacity(capacity.min(1024)),
            capacity: Some(capacity),
        }
    }

    /// Add an open session. It becomes a broadcast target from now on.
    pub fn register(&mut self, session: ClientSession) -> Result<(), SessionError> {
        if !session.is_open() {
            return Err(SessionError::NotOpen(session.session_id));
        }
        if let Some(capacity) = self.capacity {
            if self.sessions.len() >= capacity {
                return Err(SessionError::Full { capacity });
            }
        }
        self.sessions.insert(session.session_id, session);
        Ok(())
    }

    /// Remove a session, returning it marked `Closed`.
    ///
    /// Removing an absent session is a no-op: a close frame and a socket
    /// error for the same connection may both end up here.
    pub fn deregister(&mut self, session_id: &Uuid) -> Option<ClientSession> {
        let mut session = self.sessions.remove(session_id)?;
        session.close();
        Some(session)
    }

    /// Visit every open session.
    pub fn for_each<'a>(&'a self, mut f: impl FnMut(&'a ClientSession)) {
        self.sessions
            .values()
            .filter(|session| session.is_open())
            .for_each(|session| f(session));
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&ClientSession> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &Uuid) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// All open sessions.
    pub fn sessions(&self) -> Vec<&ClientSession> {
        let mut out = Vec::with_capacity(self.sessions.len());
        self.for_each(|session| out.push(session));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastGroup, Subscriber};

    fn new_session(token: &str) -> (ClientSession, Subscriber) {
        let (outbox, subscriber) = BroadcastGroup::new(4).channel();
        (ClientSession::new(Identity::new(token), outbox), subscriber)
    }

    fn open_session(token: &str) -> ClientSession {
        let (mut session, _) = new_session(token);
        session.open();
        session
    }

    #[test]
    fn test_session_lifecycle() {
        let (mut session, _rx) = new_session("alice");
        assert_eq!(session.state, LifecycleState::Connecting);
        session.open();
        assert!(session.is_open());
        session.close();
        assert_eq!(session.state, LifecycleState::Closed);

        // Closed is terminal
        session.open();
        assert_eq!(session.state, LifecycleState::Closed);
    }

    #[test]
    fn test_register_and_deregister() {
        let mut registry = SessionRegistry::new();
        let session = open_session("alice");
        let id = session.session_id;

        registry.register(session).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().token(), "alice");

        let removed = registry.deregister(&id).unwrap();
        assert_eq!(removed.state, LifecycleState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let mut registry = SessionRegistry::new();
        let a = open_session("alice");
        let b = open_session("bob");
        let a_id = a.session_id;
        let b_id = b.session_id;
        registry.register(a).unwrap();
        registry.register(b).unwrap();

        assert!(registry.deregister(&a_id).is_some());
        let after_once: Vec<Uuid> = registry.sessions().iter().map(|s| s.session_id).collect();

        assert!(registry.deregister(&a_id).is_none());
        let after_twice: Vec<Uuid> = registry.sessions().iter().map(|s| s.session_id).collect();

        assert_eq!(after_once, after_twice);
        assert_eq!(after_twice, vec![b_id]);
    }

    #[test]
    fn test_register_requires_open() {
        let mut registry = SessionRegistry::new();
        let (session, _rx) = new_session("alice");
        let id = session.session_id;
        assert_eq!(registry.register(session), Err(SessionError::NotOpen(id)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let mut registry = SessionRegistry::with_capacity(2);
        registry.register(open_session("a")).unwrap();
        registry.register(open_session("b")).unwrap();
        assert_eq!(
            registry.register(open_session("c")),
            Err(SessionError::Full { capacity: 2 })
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), Some(2));
    }

    #[test]
    fn test_duplicate_tokens_allowed() {
        let mut registry = SessionRegistry::new();
        registry.register(open_session("alice")).unwrap();
        registry.register(open_session("alice")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_for_each_visits_all_open() {
        let mut registry = SessionRegistry::new();
        for token in ["a", "b", "c"] {
            registry.register(open_session(token)).unwrap();
        }
        let mut tokens = Vec::new();
        registry.for_each(|s| tokens.push(s.token().to_string()));
        tokens.sort();
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_delivery_stops_on_close() {
        let (mut session, mut rx) = new_session("alice");
        assert!(!session.deliver(Frame::from("early")));

        session.open();
        assert!(session.deliver(Frame::from("one")));
        assert_eq!(rx.try_recv().unwrap().as_str(), "one");

        session.close();
        assert!(!session.deliver(Frame::from("two")));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_deregistered_session_no_longer_delivers() {
        let mut registry = SessionRegistry::new();
        let (mut session, mut rx) = new_session("alice");
        session.open();
        let id = session.session_id;
        registry.register(session).unwrap();

        let removed = registry.deregister(&id).unwrap();
        assert!(!removed.deliver(Frame::from("late")));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_uptime_grows() {
        let session = open_session("alice");
        let first = session.uptime();
        std::thread::sleep(Duration::from_millis(5));
        assert!(session.uptime() > first);
    }
}
