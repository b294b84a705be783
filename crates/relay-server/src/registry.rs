//! Session registry: a sharded map from session id to live session.
//!
//! Unrelated ids live in different `DashMap` shards and never contend. All
//! blocking work (socket writes) happens outside the map; the only work done
//! while holding a shard lock is flipping session state and queueing close
//! commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use relay_core::{RelayError, Result, SessionId};
use tracing::info;

use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_CREATED_TOTAL, SESSIONS_SUPERSEDED_TOTAL};
use crate::session::Session;

/// Every live session, keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_instance: AtomicU64,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh session under `id`.
    ///
    /// A session already registered under `id` is terminated first: its
    /// producer is cancelled and its subscribers are sent a close.
    pub fn create(&self, id: SessionId) -> Arc<Session> {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session::new(id.clone(), instance));

        match self.sessions.entry(id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get();
                let notified = previous.supersede();
                info!(
                    session_id = %previous.id,
                    old_instance = previous.instance,
                    new_instance = instance,
                    notified,
                    "session superseded"
                );
                counter!(SESSIONS_SUPERSEDED_TOTAL).increment(1);
                let _ = entry.insert(Arc::clone(&session));
            }
            Entry::Vacant(entry) => {
                let _ = entry.insert(Arc::clone(&session));
                gauge!(SESSIONS_ACTIVE).increment(1.0);
            }
        }
        counter!(SESSIONS_CREATED_TOTAL).increment(1);
        session
    }

    /// The active session under `id`.
    pub fn lookup(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.is_active())
            .ok_or_else(|| RelayError::SessionNotFound(id.clone()))
    }

    /// Delete whatever is registered under `id`. Idempotent.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            gauge!(SESSIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Delete `session` only if it is still the registered instance for its
    /// id, so a superseded producer never removes its successor.
    pub fn remove_session(&self, session: &Session) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.id, |_, current| current.instance == session.instance)
            .is_some();
        if removed {
            gauge!(SESSIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Subscribers attached across all sessions.
    pub fn subscriber_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().subscriber_count())
            .sum()
    }

    /// Remove and terminate every session. Returns how many were closed.
    pub fn shutdown_all(&self) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut closed = 0;
        for session in sessions {
            if self.remove_session(&session) {
                let _ = session.terminate();
                closed += 1;
            }
        }
        info!(closed, "all sessions terminated");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::subscriber::{Outbound, Subscriber};

    fn sid(s: &str) -> SessionId {
        SessionId::try_from(s).unwrap()
    }

    #[test]
    fn create_then_lookup() {
        let reg = SessionRegistry::new();
        let created = reg.create(sid("abc"));
        let found = reg.lookup(&sid("abc")).unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn lookup_unknown_is_not_found() {
        let reg = SessionRegistry::new();
        let err = reg.lookup(&sid("nope")).unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound(id) if id.as_str() == "nope"));
    }

    #[test]
    fn lookup_skips_closing_session() {
        let reg = SessionRegistry::new();
        let s = reg.create(sid("abc"));
        assert!(s.begin_close());
        assert!(reg.lookup(&sid("abc")).is_err());
    }

    #[test]
    fn recreate_terminates_previous_instance() {
        let reg = SessionRegistry::new();
        let first = reg.create(sid("abc"));
        let (sub, mut rx) = Subscriber::new(4);
        first.attach(sub).unwrap();
        let first_producer = first.producer_token();

        let second = reg.create(sid("abc"));

        assert!(first_producer.is_cancelled());
        assert_eq!(first.state(), SessionState::Closed);
        assert!(first.is_superseded());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(second.instance > first.instance);
        assert!(Arc::ptr_eq(&reg.lookup(&sid("abc")).unwrap(), &second));
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn stale_instance_cannot_remove_successor() {
        let reg = SessionRegistry::new();
        let first = reg.create(sid("abc"));
        let second = reg.create(sid("abc"));

        assert!(!reg.remove_session(&first));
        assert!(reg.lookup(&sid("abc")).is_ok());
        assert!(reg.remove_session(&second));
        assert!(reg.lookup(&sid("abc")).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = SessionRegistry::new();
        let _ = reg.create(sid("abc"));
        assert!(reg.remove(&sid("abc")).is_some());
        assert!(reg.remove(&sid("abc")).is_none());
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn counts_subscribers_across_sessions() {
        let reg = SessionRegistry::new();
        let mut queues = Vec::new();
        for (name, n) in [("a", 2), ("b", 3)] {
            let s = reg.create(sid(name));
            for _ in 0..n {
                let (sub, rx) = Subscriber::new(4);
                s.attach(sub).unwrap();
                queues.push(rx);
            }
        }
        assert_eq!(reg.subscriber_count(), 5);
    }

    #[test]
    fn shutdown_all_terminates_everything() {
        let reg = SessionRegistry::new();
        let sessions: Vec<_> = (0..4).map(|i| reg.create(sid(&format!("s{i}")))).collect();
        assert_eq!(reg.shutdown_all(), 4);
        assert_eq!(reg.session_count(), 0);
        for s in sessions {
            assert_eq!(s.state(), SessionState::Closed);
            assert!(s.producer_token().is_cancelled());
            assert!(!s.is_superseded());
        }
    }

    #[test]
    fn concurrent_creates_leave_one_session_per_id() {
        let reg = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let _ = reg.create(sid(&format!("id-{}", (i + t) % 16)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.session_count(), 16);
        for i in 0..16 {
            assert!(reg.lookup(&sid(&format!("id-{i}"))).is_ok());
        }
    }
}
