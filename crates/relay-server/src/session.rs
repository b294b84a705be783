//! Per-session state: the producer's ownership token and the subscriber set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::gauge;
use parking_lot::Mutex;
use relay_core::{Frame, RelayError, Result, SessionId, SubscriberId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fanout::{DispatchReport, FanoutEngine};
use crate::metrics::SUBSCRIBERS_ACTIVE;
use crate::subscriber::Subscriber;

/// `Active → Closing → Closed`. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Relaying frames and accepting subscribers.
    Active,
    /// The producer loop has exited; no new subscribers are accepted.
    Closing,
    /// Subscribers have been notified and detached.
    Closed,
}

struct Inner {
    state: SessionState,
    subscribers: HashMap<SubscriberId, Arc<Subscriber>>,
}

/// One producer's session and the subscribers attached to it.
pub struct Session {
    /// Client-chosen key.
    pub id: SessionId,
    /// Distinguishes successive sessions created under the same id.
    pub instance: u64,
    /// When the producer connected.
    pub created_at: Instant,
    inner: Mutex<Inner>,
    producer: CancellationToken,
    superseded: AtomicBool,
    frames_received: AtomicU64,
}

impl Session {
    /// Active session with no subscribers.
    pub fn new(id: SessionId, instance: u64) -> Self {
        Self {
            id,
            instance,
            created_at: Instant::now(),
            inner: Mutex::new(Inner {
                state: SessionState::Active,
                subscribers: HashMap::new(),
            }),
            producer: CancellationToken::new(),
            superseded: AtomicBool::new(false),
            frames_received: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// `true` while the session accepts joins.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Subscribers attached right now.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Frames read from the producer so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Cancelled when this session's producer must stop (superseded or
    /// server shutdown).
    pub fn producer_token(&self) -> CancellationToken {
        self.producer.clone()
    }

    /// Add a subscriber. Only an active session accepts new subscribers.
    pub fn attach(&self, sub: Arc<Subscriber>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return Err(RelayError::SessionClosing(self.id.clone()));
        }
        let _ = inner.subscribers.insert(sub.id.clone(), sub);
        gauge!(SUBSCRIBERS_ACTIVE).increment(1.0);
        Ok(())
    }

    /// Remove a subscriber by id. Returns `false` if it was already gone.
    pub fn detach(&self, id: &SubscriberId) -> bool {
        let removed = self.inner.lock().subscribers.remove(id).is_some();
        if removed {
            gauge!(SUBSCRIBERS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Hand one producer frame to every current subscriber.
    ///
    /// The lock covers only the queueing; evicted subscribers are cancelled
    /// after it is released.
    #[allow(clippy::cast_precision_loss)]
    pub fn dispatch(&self, frame: &Frame, engine: &FanoutEngine) -> DispatchReport {
        let _ = self.frames_received.fetch_add(1, Ordering::Relaxed);
        let (report, evicted) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Active {
                return DispatchReport::default();
            }
            engine.fan_out(&mut inner.subscribers, frame)
        };
        if !evicted.is_empty() {
            gauge!(SUBSCRIBERS_ACTIVE).decrement(evicted.len() as f64);
        }
        for sub in evicted {
            sub.evict();
        }
        report
    }

    /// `Active → Closing`. Returns `false` if the session was not active.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Active {
            inner.state = SessionState::Closing;
            true
        } else {
            false
        }
    }

    /// `→ Closed`: detach every subscriber and send each a close notification.
    /// Returns how many subscribers were notified; zero on a repeat call.
    #[allow(clippy::cast_precision_loss)]
    pub fn finish_close(&self) -> usize {
        let subscribers: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Closed;
            inner.subscribers.drain().map(|(_, sub)| sub).collect()
        };
        let notified = subscribers.len();
        if notified > 0 {
            gauge!(SUBSCRIBERS_ACTIVE).decrement(notified as f64);
        }
        for sub in subscribers {
            sub.close();
        }
        debug!(session_id = %self.id, instance = self.instance, notified, "session closed");
        notified
    }

    /// Stop the producer and close the session from outside its producer loop.
    pub fn terminate(&self) -> usize {
        self.producer.cancel();
        let _ = self.begin_close();
        self.finish_close()
    }

    /// [`Session::terminate`] because a newer producer took over this id.
    pub fn supersede(&self) -> usize {
        self.superseded.store(true, Ordering::Relaxed);
        self.terminate()
    }

    /// `true` if a newer producer replaced this session.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("state", &inner.state)
            .field("subscribers", &inner.subscribers.len())
            .finish_non_exhaustive()
    }
}
