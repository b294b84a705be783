//! Producer and subscriber connection lifecycles.
//!
//! [`Relay::create`] owns a session for as long as its producer stays
//! connected. [`Relay::join`] attaches a subscriber to an existing session
//! and holds it until either side goes away. Session ids arrive here already
//! validated; the HTTP layer refuses bad ones before the upgrade.

use std::sync::Arc;

use metrics::counter;
use relay_core::protocol::{
    CLOSE_NORMAL, CLOSE_POLICY, REASON_NOT_FOUND, REASON_SHUTDOWN, REASON_SUPERSEDED,
};
use relay_core::{RelayError, Result, SessionId, SubscriberId};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{close_within, ping_within, Connection, FrameSource};
use crate::fanout::FanoutEngine;
use crate::heartbeat::run_heartbeat;
use crate::metrics::{FRAMES_RECEIVED_TOTAL, REJECTIONS_TOTAL, SUBSCRIBERS_JOINED_TOTAL};
use crate::registry::SessionRegistry;
use crate::subscriber::{run_sender, DeliveryTiming, SenderExit, Subscriber};

/// Why a producer loop stopped.
#[derive(Debug)]
pub enum ProducerExit {
    /// The producer closed its connection.
    Disconnected,
    /// Reading from or pinging the producer failed, or it stopped answering pings.
    Failed(RelayError),
    /// Superseded by a newer producer, or the server is shutting down.
    Cancelled,
}

/// Outcome of one producer connection.
#[derive(Debug)]
pub struct ProducerSummary {
    /// Session the producer owned.
    pub session_id: SessionId,
    /// Registry instance number of that session.
    pub instance: u64,
    /// Frames read from the producer.
    pub frames: u64,
    /// Subscribers sent a close when the session ended.
    pub notified: usize,
    /// Why the producer loop stopped.
    pub exit: ProducerExit,
}

/// Why a subscriber left its session.
#[derive(Debug)]
pub enum SubscriberExit {
    /// The subscriber closed its connection.
    Disconnected,
    /// Reading from the subscriber failed, or it stopped answering pings.
    Failed(RelayError),
    /// The relay ended it: session teardown, eviction or a failed write.
    Released,
}

/// Outcome of one subscriber connection.
#[derive(Debug)]
pub struct SubscriberSummary {
    /// The subscriber's id.
    pub subscriber_id: SubscriberId,
    /// Why it left.
    pub exit: SubscriberExit,
    /// `true` if it was removed for falling behind or a failed write.
    pub evicted: bool,
}

/// Shared entry point for both connection roles.
pub struct Relay {
    registry: Arc<SessionRegistry>,
    engine: FanoutEngine,
    timing: DeliveryTiming,
    queue_capacity: usize,
}

impl Relay {
    /// Relay over a fresh registry.
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_registry(Arc::new(SessionRegistry::new()), config)
    }

    /// Relay over an existing registry.
    pub fn with_registry(registry: Arc<SessionRegistry>, config: &ServerConfig) -> Self {
        Self {
            registry,
            engine: FanoutEngine::new(config.overflow),
            timing: DeliveryTiming {
                write_timeout: config.write_timeout(),
                close_grace: config.close_grace(),
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_timeout: config.heartbeat_timeout(),
            },
            queue_capacity: config.subscriber_queue_capacity.max(1),
        }
    }

    /// The session registry this relay serves.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Producer role: register a session for `id` and relay the producer's
    /// frames until it disconnects, fails, goes silent, or is cancelled.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn create<C: Connection>(&self, id: SessionId, conn: C) -> ProducerSummary {
        let (mut reader, mut writer) = conn.split();
        let session = self.registry.create(id.clone());
        let cancel = session.producer_token();
        info!(instance = session.instance, "producer connected");

        let heartbeat = run_heartbeat(
            reader.liveness(),
            self.timing.heartbeat_interval,
            self.timing.heartbeat_timeout,
        );
        tokio::pin!(heartbeat);
        let mut ping = time::interval_at(
            time::Instant::now() + self.timing.heartbeat_interval,
            self.timing.heartbeat_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break ProducerExit::Cancelled,
                next = reader.recv() => match next {
                    Some(Ok(frame)) => {
                        counter!(FRAMES_RECEIVED_TOTAL, "kind" => frame.kind()).increment(1);
                        let report = session.dispatch(&frame, &self.engine);
                        trace!(
                            len = frame.len(),
                            delivered = report.delivered,
                            dropped = report.dropped,
                            evicted = report.evicted,
                            "frame relayed"
                        );
                    }
                    Some(Err(e)) => break ProducerExit::Failed(e),
                    None => break ProducerExit::Disconnected,
                },
                missed = &mut heartbeat => {
                    debug!(missed, "producer stopped answering pings");
                    break ProducerExit::Failed(RelayError::HeartbeatTimeout(self.timing.heartbeat_timeout));
                }
                _ = ping.tick() => {
                    if let Err(e) = ping_within(&mut writer, self.timing.write_timeout).await {
                        break ProducerExit::Failed(e);
                    }
                }
            }
        };

        let _ = session.begin_close();
        let removed = self.registry.remove_session(&session);
        let notified = session.finish_close();

        match &exit {
            ProducerExit::Cancelled => {
                let reason = if session.is_superseded() {
                    REASON_SUPERSEDED
                } else {
                    REASON_SHUTDOWN
                };
                if let Err(e) = close_within(&mut writer, CLOSE_NORMAL, reason, self.timing.close_grace).await {
                    debug!(error = %e, "producer close frame not delivered");
                }
            }
            ProducerExit::Failed(e) => warn!(error = %e, kind = e.kind(), "producer connection failed"),
            ProducerExit::Disconnected => {}
        }
        #[allow(clippy::cast_possible_truncation)]
        let lifetime_ms = session.created_at.elapsed().as_millis() as u64;
        info!(
            instance = session.instance,
            frames = session.frames_received(),
            lifetime_ms,
            notified,
            removed,
            exit = ?exit,
            "producer disconnected"
        );

        ProducerSummary {
            session_id: id,
            instance: session.instance,
            frames: session.frames_received(),
            notified,
            exit,
        }
    }

    /// Subscriber role: attach `conn` to the active session `id` until
    /// either side goes away.
    ///
    /// Fails with [`RelayError::SessionNotFound`] when no such session is
    /// active; joins never wait for a session to appear.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn join<C: Connection>(&self, id: &SessionId, conn: C) -> Result<SubscriberSummary> {
        let attached = self.registry.lookup(id).and_then(|session| {
            let (sub, rx) = Subscriber::new(self.queue_capacity);
            session.attach(Arc::clone(&sub))?;
            Ok((session, sub, rx))
        });
        let (session, sub, rx) = match attached {
            Ok(parts) => parts,
            Err(e) => {
                // A session already closing is as gone as one never created.
                let e = match e {
                    RelayError::SessionClosing(id) => RelayError::SessionNotFound(id),
                    other => other,
                };
                self.reject(conn, &e, REASON_NOT_FOUND).await;
                return Err(e);
            }
        };
        counter!(SUBSCRIBERS_JOINED_TOTAL).increment(1);
        info!(subscriber_id = %sub.id, instance = session.instance, "subscriber attached");

        let (mut reader, writer) = conn.split();
        let heartbeat = run_heartbeat(
            reader.liveness(),
            self.timing.heartbeat_interval,
            self.timing.heartbeat_timeout,
        );
        tokio::pin!(heartbeat);
        let sender = tokio::spawn(run_sender(writer, rx, Arc::clone(&sub), self.timing));

        let exit = loop {
            tokio::select! {
                biased;
                () = sub.cancelled() => break SubscriberExit::Released,
                next = reader.recv() => match next {
                    Some(Ok(frame)) => trace!(len = frame.len(), "discarding subscriber data"),
                    Some(Err(e)) => break SubscriberExit::Failed(e),
                    None => break SubscriberExit::Disconnected,
                },
                missed = &mut heartbeat => {
                    warn!(subscriber_id = %sub.id, missed, "subscriber stopped answering pings");
                    break SubscriberExit::Failed(RelayError::HeartbeatTimeout(self.timing.heartbeat_timeout));
                }
            }
        };

        let _ = session.detach(&sub.id);
        sub.cancel();
        match sender.await {
            Ok(SenderExit::Failed(e)) => debug!(subscriber_id = %sub.id, error = %e, "sender failed"),
            Ok(_) => {}
            Err(e) => warn!(subscriber_id = %sub.id, error = %e, "sender task panicked"),
        }
        drop(reader);

        #[allow(clippy::cast_possible_truncation)]
        let attached_ms = sub.joined_at.elapsed().as_millis() as u64;
        info!(
            subscriber_id = %sub.id,
            exit = ?exit,
            evicted = sub.is_evicted(),
            dropped = sub.drop_count(),
            attached_ms,
            "subscriber detached"
        );
        Ok(SubscriberSummary {
            subscriber_id: sub.id.clone(),
            exit,
            evicted: sub.is_evicted(),
        })
    }

    /// Close a connection that was refused after the upgrade.
    async fn reject<C: Connection>(&self, conn: C, err: &RelayError, reason: &str) {
        record_rejection(err);
        let (_reader, mut writer) = conn.split();
        let _ = close_within(&mut writer, CLOSE_POLICY, reason, self.timing.close_grace).await;
    }
}

/// Count and log a refused create/join.
pub(crate) fn record_rejection(err: &RelayError) {
    counter!(REJECTIONS_TOTAL, "reason" => err.kind()).increment(1);
    if err.is_client_error() {
        info!(reason = err.kind(), error = %err, "connection rejected");
    } else {
        warn!(reason = err.kind(), error = %err, "connection rejected");
    }
}
