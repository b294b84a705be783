//! One attached subscriber: its outbound queue and the task that drains it.
//!
//! The producer side only ever calls [`Subscriber::try_deliver`], which never
//! blocks. Socket writes happen in [`run_sender`], one task per subscriber, each
//! write bounded by the configured timeout. A teardown is bounded as a whole
//! by the close grace.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use relay_core::protocol::{CLOSE_GOING_AWAY, CLOSE_POLICY, REASON_EVICTED, REASON_SESSION_CLOSED};
use relay_core::{Frame, RelayError, SubscriberId};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::{close_within, ping_within, FrameSink};
use crate::metrics::SUBSCRIBERS_EVICTED_TOTAL;

/// Work item for a sender task.
#[derive(Debug)]
pub enum Outbound {
    /// A producer frame to write.
    Frame(Frame),
    /// Session teardown: send the close frame once everything queued before
    /// it has been written.
    Close,
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The queue is at capacity.
    Full,
    /// The sender task is gone.
    Closed,
}

/// Timing knobs for a subscriber connection.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryTiming {
    /// Bound on a single frame or ping write.
    pub write_timeout: Duration,
    /// Bound on a whole teardown, from the close request to the close frame.
    pub close_grace: Duration,
    /// How often the peer is pinged.
    pub heartbeat_interval: Duration,
    /// Silence after which the peer is treated as gone.
    pub heartbeat_timeout: Duration,
}

impl Default for DeliveryTiming {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(1),
            close_grace: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

/// A subscriber attached to a session.
///
/// Owned jointly by the session (for fan-out), the handler running its
/// liveness loop and its sender task.
pub struct Subscriber {
    /// Stable identity for logs.
    pub id: SubscriberId,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    closing: CancellationToken,
    evicted: AtomicBool,
    dropped: AtomicU64,
    /// When the subscriber attached.
    pub joined_at: Instant,
}

impl Subscriber {
    /// New subscriber with a queue of `capacity` frames (at least one).
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sub = Arc::new(Self {
            id: SubscriberId::new(),
            tx,
            cancel: CancellationToken::new(),
            closing: CancellationToken::new(),
            evicted: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            joined_at: Instant::now(),
        });
        (sub, rx)
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue counts toward [`Subscriber::drop_count`].
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Session teardown. Frames already queued are still written, then the
    /// close frame, all within the close grace. Falls back to cancelling when
    /// the queue has no room.
    pub fn close(&self) {
        self.closing.cancel();
        if self.tx.try_send(Outbound::Close).is_err() {
            self.cancel();
        }
    }

    /// Remove this subscriber for falling behind or for a dead transport.
    pub fn evict(&self) {
        self.evicted.store(true, Ordering::Relaxed);
        self.cancel();
    }

    /// Stop the sender and the liveness loop immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `true` once [`Subscriber::cancel`] or [`Subscriber::evict`] ran.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `true` once the session asked this subscriber to close.
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// `true` if the subscriber was removed for falling behind or failing.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Resolves once the subscriber is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Frames skipped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// How a sender task ended.
#[derive(Debug)]
pub enum SenderExit {
    /// Session teardown; the close frame was attempted.
    Closed,
    /// Cancelled from outside (eviction, own disconnect, registry shutdown).
    Cancelled,
    /// Teardown ran out of close grace; the transport was dropped as is.
    DrainExpired,
    /// A write failed or timed out.
    Failed(RelayError),
}

/// Drain `rx` into `writer` until teardown, cancellation or a failed write.
///
/// Pings go out every `heartbeat_interval`; the handler's liveness loop
/// watches for the pongs. Once a close is requested, the remaining frames and
/// the close frame share one `close_grace` deadline, after which the
/// transport is dropped. On exit the subscriber is always cancelled so its
/// liveness loop unblocks.
pub async fn run_sender<W: FrameSink>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    sub: Arc<Subscriber>,
    timing: DeliveryTiming,
) -> SenderExit {
    let mut heartbeat = time::interval_at(
        time::Instant::now() + timing.heartbeat_interval,
        timing.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline: Option<time::Instant> = None;

    let exit = loop {
        let expiry = deadline;
        tokio::select! {
            biased;
            () = sub.cancelled() => break SenderExit::Cancelled,
            () = sub.closing.cancelled(), if deadline.is_none() => {
                deadline = Some(time::Instant::now() + timing.close_grace);
            }
            () = sleep_until(expiry), if expiry.is_some() => break SenderExit::DrainExpired,
            cmd = rx.recv() => match cmd {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = write_frame(&mut writer, frame, timing.write_timeout, deadline).await {
                        break failure(e, deadline);
                    }
                }
                Some(Outbound::Close) | None => break SenderExit::Closed,
            },
            _ = heartbeat.tick(), if deadline.is_none() => {
                if let Err(e) = ping_within(&mut writer, timing.write_timeout).await {
                    break SenderExit::Failed(e);
                }
            }
        }
    };

    match &exit {
        SenderExit::Failed(e) => {
            warn!(subscriber_id = %sub.id, error = %e, "subscriber write failed, evicting");
            counter!(SUBSCRIBERS_EVICTED_TOTAL, "reason" => e.kind()).increment(1);
            sub.evict();
        }
        SenderExit::Cancelled if sub.is_evicted() => {
            let _ = close_within(&mut writer, CLOSE_POLICY, REASON_EVICTED, timing.close_grace).await;
        }
        SenderExit::Cancelled if !sub.is_closing() => {
            trace!(subscriber_id = %sub.id, "subscriber left, no close frame");
        }
        SenderExit::Closed | SenderExit::Cancelled => {
            let grace = deadline.map_or(timing.close_grace, |d| {
                d.saturating_duration_since(time::Instant::now())
            });
            if let Err(e) = close_within(&mut writer, CLOSE_GOING_AWAY, REASON_SESSION_CLOSED, grace).await {
                debug!(subscriber_id = %sub.id, error = %e, "close frame not delivered");
            }
        }
        SenderExit::DrainExpired => {
            debug!(subscriber_id = %sub.id, grace = ?timing.close_grace, "close grace elapsed, dropping transport");
        }
    }
    sub.cancel();
    exit
}

async fn sleep_until(deadline: Option<time::Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One frame write, bounded by `limit` and by the teardown deadline if set.
async fn write_frame<W: FrameSink>(
    writer: &mut W,
    frame: Frame,
    limit: Duration,
    deadline: Option<time::Instant>,
) -> Result<(), RelayError> {
    let by_limit = time::Instant::now() + limit;
    let until = deadline.map_or(by_limit, |d| d.min(by_limit));
    time::timeout_at(until, writer.send(frame))
        .await
        .unwrap_or(Err(RelayError::WriteTimeout(limit)))
}

fn failure(err: RelayError, deadline: Option<time::Instant>) -> SenderExit {
    match deadline {
        Some(at) if time::Instant::now() >= at => SenderExit::DrainExpired,
        _ => SenderExit::Failed(err),
    }
}
