//! # relay-loadgen
//!
//! Opens `sessions` producer connections against a relay, one every
//! `stagger_ms`, and has each send an RFC 3339 timestamp every `interval_ms`.
//! Anything a producer receives is logged. Connection and write failures are
//! counted, never fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use relay_core::protocol;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Load profile, from flags or environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "relay-loadgen", about = "Producer load generator for the session relay")]
pub struct LoadConfig {
    /// Relay address as `host:port`.
    #[arg(long, env = "HOST", default_value = "127.0.0.1:3000")]
    pub host: String,

    /// Number of producer sessions to open.
    #[arg(long, default_value_t = 10_000)]
    pub sessions: usize,

    /// Delay between opening consecutive sessions.
    #[arg(long, default_value_t = 10)]
    pub stagger_ms: u64,

    /// Delay between frames on each session.
    #[arg(long, default_value_t = 1_000)]
    pub interval_ms: u64,

    /// Prepended to the session number to form each session id.
    #[arg(long, default_value = "")]
    pub session_prefix: String,

    /// Stop after this many seconds instead of waiting for ctrl-c.
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

impl LoadConfig {
    /// Session id of the `n`th producer.
    pub fn session_id(&self, n: usize) -> String {
        format!("{}{n}", self.session_prefix)
    }

    /// `ws://` URL the `n`th producer connects to.
    pub fn producer_url(&self, n: usize) -> String {
        format!("ws://{}{}", self.host, protocol::create_path(&self.session_id(n)))
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Producers that completed the WebSocket handshake.
    pub connected: u64,
    /// Producers that failed to connect or to write.
    pub failed: u64,
    /// Timestamps written across all producers.
    pub frames_sent: u64,
}

#[derive(Default)]
struct Counters {
    connected: AtomicU64,
    failed: AtomicU64,
    frames_sent: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> LoadReport {
        LoadReport {
            connected: self.connected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
        }
    }
}

/// Run until `cancel` fires, the configured duration elapses, or every
/// producer has ended.
pub async fn run(config: LoadConfig, cancel: CancellationToken) -> LoadReport {
    let counters = Arc::new(Counters::default());
    let mut producers = JoinSet::new();

    if let Some(secs) = config.duration_secs {
        let deadline = cancel.clone();
        let _timer = tokio::spawn(async move {
            time::sleep(Duration::from_secs(secs)).await;
            deadline.cancel();
        });
    }

    info!(
        host = %config.host,
        sessions = config.sessions,
        stagger_ms = config.stagger_ms,
        interval_ms = config.interval_ms,
        "starting producers"
    );
    for n in 0..config.sessions {
        if n > 0 && config.stagger_ms > 0 {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = time::sleep(Duration::from_millis(config.stagger_ms)) => {}
            }
        } else if cancel.is_cancelled() {
            break;
        }
        let _ = producers.spawn(run_producer(
            config.producer_url(n),
            config.interval(),
            Arc::clone(&counters),
            cancel.clone(),
        ));
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            joined = producers.join_next() => {
                if joined.is_none() {
                    info!("every producer has ended");
                    break;
                }
            }
        }
    }
    cancel.cancel();
    while producers.join_next().await.is_some() {}

    let report = counters.report();
    info!(
        connected = report.connected,
        failed = report.failed,
        frames_sent = report.frames_sent,
        "load run finished"
    );
    report
}

async fn run_producer(url: String, interval: Duration, counters: Arc<Counters>, cancel: CancellationToken) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(%url, error = %e, "producer failed to connect");
            Counters::bump(&counters.failed);
            return;
        }
    };
    Counters::bump(&counters.connected);
    debug!(%url, "producer connected");

    let (mut tx, mut rx) = ws.split();
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => info!(%url, recv = %text.as_str(), "producer received"),
                Some(Ok(Message::Close(frame))) => {
                    info!(%url, ?frame, "relay closed producer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%url, error = %e, "producer read failed");
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let stamp = Utc::now().to_rfc3339();
                if let Err(e) = tx.send(Message::Text(stamp.into())).await {
                    warn!(%url, error = %e, "producer write failed");
                    Counters::bump(&counters.failed);
                    break;
                }
                Counters::bump(&counters.frames_sent);
            }
        }
    }
}
