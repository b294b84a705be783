//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. Apply environment variable overrides ([`ServerConfig::apply_overrides`])
//! 3. The binary applies CLI flags last
//!
//! Each variable has strict parsing rules. Invalid values are ignored with a
//! warning and the previous value is kept.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What the fan-out engine does when a subscriber's outbound queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum OverflowPolicy {
    /// Evict the subscriber on the first frame it cannot accept.
    #[default]
    Disconnect,
    /// Skip the frame for that subscriber only; evict once it has missed
    /// `max_drops` frames in total.
    DropFrames {
        /// Lifetime drops tolerated before eviction.
        max_drops: u64,
    },
}

impl FromStr for OverflowPolicy {
    type Err = String;

    /// Accepts `disconnect` or `drop:<max_drops>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "disconnect" {
            return Ok(Self::Disconnect);
        }
        match s.strip_prefix("drop:").map(str::parse::<u64>) {
            Some(Ok(max_drops)) if max_drops > 0 => Ok(Self::DropFrames { max_drops }),
            _ => Err(format!("invalid overflow policy: {s}")),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnect => f.write_str("disconnect"),
            Self::DropFrames { max_drops } => write!(f, "drop:{max_drops}"),
        }
    }
}

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `3000`, `0` for auto-assign).
    pub port: u16,
    /// Outbound frames buffered per subscriber before the overflow policy applies.
    pub subscriber_queue_capacity: usize,
    /// Upper bound on a single write to a subscriber.
    pub write_timeout_ms: u64,
    /// Bound on a subscriber teardown: queued frames plus the close frame.
    /// Whatever has not been written by then is dropped with the transport.
    pub close_grace_ms: u64,
    /// Ping interval for producer and subscriber connections.
    pub heartbeat_interval_secs: u64,
    /// A peer that answers no ping for this long is treated as gone.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// What happens to a subscriber whose queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            subscriber_queue_capacity: 256,
            write_timeout_ms: 1_000,
            close_grace_ms: 5_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            overflow: OverflowPolicy::Disconnect,
        }
    }
}

impl ServerConfig {
    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HOST").filter(|v| !v.trim().is_empty()) {
            self.host = v.trim().to_owned();
        }
        if let Some(v) = read_override(&lookup, "PORT", |s| parse_u16_in(s, 1, 65535)) {
            self.port = v;
        }
        if let Some(v) = read_override(&lookup, "RELAY_QUEUE_CAPACITY", |s| {
            parse_usize_in(s, 1, 1_000_000)
        }) {
            self.subscriber_queue_capacity = v;
        }
        if let Some(v) = read_override(&lookup, "RELAY_WRITE_TIMEOUT_MS", |s| {
            parse_u64_in(s, 1, 600_000)
        }) {
            self.write_timeout_ms = v;
        }
        if let Some(v) = read_override(&lookup, "RELAY_CLOSE_GRACE_MS", |s| {
            parse_u64_in(s, 0, 600_000)
        }) {
            self.close_grace_ms = v;
        }
        if let Some(v) = read_override(&lookup, "RELAY_HEARTBEAT_INTERVAL_SECS", |s| {
            parse_u64_in(s, 1, 3_600)
        }) {
            self.heartbeat_interval_secs = v;
        }
        if let Some(v) = read_override(&lookup, "RELAY_HEARTBEAT_TIMEOUT_SECS", |s| {
            parse_u64_in(s, 1, 86_400)
        }) {
            self.heartbeat_timeout_secs = v;
        }
        if let Some(v) = read_override(&lookup, "RELAY_MAX_MESSAGE_SIZE", |s| {
            parse_usize_in(s, 1024, 1 << 30)
        }) {
            self.max_message_size = v;
        }
        if let Some(v) = read_override(&lookup, "RELAY_OVERFLOW", |s| s.parse().ok()) {
            self.overflow = v;
        }
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-write bound, at least 1 ms.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    /// Budget for a teardown: queued frames plus the close frame.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Ping interval, at least one second.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence tolerated before a peer is dropped, never below one interval.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs).max(self.heartbeat_interval())
    }
}

fn read_override<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring invalid config override");
    }
    parsed
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse an integer and check it lies within `[min, max]`.
pub fn parse_u64_in(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim().parse::<u64>().ok().filter(|v| (min..=max).contains(v))
}

/// [`parse_u64_in`] for ports.
pub fn parse_u16_in(val: &str, min: u16, max: u16) -> Option<u16> {
    val.trim().parse::<u16>().ok().filter(|v| (min..=max).contains(v))
}

/// [`parse_u64_in`] for sizes.
pub fn parse_usize_in(val: &str, min: usize, max: usize) -> Option<usize> {
    val.trim().parse::<usize>().ok().filter(|v| (min..=max).contains(v))
}
