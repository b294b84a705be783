//! `/health` endpoint body.

use serde::Serialize;
use std::time::Instant;

/// JSON body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"shutting_down"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions currently in the registry.
    pub sessions: usize,
    /// Subscribers attached across all sessions.
    pub subscribers: usize,
}

impl HealthResponse {
    /// Snapshot taken now.
    pub fn new(start_time: Instant, sessions: usize, subscribers: usize, shutting_down: bool) -> Self {
        Self {
            status: if shutting_down { "shutting_down" } else { "ok" },
            uptime_secs: start_time.elapsed().as_secs(),
            sessions,
            subscribers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reports_counts() {
        let resp = HealthResponse::new(Instant::now(), 4, 17, false);
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.sessions, 4);
        assert_eq!(resp.subscribers, 17);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_counts_from_start() {
        let start = Instant::now().checked_sub(Duration::from_secs(90)).unwrap();
        assert!(HealthResponse::new(start, 0, 0, false).uptime_secs >= 89);
    }

    #[test]
    fn shutting_down_status() {
        assert_eq!(HealthResponse::new(Instant::now(), 0, 0, true).status, "shutting_down");
    }

    #[test]
    fn serializes_flat_object() {
        let json = serde_json::to_value(HealthResponse::new(Instant::now(), 2, 5, false)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sessions"], 2);
        assert_eq!(json["subscribers"], 5);
        assert!(json["uptime_secs"].is_u64());
    }
}
