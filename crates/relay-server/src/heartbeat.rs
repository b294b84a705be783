//! Ping/pong liveness monitoring.
//!
//! Pings are written by whoever owns the write half. This module only
//! watches the [`Liveness`] flag that the read half sets.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use crate::connection::Liveness;

/// Resolve once the peer has stayed silent for `timeout`.
///
/// Every `interval` the flag is checked and cleared. A check that finds it
/// clear counts as a missed pong; `timeout / interval` consecutive misses
/// (at least one) end the wait. Returns the number of missed checks.
pub async fn run_heartbeat(liveness: Liveness, interval: Duration, timeout: Duration) -> u32 {
    let interval = interval.max(Duration::from_millis(1));
    let max_missed = u32::try_from(timeout.as_millis() / interval.as_millis())
        .unwrap_or(u32::MAX)
        .max(1);
    let mut check = time::interval_at(time::Instant::now() + interval, interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed_pongs = 0;

    loop {
        let _ = check.tick().await;
        if liveness.take() {
            missed_pongs = 0;
        } else {
            missed_pongs += 1;
            if missed_pongs >= max_missed {
                return missed_pongs;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_after_timeout() {
        let liveness = Liveness::new();
        let start = time::Instant::now();
        let missed = run_heartbeat(liveness, Duration::from_secs(30), Duration::from_secs(90)).await;
        assert_eq!(missed, 3);
        // The first check consumes the initial alive mark.
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert!(start.elapsed() < Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_shorter_than_interval_allows_one_miss() {
        let liveness = Liveness::new();
        let _ = liveness.take();
        let missed = run_heartbeat(liveness, Duration::from_secs(10), Duration::from_secs(1)).await;
        assert_eq!(missed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_it_waiting() {
        let liveness = Liveness::new();
        let pong = liveness.clone();
        let watcher = tokio::spawn(run_heartbeat(
            liveness,
            Duration::from_secs(1),
            Duration::from_secs(3),
        ));

        for _ in 0..10 {
            time::sleep(Duration::from_millis(500)).await;
            pong.mark_alive();
        }
        assert!(!watcher.is_finished());

        // Silence from here on.
        let missed = watcher.await.unwrap();
        assert_eq!(missed, 3);
    }
}
