//! Prometheus recorder and relay metric names.

use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Sessions created through `/create` (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "relay_sessions_created_total";
/// Sessions replaced by a newer producer under the same id (counter).
pub const SESSIONS_SUPERSEDED_TOTAL: &str = "relay_sessions_superseded_total";
/// Live sessions in the registry (gauge).
pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
/// Subscribers attached through `/join` (counter).
pub const SUBSCRIBERS_JOINED_TOTAL: &str = "relay_subscribers_joined_total";
/// Subscribers removed by the relay rather than by their own disconnect
/// (counter, labels: reason).
pub const SUBSCRIBERS_EVICTED_TOTAL: &str = "relay_subscribers_evicted_total";
/// Attached subscribers across all sessions (gauge).
pub const SUBSCRIBERS_ACTIVE: &str = "relay_subscribers_active";
/// Frames read from producers (counter, labels: kind).
pub const FRAMES_RECEIVED_TOTAL: &str = "relay_frames_received_total";
/// Frames queued to a subscriber (counter).
pub const FRAMES_DISPATCHED_TOTAL: &str = "relay_frames_dispatched_total";
/// Frames skipped for a subscriber with a full queue (counter).
pub const FRAMES_DROPPED_TOTAL: &str = "relay_frames_dropped_total";
/// Create/join attempts refused (counter, labels: reason).
pub const REJECTIONS_TOTAL: &str = "relay_rejections_total";

/// Install the global Prometheus recorder and register metric descriptions.
///
/// Call once at startup, before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Prometheus text exposition of everything recorded so far.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn describe() {
    describe_counter!(SESSIONS_CREATED_TOTAL, Unit::Count, "Sessions created");
    describe_counter!(
        SESSIONS_SUPERSEDED_TOTAL,
        Unit::Count,
        "Sessions replaced by a newer producer"
    );
    describe_gauge!(SESSIONS_ACTIVE, Unit::Count, "Live sessions");
    describe_counter!(SUBSCRIBERS_JOINED_TOTAL, Unit::Count, "Subscribers attached");
    describe_counter!(
        SUBSCRIBERS_EVICTED_TOTAL,
        Unit::Count,
        "Subscribers removed for slowness or write failure"
    );
    describe_gauge!(SUBSCRIBERS_ACTIVE, Unit::Count, "Attached subscribers");
    describe_counter!(FRAMES_RECEIVED_TOTAL, Unit::Count, "Frames read from producers");
    describe_counter!(FRAMES_DISPATCHED_TOTAL, Unit::Count, "Frames queued to subscribers");
    describe_counter!(FRAMES_DROPPED_TOTAL, Unit::Count, "Frames skipped on full queues");
    describe_counter!(REJECTIONS_TOTAL, Unit::Count, "Refused create/join attempts");
}
