//! Wire-level constants shared by the server and its clients.

/// Producer endpoint.
pub const CREATE_PATH: &str = "/create";
/// Subscriber endpoint.
pub const JOIN_PATH: &str = "/join";
/// Query parameter carrying the session key on both endpoints.
pub const SESSION_ID_PARAM: &str = "sessionId";

/// Close code sent to a producer that is superseded or shut down.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent to subscribers when their session ends.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for a join whose session disappeared during the upgrade.
pub const CLOSE_POLICY: u16 = 1008;

/// Close reason sent to subscribers on session teardown.
pub const REASON_SESSION_CLOSED: &str = "session closed";
/// Close reason sent to a superseded producer.
pub const REASON_SUPERSEDED: &str = "session superseded";
/// Close reason sent to producers when the server stops.
pub const REASON_SHUTDOWN: &str = "server shutting down";
/// Close reason for a join against a missing session.
pub const REASON_NOT_FOUND: &str = "session not found";
/// Close reason sent to a subscriber removed for falling behind.
pub const REASON_EVICTED: &str = "subscriber too slow";

/// Build the producer URL path for a session.
pub fn create_path(session_id: &str) -> String {
    format!("{CREATE_PATH}?{SESSION_ID_PARAM}={}", encode_query_value(session_id))
}

/// Build the subscriber URL path for a session.
pub fn join_path(session_id: &str) -> String {
    format!("{JOIN_PATH}?{SESSION_ID_PARAM}={}", encode_query_value(session_id))
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
