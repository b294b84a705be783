//! # relay-core
//!
//! Domain types shared by the relay server and its tooling.
//!
//! - [`SessionId`] / [`SubscriberId`]: validated session keys and stable
//!   subscriber identities
//! - [`Frame`]: one opaque application message (text or binary)
//! - [`RelayError`]: the error taxonomy for create/join/fan-out
//! - [`protocol`]: endpoint paths, query parameter and close codes

pub mod errors;
pub mod frame;
pub mod ids;
pub mod protocol;

pub use errors::{RelayError, Result};
pub use frame::{Frame, TextPayload};
pub use ids::{SessionId, SubscriberId};
