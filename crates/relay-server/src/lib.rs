//! # relay-server
//!
//! Live session relay: one producer per session id, any number of
//! subscribers, every producer frame copied to every subscriber.
//!
//! - [`registry`]: sharded session map with supersede-on-create
//! - [`session`]: per-session state machine and subscriber set
//! - [`fanout`]: non-blocking per-frame distribution with an overflow policy
//! - [`subscriber`]: bounded outbound queue and sender task per subscriber
//! - [`handlers`]: producer and subscriber lifecycles over any [`connection::Connection`]
//! - [`server`]: axum routes (`/create`, `/join`, `/health`, `/metrics`) and graceful shutdown

pub mod config;
pub mod connection;
pub mod fanout;
pub mod handlers;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod subscriber;
pub mod transport;

pub use config::{OverflowPolicy, ServerConfig};
pub use handlers::Relay;
pub use registry::SessionRegistry;
pub use server::RelayServer;
pub use shutdown::ShutdownCoordinator;
