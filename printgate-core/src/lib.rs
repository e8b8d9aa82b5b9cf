//! printgate-core: Shared library for the print dashboard gateway
//!
//! This crate provides:
//! - Configuration and upstream credentials
//! - Session state and the Repetier login handshake
//! - Request dispatch with re-authentication on permission errors
//! - Printer operations on top of the dispatcher
//! - Per-connection broadcast of printer state to observers

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod printer;
pub mod protocol;
pub mod session;

pub use auth::{Authenticator, Credentials};
pub use broadcast::{BroadcastScheduler, StateSource};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::GatewayError;
pub use printer::PrinterClient;
pub use protocol::FeedMessage;
pub use session::SessionState;

/// Default HTTP/WebSocket port for printgate-server
pub const DEFAULT_LISTEN_PORT: u16 = 5000;

/// Default Repetier Server port
pub const DEFAULT_UPSTREAM_PORT: u16 = 3344;

/// Default observer poll cadence in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
