//! remotectl Agent - enrollment and the remote-control connection
//!
//! This crate provides:
//! - `Enrollment`: register the machine and wait for a human to claim it
//! - `RemoteConnection`: the authenticated duplex channel to the management service
//! - `PeriodicRefresher`: signal-interruptible repeating tasks used by the connection
//! - `CommandMessage`: tunnelled HTTP requests replayed against the local web service

pub mod command;
pub mod config;
pub mod connection;
pub mod enrollment;
pub mod error;
pub mod handler;
pub mod identity;
pub mod refresher;
pub mod retry;
pub mod session;
pub mod settings;

pub use command::{CommandMessage, Responder};
pub use config::AgentConfig;
pub use connection::{ConnectionOptions, RemoteConnection, RemoteHandler};
pub use enrollment::{Enrollment, EnrollmentState};
pub use error::{RemoteError, Result};
pub use handler::WebServiceHandler;
pub use identity::ClientIdentity;
pub use refresher::{PeriodicRefresher, RefreshSignal};
pub use retry::retry;
pub use session::ConnectionState;
pub use settings::AgentSettings;

/// Client version reported during enrollment and authentication
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
