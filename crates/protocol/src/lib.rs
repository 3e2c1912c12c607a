//! remotectl Protocol - Envelope and payload definitions
//!
//! This crate defines the data exchanged with the management service:
//! - `Envelope`: The outer JSON wrapper of every socket frame
//! - `AuthMessage`/`WelcomeMessage`/`AuthResultMessage`: Handshake payloads
//! - `CommandRequestMessage`/`CommandResponseMessage`: Tunnelled HTTP exchanges
//! - `MiniServerCertificate`/`ClaimedClientData`: Pinned keys and credentials
//!
//! Payloads are carried as serialized JSON strings so they can be signed or
//! encrypted as a unit, independent of envelope framing.

mod auth;
mod certificate;
mod command;
mod envelope;
mod validation;

pub use auth::*;
pub use certificate::*;
pub use command::*;
pub use envelope::*;
pub use validation::*;

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: i32 = 1;
