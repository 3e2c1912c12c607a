//! remotectl Transport - WebSocket layer
//!
//! This crate provides:
//! - WebSocket client for the outbound duplex connection
//! - WebSocket acceptor for the management-service side

mod wss_client;
mod wss_server;

pub use wss_client::*;
pub use wss_server::*;
