//! Client side of the relay connection
//!
//! Nodes reach each other only through the relay. This module provides:
//! - `RelayClient`, a WebSocket connection that logs in as one party
//! - `TransportError`, covering connection failures and relay refusals
//!
//! The transport moves whole JSON frames. Contract semantics are handled by
//! the node on top of it.

use thiserror::Error;

pub mod websocket;
pub use websocket::RelayClient;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The relay reported an error and is closing the connection
    #[error("Relay error: {0}")]
    Relay(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
