// src/io/error.rs
//
// Error taxonomy for the SLCAN driver. Errors raised inside the I/O session
// travel to the facade as values over the inbound queue, so every variant is
// plain data: cloneable and serialisable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IoError {
    /// Unknown bit rate or otherwise unusable configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The adapter did not acknowledge a command in time
    #[error("SLCAN ACK timeout waiting for '{command}' after {timeout_ms} ms")]
    ProtocolTimeout { command: String, timeout_ms: u64 },

    /// The adapter answered a command with NACK (BEL)
    #[error("SLCAN NACK in response to '{command}'")]
    ProtocolNack { command: String },

    /// Decode-time failure; recovered inside the inbound worker, never surfaced
    #[error("malformed SLCAN fragment: {message}")]
    MalformedFrame { message: String },

    /// A frame that violates the CAN frame invariants
    #[error("invalid CAN frame: {message}")]
    InvalidFrame { message: String },

    /// Read or write failure on the underlying port
    #[error("transport error: {message}")]
    Transport { message: String, fatal: bool },

    /// The I/O session never signalled readiness
    #[error("I/O session did not confirm initialization within {timeout_ms} ms")]
    InitTimeout { timeout_ms: u64 },

    /// Facade operation attempted after the session terminated
    #[error("I/O session is dead")]
    SessionDead,

    /// Internal protocol violation on the session queues
    #[error("unexpected entity in IPC channel: {message}")]
    UnexpectedMessage { message: String },
}

impl IoError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame { message: message.into() }
    }

    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame { message: message.into() }
    }

    /// Recoverable transport failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), fatal: false }
    }

    /// Transport failure after which the port cannot be used again
    pub fn fatal_transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), fatal: true }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedMessage { message: message.into() }
    }

    /// Whether this error means the device is gone and the worker reporting
    /// it must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { fatal: true, .. })
    }
}

/// I/O error kinds meaning the device went away
fn device_gone(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotFound
    )
}

impl From<std::io::Error> for IoError {
    fn from(error: std::io::Error) -> Self {
        Self::Transport {
            message: error.to_string(),
            fatal: device_gone(error.kind()),
        }
    }
}

impl From<serialport::Error> for IoError {
    fn from(error: serialport::Error) -> Self {
        let fatal = match error.kind() {
            serialport::ErrorKind::NoDevice => true,
            serialport::ErrorKind::Io(kind) => device_gone(kind),
            _ => false,
        };
        Self::Transport { message: error.to_string(), fatal }
    }
}
