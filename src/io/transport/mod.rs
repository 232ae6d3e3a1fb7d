// src/io/transport/mod.rs
//
// Byte transport between the host and the adapter. The I/O session owns one
// transport for its whole lifetime and clones the handle once so the inbound
// worker reads while the outbound worker writes.

#[cfg(test)]
pub(crate) mod mock;
mod serial;

pub use serial::{list_serial_ports, SerialPortInfo, SerialSettings, SerialTransport};

use std::time::Duration;

use super::IoError;

/// Capability surface the driver needs from a serial-like link.
pub trait Transport: Send {
    /// Block until bytes are readable or `timeout` elapses. Returns whether data is waiting.
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, IoError>;

    /// Read whatever is already buffered, without blocking. Returns the byte count.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Read one byte, waiting at most `timeout`. `Ok(None)` on timeout.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, IoError>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError>;

    fn flush(&mut self) -> Result<(), IoError>;

    /// Drop everything sitting in the receive buffer.
    fn discard_input(&mut self) -> Result<(), IoError>;

    /// Second handle onto the same link.
    fn try_clone(&self) -> Result<Box<dyn Transport>, IoError>;

    /// Release the link. Further operations may fail.
    fn close(&mut self) -> Result<(), IoError> {
        Ok(())
    }
}
