// src/io/transport/serial.rs
//
// Serial port transport built on the serialport crate, plus conversions from
// config values to serialport's framing types.

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use super::Transport;
use crate::io::IoError;

/// Poll interval while waiting for readability
const READABLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Types
// ============================================================================

/// Serial port settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial port path (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// "none", "odd" or "even"
    pub parity: String,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
        }
    }
}

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

// ============================================================================
// Line framing
// ============================================================================

pub(crate) fn data_bits(bits: u8) -> Result<DataBits, IoError> {
    DataBits::try_from(bits)
        .map_err(|_| IoError::configuration(format!("Invalid data bits {} (expected 5-8)", bits)))
}

pub(crate) fn stop_bits(bits: u8) -> Result<StopBits, IoError> {
    StopBits::try_from(bits)
        .map_err(|_| IoError::configuration(format!("Invalid stop bits {} (expected 1 or 2)", bits)))
}

pub(crate) fn parity(name: &str) -> Result<Parity, IoError> {
    if name.eq_ignore_ascii_case("none") {
        Ok(Parity::None)
    } else if name.eq_ignore_ascii_case("odd") {
        Ok(Parity::Odd)
    } else if name.eq_ignore_ascii_case("even") {
        Ok(Parity::Even)
    } else {
        Err(IoError::configuration(format!(
            "Invalid parity '{}' (expected none, odd or even)",
            name
        )))
    }
}

impl SerialSettings {
    /// Check the line framing without touching any device.
    pub fn validate(&self) -> Result<(), IoError> {
        if self.port.is_empty() {
            return Err(IoError::configuration("Serial port is not set"));
        }
        if self.baud_rate == 0 {
            return Err(IoError::configuration("Baud rate must be non-zero"));
        }
        data_bits(self.data_bits)?;
        stop_bits(self.stop_bits)?;
        parity(&self.parity)?;
        Ok(())
    }
}

/// List serial ports present on this machine
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (port_type, manufacturer, product, serial_number) = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    ("usb".to_string(), usb.manufacturer, usb.product, usb.serial_number)
                }
                serialport::SerialPortType::BluetoothPort => ("bluetooth".to_string(), None, None, None),
                serialport::SerialPortType::PciPort => ("pci".to_string(), None, None, None),
                serialport::SerialPortType::Unknown => ("unknown".to_string(), None, None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
            }
        })
        .collect())
}

// ============================================================================
// Transport
// ============================================================================

/// `Transport` over a real serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(settings: &SerialSettings) -> Result<Self, IoError> {
        settings.validate()?;
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits)?)
            .stop_bits(stop_bits(settings.stop_bits)?)
            .parity(parity(&settings.parity)?)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| IoError::Transport {
                message: format!("{}: {}", settings.port, e),
                fatal: true,
            })?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, IoError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.port.bytes_to_read()? > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(READABLE_POLL_INTERVAL);
        }
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        match self.port.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, IoError> {
        self.port.set_timeout(timeout)?;
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        self.port.flush()?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), IoError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>, IoError> {
        Ok(Box::new(SerialTransport {
            port: self.port.try_clone()?,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================
