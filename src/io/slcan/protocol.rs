// src/io/slcan/protocol.rs
//
// Adapter handshake and teardown.
//
//   S<code>\r   set CAN bit rate
//   O\r         open channel
//   C\r         close channel
//
// The adapter answers commands with \r (ACK) or BEL (NACK).

use std::time::{Duration, Instant};

use crate::io::{IoError, Transport};

// ============================================================================
// Constants
// ============================================================================

pub const ACK: u8 = b'\r';
pub const NACK: u8 = 0x07;

/// slcan bitrate codes. Code 7 is listed under both 800 kbit/s and the
/// 8 Mbit/s key some host tools use for it.
const SLCAN_BITRATES: [(u32, u8); 10] = [
    (10_000, 0),    // 10 Kbit/s
    (20_000, 1),    // 20 Kbit/s
    (50_000, 2),    // 50 Kbit/s
    (100_000, 3),   // 100 Kbit/s
    (125_000, 4),   // 125 Kbit/s
    (250_000, 5),   // 250 Kbit/s
    (500_000, 6),   // 500 Kbit/s
    (800_000, 7),   // 800 Kbit/s
    (8_000_000, 7), // legacy key for code 7
    (1_000_000, 8), // 1 Mbit/s
];

// ============================================================================
// Types
// ============================================================================

/// Adapter control commands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterCommand {
    SetBitrate(u8),
    OpenChannel,
    CloseChannel,
}

impl AdapterCommand {
    /// Command text without the terminator
    pub fn text(&self) -> String {
        match self {
            AdapterCommand::SetBitrate(code) => format!("S{}", code),
            AdapterCommand::OpenChannel => "O".to_string(),
            AdapterCommand::CloseChannel => "C".to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.text().into_bytes();
        bytes.push(b'\r');
        bytes
    }
}

/// Delays used while bringing the adapter up
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HandshakeTiming {
    /// Pause before discarding stale input, before and after the handshake
    pub settle_delay: Duration,
    /// Overall wait for one ACK/NACK byte
    pub ack_timeout: Duration,
}

impl Default for HandshakeTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Find the slcan bitrate code for a given bitrate
pub fn find_bitrate_code(bitrate: u32) -> Result<u8, IoError> {
    SLCAN_BITRATES
        .iter()
        .find(|(rate, _)| *rate == bitrate)
        .map(|(_, code)| *code)
        .ok_or_else(|| {
            let valid: Vec<String> = SLCAN_BITRATES.iter().map(|(r, _)| format!("{}", r)).collect();
            IoError::configuration(format!(
                "Invalid CAN bitrate {}. Valid bitrates: {}",
                bitrate,
                valid.join(", ")
            ))
        })
}

fn send_command(transport: &mut dyn Transport, command: AdapterCommand) -> Result<(), IoError> {
    transport.write_all(&command.encode())?;
    transport.flush()
}

/// Read single bytes until ACK, NACK or `timeout`. Other bytes are adapter
/// chatter and are dropped.
pub fn wait_for_ack(
    transport: &mut dyn Transport,
    command: AdapterCommand,
    timeout: Duration,
) -> Result<(), IoError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match transport.read_byte(remaining)? {
            Some(ACK) => return Ok(()),
            Some(NACK) => return Err(IoError::ProtocolNack { command: command.text() }),
            Some(_) if !remaining.is_zero() => continue,
            _ => {
                return Err(IoError::ProtocolTimeout {
                    command: command.text(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

fn discard_stale_input(transport: &mut dyn Transport, settle_delay: Duration) -> Result<(), IoError> {
    std::thread::sleep(settle_delay);
    transport.discard_input()
}

// ============================================================================
// Handshake
// ============================================================================

/// Bring the adapter up: set the bit rate and open the channel, each
/// confirmed by an ACK.
pub fn init_adapter(
    transport: &mut dyn Transport,
    bitrate: u32,
    timing: &HandshakeTiming,
) -> Result<(), IoError> {
    let code = find_bitrate_code(bitrate)?;

    discard_stale_input(transport, timing.settle_delay)?;

    let set_bitrate = AdapterCommand::SetBitrate(code);
    send_command(transport, set_bitrate)?;
    wait_for_ack(transport, set_bitrate, timing.ack_timeout)?;

    send_command(transport, AdapterCommand::OpenChannel)?;
    wait_for_ack(transport, AdapterCommand::OpenChannel, timing.ack_timeout)?;

    // Some adapters print a banner right after opening
    discard_stale_input(transport, timing.settle_delay)
}

/// Close the channel. Never waits for an answer: the adapter may already be gone.
pub fn stop_adapter(transport: &mut dyn Transport) -> Result<(), IoError> {
    send_command(transport, AdapterCommand::CloseChannel)
}

// ============================================================================
// Tests
// ============================================================================
