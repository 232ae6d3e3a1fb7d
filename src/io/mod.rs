// src/io/mod.rs
//
// Shared CAN types, host clock helpers and the driver trait implemented by
// the SLCAN facade.

mod error;
pub mod slcan;
pub mod timestamp;
pub mod transport;

pub use error::IoError;
pub use slcan::{DriverOptions, SessionOutcome, SlcanDriver};
pub use timestamp::{EstimatorParams, TimestampEstimator};
pub use transport::{SerialSettings, SerialTransport, Transport};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ============================================================================
// CAN Frame
// ============================================================================

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;
/// Mask for standard (11-bit) CAN ID
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Mask for extended (29-bit) CAN ID
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Classic CAN frame.
///
/// Timestamps are only attached on the receive path, in seconds on the
/// monotonic (see [`monotonic_now`]) and wall-clock (UNIX epoch) host clocks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCanFrame")]
pub struct CanFrame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
    #[serde(skip_serializing_if = "Option::is_none", default)]
    ts_monotonic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    ts_real: Option<f64>,
}

impl CanFrame {
    /// Build a frame, checking the payload length and the identifier width.
    pub fn new(id: u32, data: &[u8], extended: bool) -> Result<Self, IoError> {
        if data.len() > CAN_MAX_DLEN {
            return Err(IoError::invalid_frame(format!(
                "payload too long: {} bytes (max {})",
                data.len(),
                CAN_MAX_DLEN
            )));
        }
        let mask = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if id & !mask != 0 {
            return Err(IoError::invalid_frame(format!(
                "identifier 0x{:X} does not fit a {} frame",
                id,
                if extended { "29-bit extended" } else { "11-bit standard" }
            )));
        }

        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            extended,
            len: data.len() as u8,
            data: buf,
            ts_monotonic: None,
            ts_real: None,
        })
    }

    /// Same frame stamped with host-domain receive timestamps.
    pub fn with_timestamps(mut self, ts_monotonic: f64, ts_real: f64) -> Self {
        self.ts_monotonic = Some(ts_monotonic);
        self.ts_real = Some(ts_real);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn dlc(&self) -> u8 {
        self.len
    }

    pub fn ts_monotonic(&self) -> Option<f64> {
        self.ts_monotonic
    }

    pub fn ts_real(&self) -> Option<f64> {
        self.ts_real
    }

}

/// Wire shape of a serialized frame. Deserialization goes through
/// [`CanFrame::new`] so the length and identifier checks always apply.
#[derive(Deserialize)]
struct RawCanFrame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
    #[serde(default)]
    ts_monotonic: Option<f64>,
    #[serde(default)]
    ts_real: Option<f64>,
}

impl TryFrom<RawCanFrame> for CanFrame {
    type Error = IoError;

    fn try_from(raw: RawCanFrame) -> Result<Self, IoError> {
        let payload = raw.data.get(..raw.len as usize).ok_or_else(|| {
            IoError::invalid_frame(format!(
                "payload too long: {} bytes (max {})",
                raw.len, CAN_MAX_DLEN
            ))
        })?;
        let mut frame = CanFrame::new(raw.id, payload, raw.extended)?;
        frame.ts_monotonic = raw.ts_monotonic;
        frame.ts_real = raw.ts_real;
        Ok(frame)
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.len)?;
        for byte in self.data() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

// ============================================================================
// Host clocks
// ============================================================================

static MONOTONIC_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds on the host monotonic clock, counted from the first use in this process
pub fn monotonic_now() -> f64 {
    MONOTONIC_EPOCH.elapsed().as_secs_f64()
}

/// Seconds since the UNIX epoch on the host wall clock
pub fn wall_clock_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================================================
// Driver trait
// ============================================================================

/// Direction of a frame passing through a driver, reported to IO hooks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    Rx,
    Tx,
}

/// Callback observing every frame received or sent by a driver
pub type IoHook = Box<dyn Fn(FrameDirection, &CanFrame) + Send>;

/// Handle returned by [`CanDriver::add_io_hook`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(pub(crate) u64);

/// Generic CAN driver contract.
pub trait CanDriver {
    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing arrived.
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, IoError>;

    /// Queue a frame for transmission.
    fn send(&mut self, id: u32, payload: &[u8], extended: bool) -> Result<(), IoError>;

    /// Register a hook called for every frame received or sent.
    fn add_io_hook(&mut self, hook: IoHook) -> HookId;

    /// Remove a previously registered hook. Returns false if it was unknown.
    fn remove_io_hook(&mut self, id: HookId) -> bool;
}
