// src/config.rs
//
// Driver configuration, loadable from TOML. Every field except the port has
// a default, so a minimal file is just `port = "/dev/ttyACM0"`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::io::slcan::{find_bitrate_code, DriverOptions, HandshakeTiming};
use crate::io::{EstimatorParams, IoError, SerialSettings};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlcanConfig {
    /// Serial port path (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    /// CAN bus bit rate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Serial line baud rate (ignored by USB CDC adapters)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_max_adapter_clock_rate_error_ppm")]
    pub max_adapter_clock_rate_error_ppm: f64,
    /// Seconds
    #[serde(default = "default_fixed_rx_delay")]
    pub fixed_rx_delay: f64,
    /// Seconds
    #[serde(default = "default_max_estimated_rx_delay_to_resync")]
    pub max_estimated_rx_delay_to_resync: f64,
    /// Seconds
    #[serde(default = "default_init_timeout")]
    pub init_timeout: f64,
    /// Seconds
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: f64,
    #[serde(default = "default_rx_queue_capacity")]
    pub rx_queue_capacity: usize,
    #[serde(default = "default_tx_queue_capacity")]
    pub tx_queue_capacity: usize,
}

fn default_bitrate() -> u32 {
    1_000_000
}
fn default_baud_rate() -> u32 {
    3_000_000
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_max_adapter_clock_rate_error_ppm() -> f64 {
    200.0
}
fn default_fixed_rx_delay() -> f64 {
    0.0002
}
fn default_max_estimated_rx_delay_to_resync() -> f64 {
    0.1
}
fn default_init_timeout() -> f64 {
    5.0
}
fn default_ack_timeout() -> f64 {
    0.5
}
fn default_rx_queue_capacity() -> usize {
    crate::io::slcan::DEFAULT_RX_QUEUE_CAPACITY
}
fn default_tx_queue_capacity() -> usize {
    crate::io::slcan::DEFAULT_TX_QUEUE_CAPACITY
}

/// Longest accepted init/ACK timeout, in seconds
const MAX_TIMEOUT_SECS: f64 = 3600.0;

/// Seconds from the config file as a timeout, within (0, MAX_TIMEOUT_SECS].
fn timeout(name: &str, secs: f64) -> Result<Duration, IoError> {
    if !(secs > 0.0 && secs <= MAX_TIMEOUT_SECS) {
        return Err(IoError::configuration(format!(
            "{} must be between 0 and {} seconds, got {}",
            name, MAX_TIMEOUT_SECS, secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| IoError::configuration(format!("{}: {}", name, e)))
}

impl SlcanConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            bitrate: default_bitrate(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
            max_adapter_clock_rate_error_ppm: default_max_adapter_clock_rate_error_ppm(),
            fixed_rx_delay: default_fixed_rx_delay(),
            max_estimated_rx_delay_to_resync: default_max_estimated_rx_delay_to_resync(),
            init_timeout: default_init_timeout(),
            ack_timeout: default_ack_timeout(),
            rx_queue_capacity: default_rx_queue_capacity(),
            tx_queue_capacity: default_tx_queue_capacity(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, IoError> {
        let config: SlcanConfig = toml::from_str(s)
            .map_err(|e| IoError::configuration(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, IoError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IoError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), IoError> {
        self.serial_settings().validate()?;
        find_bitrate_code(self.bitrate)?;
        timeout("init_timeout", self.init_timeout)?;
        timeout("ack_timeout", self.ack_timeout)?;
        if !self.max_estimated_rx_delay_to_resync.is_finite()
            || self.max_estimated_rx_delay_to_resync <= 0.0
        {
            return Err(IoError::configuration(
                "max_estimated_rx_delay_to_resync must be positive",
            ));
        }
        for (name, value) in [
            ("fixed_rx_delay", self.fixed_rx_delay),
            ("max_adapter_clock_rate_error_ppm", self.max_adapter_clock_rate_error_ppm),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(IoError::configuration(format!("{} must not be negative", name)));
            }
        }
        if self.rx_queue_capacity == 0 || self.tx_queue_capacity == 0 {
            return Err(IoError::configuration("Queue capacities must be non-zero"));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity.clone(),
        }
    }

    /// Runtime options for the session. Validates first.
    pub fn driver_options(&self) -> Result<DriverOptions, IoError> {
        self.validate()?;
        Ok(DriverOptions {
            bitrate: self.bitrate,
            handshake: HandshakeTiming {
                ack_timeout: timeout("ack_timeout", self.ack_timeout)?,
                ..HandshakeTiming::default()
            },
            init_timeout: timeout("init_timeout", self.init_timeout)?,
            estimator: EstimatorParams {
                max_rate_error: self.max_adapter_clock_rate_error_ppm / 1e6,
                fixed_delay: self.fixed_rx_delay,
                max_phase_error_to_resync: self.max_estimated_rx_delay_to_resync,
                ..EstimatorParams::default()
            },
            rx_queue_capacity: self.rx_queue_capacity,
            tx_queue_capacity: self.tx_queue_capacity,
        })
    }
}
