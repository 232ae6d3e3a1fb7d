// src/io/slcan/mod.rs
//
// slcan (Serial Line CAN) driver for CANable, CANable Pro, and other
// USB-CAN adapters using the Lawicel/slcan ASCII protocol.
//
// Protocol reference: http://www.can232.com/docs/can232_v3.pdf

pub mod codec;
mod driver;
pub mod protocol;
mod session;
mod worker;

pub use codec::{DecodedFrame, FrameDecoder, SlcanCodec};
pub use driver::SlcanDriver;
pub use protocol::{find_bitrate_code, AdapterCommand, HandshakeTiming};
pub use session::{
    DriverOptions, SessionOutcome, SessionState, DEFAULT_INIT_TIMEOUT, DEFAULT_RX_QUEUE_CAPACITY,
    DEFAULT_TX_QUEUE_CAPACITY,
};
