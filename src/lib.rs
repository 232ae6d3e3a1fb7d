// src/lib.rs
//
// Driver for Lawicel/slcan USB-CAN adapters. Frames are exchanged through
// `SlcanDriver`, which runs the serial I/O on background threads and recovers
// adapter hardware timestamps into host clock domains.

#[macro_use]
pub mod logging;
pub mod config;
pub mod io;

pub use config::SlcanConfig;
pub use io::{
    CanDriver, CanFrame, DriverOptions, FrameDirection, HookId, IoError, IoHook, SessionOutcome,
    SlcanDriver,
};
