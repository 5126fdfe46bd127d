//! Minimal serial-port abstraction.
//!
//! One object-safe trait with timed byte-pipe operations, a POSIX termios
//! implementation for real hardware, and a replay implementation that plays
//! a scripted peer for tests. Callers hold the port behind
//! `Box<dyn SerialPort>` so drivers are swappable at runtime.

#[cfg(unix)]
mod posix;
mod replay;

use std::time::Duration;

#[cfg(unix)]
pub use posix::PosixSerialPort;
pub use replay::{replay_pair, ReplayHandle, ReplayPort};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("serial device is not valid or does not exist")]
    InvalidPort,
    #[error("serial device is already in use")]
    PortInUse,
    #[error("settings are not valid for the device")]
    InvalidSettings,
    #[error("error during data transmission")]
    TransmitError,
    #[error("error during data reception")]
    ReceiveError,
    #[error("operation timed out")]
    Timeout,
    #[error("unspecified serial error")]
    Unspecified,
}

/// A byte pipe with timed blocking reads and writes.
///
/// `recv` returns `Err(SerialError::Timeout)` when no byte arrives within
/// the timeout; any other error is a real reception failure.
pub trait SerialPort: Send {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, SerialError>;
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError>;
    fn set_data_rate(&mut self, baud: u32) -> Result<(), SerialError>;
    fn close(&mut self);
}
