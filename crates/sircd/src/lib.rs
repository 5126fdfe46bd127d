//! Daemon-side plumbing: the multiplexed TCP server, the text command
//! protocol, control arbitration, and process housekeeping.

pub mod commands;
pub mod control;
pub mod pidfile;
pub mod server;

pub use commands::{RadioEventBridge, SirServer, DEFAULT_CHANNEL};
pub use control::{AcquireOutcome, ControlArbiter};
pub use pidfile::PidFile;
pub use server::{Server, ServerHandler, CLIENT_BUF_SIZE};
