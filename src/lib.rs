//! Host-side communications core for a Smoothie-class motion controller.
//!
//! Owns a single duplex link to the controller — a serial port or a raw TCP
//! socket — and implements the line-oriented request/response protocol used
//! to send G-code, stream job files with flow control, and parse the
//! asynchronous status, temperature and alarm reports the device sends back.
//!
//! The core does not interpret G-code semantics, does not buffer completed
//! artifacts, does not persist state across runs, and does not attempt
//! reconnection. Port enumeration, windowing, and pendant HID drivers are
//! external collaborators that sit above the [`AppCallbacks`] / [`SessionHandle`]
//! boundary this crate exposes.
//!
//! # Example
//! ```no_run
//! use smoothie_comms::{ConnectionDescriptor, SessionConfig, SessionHandle, AppCallbacks};
//!
//! struct Printer;
//! impl AppCallbacks for Printer {
//!     fn connected(&mut self) { println!("connected"); }
//!     fn disconnected(&mut self) { println!("disconnected"); }
//!     fn stream_finished(&mut self, ok: bool) { println!("stream finished: {ok}"); }
//! }
//!
//! # async fn example() -> smoothie_comms::CommsResult<()> {
//! let descriptor: ConnectionDescriptor = "serial:///dev/ttyACM0".parse()?;
//! let handle = SessionHandle::connect(descriptor, SessionConfig::default(), Box::new(Printer));
//! handle.stream_gcode("job.gcode".into(), Box::new(|_linecnt| {}));
//! handle.stop();
//! # Ok(())
//! # }
//! ```

use std::num::ParseIntError;
use std::str::Utf8Error;

use thiserror::Error;

pub mod api;
pub mod callbacks;
pub mod config;
pub mod demux;
pub mod flow_control;
pub mod parsers;
pub mod reassembler;
pub mod reports;
pub mod session;
pub mod streaming;
pub(crate) mod transport;

pub use api::SessionHandle;
pub use callbacks::AppCallbacks;
pub use config::{ConnectionDescriptor, SessionConfig};
pub use reports::{PositionReport, StatusReport, TemperatureReport};

/// Errors surfaced by the comms core.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error("malformed {kind} report: {detail}")]
    ParseError { kind: &'static str, detail: String },
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
    #[error("connection lost")]
    ConnectionLost,
    #[error("not connected")]
    NotConnected,
    #[error("timed out waiting for response")]
    Timeout,
}

pub type CommsResult<T> = std::result::Result<T, Error>;
