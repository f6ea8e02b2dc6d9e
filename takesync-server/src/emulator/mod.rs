//! In-process stand-ins for the hardware.
//!
//! [`RecorderEmulator`] is a TCP server that speaks the recorder protocol,
//! and [`EmulatedCapture`] plays the capture controller, its process and its API.
//! The test suite runs against them, and so does the binary with `--emulate`.

mod capture;
mod recorder;

pub use capture::EmulatedCapture;
pub use recorder::{unused_port, RecorderEmulator};
