//! # Takesync Core
//!
//! Platform-independent protocol and link state library for synchronised
//! motion-capture and tape-recorder takes.
//!
//! This crate contains pure parsing and state machine logic with **zero I/O
//! dependencies**. All sockets, timers and process scanning live in
//! `takesync-server`, which drives the types defined here.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  takesync-core (platform-independent, no tokio/async deps)  │
//! │  ├── protocol/   (recorder reply framing & command text)    │
//! │  ├── connection  (link state enums & bookkeeping)           │
//! │  ├── backoff     (reconnect policy & adaptive intervals)    │
//! │  ├── tracking    (process identity & capture name edges)    │
//! │  └── endpoint    (device records & reconciliation plans)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  takesync-server        │
//!                 │  (tokio engines/links)  │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`protocol`] - Reply classification, multi-line framing, command formatting
//! - [`connection`] - Connection state machine with failure accounting
//! - [`backoff`] - Exponential reconnect delays and adaptive probe cadence
//! - [`tracking`] - Edge detection for process restarts and capture names
//! - [`endpoint`] - Declarative device list and the reconcile planner
//!
//! ## Example: Classifying a Reply
//!
//! ```rust
//! use takesync_core::protocol::{ReplyClass, ResponseAssembler};
//!
//! let mut assembler = ResponseAssembler::new();
//! assert!(assembler.push("208 transport info:").unwrap().is_none());
//! assert!(assembler.push("status: record").unwrap().is_none());
//! let reply = assembler.push("").unwrap().unwrap();
//!
//! assert_eq!(reply.code, 208);
//! assert_eq!(reply.class(), ReplyClass::Success);
//! assert_eq!(reply.field("status"), Some("record"));
//! ```

pub mod backoff;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod tracking;

pub use backoff::{AdaptiveInterval, ReconnectPolicy};
pub use connection::{CaptureState, ConnectionManager, ConnectionState};
pub use endpoint::{DeviceEndpoint, DeviceId, ReconcilePlan};
pub use error::ProtocolError;
pub use protocol::{Clip, ReplyClass, Response, ResponseAssembler};
pub use tracking::{NameTracker, ProcessObservation, ProcessTracker};
