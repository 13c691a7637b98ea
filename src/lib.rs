//! Core library for the rust_psu driver.
//!
//! This library talks to KORAD-style bench power supplies over a serial
//! link and keeps an in-memory mirror of the instrument's state. It is used
//! by the `rust_psu` command-line tool and can be embedded in any UI or
//! automation program that needs to read or drive a supply.
//!
//! The layers, bottom-up:
//! - [`transport`]: the byte link (serial port or any attached stream) and its inbound buffer
//! - [`codec`]: ASCII command encoding and reply decoding
//! - [`property`]: property definitions and the [`property::PropertyStore`] mirror
//! - [`engine`]: the single-flight command engine
//! - [`sync`]: the update-when-on cycle, initial sync and background poller
//! - [`session`]: the collaborator surface tying it all together

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod property;
pub mod session;
pub mod sync;
pub mod transport;

pub use engine::{EngineSettings, EngineState};
pub use error::{PsuError, PsuResult, TransportError};
pub use property::{PropertyId, Snapshot, StatusRecord, Value, ValueKind};
pub use session::{PsuSession, SessionSettings};
