//! Custom error types for the driver.
//!
//! This module defines the primary error type, `PsuError`, for the whole crate.
//! Using the `thiserror` crate, it gives every layer (transport, codec, engine,
//! session) one consistent failure vocabulary.
//!
//! ## Error Hierarchy
//!
//! - **`Enumeration`**: the OS facility for listing serial ports could not be queried.
//! - **`Transport`**: wraps [`TransportError`], covering writes with no open port,
//!   OS-level I/O failures and bounded waits that expired.
//! - **`NoGetter` / `NoSetter`**: protocol misuse, i.e. querying or pushing a property
//!   that has no such command.
//! - **`Decode`**: bytes that could not be turned into a value and for which no
//!   previous value of the right kind exists to fall back to.
//! - **`InvalidValue`**: a collaborator assigned a value of the wrong kind.
//!
//! Explicit `get` calls surface these to the caller. Pushes (`set`) swallow
//! `Transport` and `Busy` failures so the local setpoint survives a
//! disconnected or congested device.

use crate::property::{PropertyId, ValueKind};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type PsuResult<T> = std::result::Result<T, PsuError>;

#[derive(Error, Debug)]
pub enum PsuError {
    #[error("Serial port enumeration failed: {0}")]
    Enumeration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No getter for property '{0}'")]
    NoGetter(PropertyId),

    #[error("No setter for property '{0}'")]
    NoSetter(PropertyId),

    #[error("Failed to decode reply to '{command}': {reason}")]
    Decode { command: String, reason: String },

    #[error("Property '{property}' expects a {expected} value")]
    InvalidValue {
        property: PropertyId,
        expected: ValueKind,
    },

    #[error("Command engine busy for longer than {0:?}")]
    Busy(Duration),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl PsuError {
    pub(crate) fn decode(command: &str, reason: impl Into<String>) -> Self {
        PsuError::Decode {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the failure came from the link rather than from protocol misuse.
    pub fn is_transport(&self) -> bool {
        matches!(self, PsuError::Transport(_))
    }
}

/// Failures of the byte-level link.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port not connected")]
    NotConnected,

    #[error("Failed to open serial port '{port}': {reason}")]
    Open { port: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PsuError::NoGetter(PropertyId::Output);
        assert_eq!(err.to_string(), "No getter for property 'output'");

        let err = PsuError::from(TransportError::NotConnected);
        assert_eq!(err.to_string(), "Transport error: Serial port not connected");
        assert!(err.is_transport());
    }

    #[test]
    fn test_invalid_value_names_kind() {
        let err = PsuError::InvalidValue {
            property: PropertyId::SetVoltage,
            expected: ValueKind::Decimal,
        };
        assert!(err.to_string().contains("decimal"));
        assert!(!err.is_transport());
    }
}
