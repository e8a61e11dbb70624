// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy shared by the advertisement and transport layers.
//!
//! Backend-specific failures are mapped into this taxonomy once, at the
//! backend seam; everything above it (publisher, subscriber, SRPL glue,
//! DSO agent) speaks only these variants. The type is `Clone` because a
//! single registration result may be fanned out to several chained
//! completion callbacks.

use std::fmt;

/// Errors produced by the advertisement and DSO transport subsystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Caller errors
    // ========================================================================
    /// Malformed input: oversized TXT entry, wrong address size, bad name.
    InvalidArgs(String),

    /// Operation issued before the component is ready for it.
    InvalidState(&'static str),

    /// No such registration, connection, or subscription.
    NotFound,

    // ========================================================================
    // Asynchronous outcomes
    // ========================================================================
    /// Name collision reported by the mDNS responder.
    Duplicated,

    /// The operation is not supported by the active backend.
    NotImplemented,

    /// The pending operation was torn down before it could complete.
    Aborted,

    /// Resolution or registration timed out.
    Timeout,

    // ========================================================================
    // Lower layers
    // ========================================================================
    /// Failure inside the mDNS backend.
    Mdns(String),

    /// DSO transport failure (socket level).
    Failed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgs(msg) => write!(f, "invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::NotFound => write!(f, "not found"),
            Error::Duplicated => write!(f, "name duplicated"),
            Error::NotImplemented => write!(f, "not implemented"),
            Error::Aborted => write!(f, "operation aborted"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Mdns(msg) => write!(f, "mDNS backend error: {}", msg),
            Error::Failed(msg) => write!(f, "transport failure: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Failed(e.to_string())
    }
}

/// Convenient alias for results using the crate-wide [`Error`] type.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_covers_detail() {
        let e = Error::InvalidArgs("txt entry too long".into());
        assert_eq!(e.to_string(), "invalid argument: txt entry too long");

        let e = Error::Mdns("daemon exited".into());
        assert!(e.to_string().contains("daemon exited"));
    }

    #[test]
    fn test_io_error_maps_to_failed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        match Error::from(io) {
            Error::Failed(msg) => assert!(msg.contains("refused")),
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn test_clone_and_eq() {
        let e = Error::Duplicated;
        assert_eq!(e.clone(), Error::Duplicated);
        assert_ne!(Error::Aborted, Error::Timeout);
    }
}
