/*
 * Copyright 2020 Joyent, Inc.
 */

use std::error;
use std::fmt;

/// The error type shared by all pool operations.
#[derive(Debug)]
pub enum Error {
    /// The pool configuration failed validation.
    ConfigInvalid(String),
    /// Every configured server was dropped during eager initialization.
    NoServersAvailable,
    /// The connection factory failed to establish a connection.
    ConnectionCreate(String),
    /// The creation retry policy was exhausted without producing a
    /// connection.
    ConnectionAcquireFailed(String),
    /// A blocking acquisition did not obtain a connection within the
    /// configured timeout.
    AcquisitionTimeout,
    /// A blocking operation was cancelled because a peer thread died while
    /// holding a pool lock.
    Interrupted,
    /// The pool has been closed; no further acquisitions are possible.
    PoolClosed,
    /// A liveness probe reported the connection unusable.
    LivenessFailed,
    /// Internal accounting reached a state that should be impossible.
    InternalInvariant(String),
    IoError(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IoError(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConfigInvalid(err_str) => {
                write!(fmt, "invalid pool configuration: {}", err_str)
            }
            Error::NoServersAvailable => {
                "no thrift servers available".fmt(fmt)
            }
            Error::ConnectionCreate(err_str) => {
                write!(fmt, "failed to create connection: {}", err_str)
            }
            Error::ConnectionAcquireFailed(err_str) => {
                write!(fmt, "failed to acquire connection: {}", err_str)
            }
            Error::AcquisitionTimeout => {
                "timed out waiting for a free connection".fmt(fmt)
            }
            Error::Interrupted => "interrupted".fmt(fmt),
            Error::PoolClosed => "connection pool is closed".fmt(fmt),
            Error::LivenessFailed => {
                "connection failed its liveness probe".fmt(fmt)
            }
            Error::InternalInvariant(err_str) => {
                write!(fmt, "internal pool invariant violated: {}", err_str)
            }
            Error::IoError(io_err) => io_err.fmt(fmt),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(io_err) => Some(io_err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let e = Error::ConnectionCreate(String::from("connection refused"));
        assert_eq!(
            format!("{}", e),
            "failed to create connection: connection refused"
        );
        assert_eq!(format!("{}", Error::PoolClosed), "connection pool is closed");
    }
}
