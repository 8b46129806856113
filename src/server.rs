// Copyright 2020 Joyent, Inc.

use std::fmt;

/// The port number for a Thrift server. This is a type alias for u16.
pub type ServerPort = u16;
/// The host name or address of a Thrift server. This is a type alias for
/// String.
pub type ServerHost = String;

/// A type representing one configured Thrift server. Two `ServerInfo`
/// instances denote the same server exactly when both the host and the port
/// are equal.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServerInfo {
    /// The host name or address of the server.
    pub host: ServerHost,
    /// The port of the server.
    pub port: ServerPort,
}

impl ServerInfo {
    /// Return a new instance of `ServerInfo` given a host and a port.
    pub fn new(host: &str, port: ServerPort) -> Self {
        ServerInfo {
            host: String::from(host),
            port,
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_identity_is_pair_equality() {
        let a = ServerInfo::new("10.0.0.1", 9090);
        let b = ServerInfo::new("10.0.0.1", 9090);
        let c = ServerInfo::new("10.0.0.1", 9091);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{}", a), "10.0.0.1:9090");
    }
}
