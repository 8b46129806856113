/*
 * Copyright 2020 Joyent, Inc.
 */

use std::error;
use std::time::Duration;

use crate::error::Error;
use crate::server::ServerInfo;

/// The Thrift wire protocol the factory should speak when establishing a
/// client connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Binary,
    Compact,
    Json,
    Tuple,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Binary
    }
}

/// Pool connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in the connection pool. A connection need not be
/// limited to a TCP socket, but could be any logical notion of a client
/// session that implements the `Connection` trait. For a Thrift client this
/// is typically a transport plus a protocol plus one or more generated
/// service stubs.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the `close` function. This is an
    /// associated type for the trait meaning each specific implementation of
    /// the `Connection` trait may choose the appropriate concrete error type
    /// to return. The only constraint applied is that the selected error
    /// type must implement the
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait
    /// from the standard library.
    type Error: error::Error;
    /// Close the underlying transport. The pool invokes this at most once
    /// per connection; implementations must tolerate a close of an already
    /// dead transport.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// A connection that multiplexes several named service clients over one
/// transport.
///
/// Implementing this trait lets callers reach an individual stub through
/// `PooledConnection::client_named`. The name to stub mapping is prepared by
/// the `ConnectionFactory` when the connection is created.
pub trait Multiplexed: Connection {
    /// The user-facing client stub type.
    type Client;
    /// Look up the stub registered under `name`, if any.
    fn client(&mut self, name: &str) -> Option<&mut Self::Client>;
}

/// The factory the pool invokes to turn a server descriptor into a live
/// client connection.
///
/// The factory captures whatever application-level configuration is required
/// to build a client. *e.g.* a single-service factory holds one stub
/// constructor while a multiplexed factory holds a map of service name to
/// stub constructor. The pool calls `create` from its watcher threads
/// concurrently, so implementations must be thread-safe.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type produced by this factory.
    type Connection: Connection;

    /// Attempt to establish a connection to `server`, bounded by
    /// `connect_timeout` and speaking `protocol` on the wire. On failure
    /// return [`Error::ConnectionCreate`](../error/enum.Error.html).
    fn create(
        &self,
        server: &ServerInfo,
        connect_timeout: Duration,
        protocol: Protocol,
    ) -> Result<Self::Connection, Error>;
}

/// An application-supplied check that an existing connection is still
/// usable. The pool runs the probe on connections flagged as possibly
/// broken by their last borrower and on idle connections whose test period
/// has elapsed. When no probe is configured every check passes.
pub trait LivenessProbe: Send + Sync + 'static {
    /// The connection type this probe understands.
    type Connection: Connection;

    /// Return true if the connection can still be used for calls.
    fn is_alive(&self, conn: &mut Self::Connection) -> bool;
}
