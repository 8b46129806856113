// Copyright 2020 Joyent, Inc.

//! A partitioned client-side connection pool for Thrift RPC services
//!
//! This crate multiplexes a bounded set of long-lived Thrift client
//! connections across a fleet of servers. Application threads acquire a
//! ready-to-use client, issue calls on it, and hand it back by dropping the
//! guard; the pool keeps enough connections warm that both directions cost
//! well under a millisecond. The pool relies on two primary traits to stay
//! independent of any particular transport or generated client code. These
//! are the [`ConnectionFactory`](connection/trait.ConnectionFactory.html)
//! trait and the [`Connection`](connection/trait.Connection.html) trait.
//!
//! ## Connections
//!
//! A *connection* here is not just a TCP socket. It is whatever bundle the
//! application considers a usable client: typically a Thrift transport, a
//! wire protocol, and one or more generated service stubs. Anything that
//! can be closed can participate; the pool never looks inside. Connections
//! that multiplex several named services over one transport can
//! additionally implement
//! [`Multiplexed`](connection/trait.Multiplexed.html) so callers can reach
//! an individual stub by service name.
//!
//! ## Connection factories
//!
//! The pool turns a [`ServerInfo`](server/struct.ServerInfo.html) into a
//! live connection through a user-supplied
//! [`ConnectionFactory`](connection/trait.ConnectionFactory.html). The
//! factory captures the application-level configuration required to build
//! a client -- which stub constructors to use, credentials, transport
//! framing -- while the pool hands it the server address, the connect
//! timeout, and the wire [`Protocol`](connection/enum.Protocol.html) from
//! its own options.
//!
//! Optionally an application may also provide a
//! [`LivenessProbe`](connection/trait.LivenessProbe.html). The pool runs
//! the probe against connections a caller has flagged with
//! `mark_possibly_broken` and against idle connections on a configurable
//! period, discarding the ones that fail. Without a probe every check
//! passes.
//!
//! ## Partitions and the watcher
//!
//! The pool keeps one *partition* per configured server: a bounded FIFO of
//! free connections plus the connection accounting for that server.
//! Acquisition uses thread affinity with fall-through -- each caller
//! thread is mapped to a home partition, scans the others in index order
//! when its home is empty, and only blocks when every partition is dry.
//! Contention is therefore per-server rather than global.
//!
//! Each partition is serviced by a *watcher* thread. Acquisitions and
//! releases that observe availability at or below the configured
//! percentage threshold post a coalescing signal; the watcher wakes,
//! re-reads the counters, and creates connections in small batches until
//! the partition is back above the threshold and at least at its
//! configured floor. Creation failures are retried on a fixed schedule,
//! and a server that keeps refusing connections is latched as down until
//! a create succeeds again.
//!
//! ## Reapers
//!
//! Two periodic actors retire connections: an idle reaper closes
//! connections that have sat unused beyond their idle TTL (and probes the
//! rest on the liveness test period), and an age reaper closes connections
//! that exceed their absolute maximum age. Borrowed connections are never
//! closed in place; an expired borrowed connection is retired when its
//! holder releases it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::thread;
//!
//! use thrift_pool::connection_pool::types::PoolOptions;
//! use thrift_pool::connection_pool::ThriftConnectionPool;
//! use thrift_pool::server::ServerInfo;
//!
//! let options = PoolOptions {
//!     servers: vec![
//!         ServerInfo::new("10.0.0.1", 9090),
//!         ServerInfo::new("10.0.0.2", 9090),
//!     ],
//!     max_connections_per_server: Some(8),
//!     min_connections_per_server: Some(2),
//!     connection_timeout_ms: Some(1000),
//!     ..Default::default()
//! };
//!
//! let pool = ThriftConnectionPool::new(options, EchoFactory, None)?;
//!
//! for _ in 0..10 {
//!     let pool = pool.clone();
//!     thread::spawn(move || {
//!         let mut conn = pool.get_connection()?;
//!         conn.client().echo("hello")?;
//!         // The connection returns to the pool when the guard drops.
//!     });
//! }
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod server;
