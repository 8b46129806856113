// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::connection::{Connection, Protocol};
use crate::connection_pool::handle::ConnectionHandle;
use crate::error::Error;
use crate::server::ServerInfo;

// Period at which blocked background actors re-check the shutdown flag.
pub(crate) const SHUTDOWN_RECHECK_MS: u64 = 500;

/// The connection counts for the connection pool
#[derive(Copy, Clone, Debug)]
pub struct PoolStats {
    /// The total number of connections across all partitions, including
    /// connections currently borrowed by callers.
    pub total_connections: ConnectionCount,
    /// The count of idle connections available for acquisition.
    pub idle_connections: ConnectionCount,
}

impl PoolStats {
    /// Create a new instance of `PoolStats`
    pub fn new() -> Self {
        PoolStats {
            total_connections: ConnectionCount::from(0),
            idle_connections: ConnectionCount::from(0),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// Traversal direction used by the idle and age reapers when walking a
/// partition's free queue. Acquisition order is always FIFO regardless of
/// this setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceOrder {
    /// Walk from the head of the free queue (oldest entries first).
    Fifo,
    /// Walk from the tail of the free queue (newest entries first).
    Lifo,
}

impl Default for ServiceOrder {
    fn default() -> Self {
        ServiceOrder::Fifo
    }
}

/// The configuration options for a connection pool. This is required to
/// instantiate a new connection pool.
#[derive(Debug)]
pub struct PoolOptions {
    /// The initial list of Thrift servers. At least one is required.
    pub servers: Vec<ServerInfo>,
    /// An optional maximum number of connections to maintain per server
    /// partition. If not specified the default is 10.
    pub max_connections_per_server: Option<u32>,
    /// An optional floor the watcher fills each partition up to. If not
    /// specified the default is 1.
    pub min_connections_per_server: Option<u32>,
    /// An optional per-connect socket timeout handed to the connection
    /// factory. If not specified the default is 5 seconds.
    pub connect_timeout: Option<Duration>,
    /// The Thrift wire protocol handed to the connection factory. If not
    /// specified the default is the binary protocol.
    pub protocol: Option<Protocol>,
    /// An optional batch size for watcher refills. If not specified the
    /// default is 2.
    pub acquire_increment: Option<u32>,
    /// An optional number of retries per connection creation. If not
    /// specified the default is 3.
    pub acquire_retry_attempts: Option<u32>,
    /// An optional delay between connection creation retries. If not
    /// specified the default is 1 second.
    pub acquire_retry_delay: Option<Duration>,
    /// An optional number of consecutive factory failures after which a
    /// partition's server is latched as down. If not specified the default
    /// is 3.
    pub max_connection_create_failed_count: Option<u32>,
    /// An optional timeout in milliseconds for blocking calls
    /// (`get_connection`) to request a connection from the pool. If not
    /// specified, or specified as zero, the calls will block indefinitely.
    pub connection_timeout_ms: Option<u64>,
    /// An optional idle TTL. A free connection unused for longer than this
    /// is closed by the idle reaper. If not specified idle reaping is
    /// disabled.
    pub idle_max_age: Option<Duration>,
    /// An optional liveness probe period for idle connections. If not
    /// specified idle probing is disabled.
    pub idle_connection_test_period: Option<Duration>,
    /// An optional absolute TTL. A connection older than this is closed by
    /// the age reaper, or on release. If not specified age reaping is
    /// disabled.
    pub max_connection_age: Option<Duration>,
    /// Defer all connection creation until first demand. When set the pool
    /// performs no server probing and no eager fill, and each watcher waits
    /// for its first signal. Defaults to false.
    pub lazy_init: bool,
    /// An optional integer percentage of free/max below which an
    /// acquisition or release posts a refill signal to the watcher. If not
    /// specified the default is 20.
    pub pool_availability_threshold: Option<u32>,
    /// Traversal direction for the reapers. If not specified the default is
    /// FIFO.
    pub service_order: Option<ServiceOrder>,
    /// An optional label appended to background thread names.
    pub pool_name: Option<String>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            servers: Vec::new(),
            max_connections_per_server: None,
            min_connections_per_server: None,
            connect_timeout: None,
            protocol: None,
            acquire_increment: None,
            acquire_retry_attempts: None,
            acquire_retry_delay: None,
            max_connection_create_failed_count: None,
            connection_timeout_ms: None,
            idle_max_age: None,
            idle_connection_test_period: None,
            max_connection_age: None,
            lazy_init: false,
            pool_availability_threshold: None,
            service_order: None,
            pool_name: None,
            log: None,
        }
    }
}

impl PoolOptions {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::ConfigInvalid(String::from(
                "at least one thrift server is required",
            )));
        }
        let max = self.max_connections_per_server.unwrap_or(10);
        let min = self.min_connections_per_server.unwrap_or(1);
        if max == 0 {
            return Err(Error::ConfigInvalid(String::from(
                "max_connections_per_server must be at least 1",
            )));
        }
        if min > max {
            return Err(Error::ConfigInvalid(format!(
                "min_connections_per_server ({}) exceeds \
                 max_connections_per_server ({})",
                min, max
            )));
        }
        if let Some(increment) = self.acquire_increment {
            if increment == 0 {
                return Err(Error::ConfigInvalid(String::from(
                    "acquire_increment must be at least 1",
                )));
            }
        }
        if let Some(threshold) = self.pool_availability_threshold {
            if threshold > 100 {
                return Err(Error::ConfigInvalid(format!(
                    "pool_availability_threshold must be a percentage, \
                     got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }
}

// The free-connection queue of one partition. A bounded FIFO protected by a
// mutex and condition variable pair so acquirers can perform a timed
// blocking poll. The shutdown flag cancels parked waiters.
#[doc(hidden)]
#[derive(Debug)]
pub(crate) struct ProtectedQueue<C> {
    inner: Mutex<QueueInner<C>>,
    condvar: Condvar,
    capacity: usize,
}

#[derive(Debug)]
struct QueueInner<C> {
    handles: VecDeque<ConnectionHandle<C>>,
    shutdown: bool,
}

impl<C> ProtectedQueue<C>
where
    C: Connection,
{
    pub fn new(capacity: usize) -> Self {
        ProtectedQueue {
            inner: Mutex::new(QueueInner {
                handles: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            condvar: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> Result<MutexGuard<QueueInner<C>>, Error> {
        self.inner.lock().map_err(|_| Error::Interrupted)
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.handles.len(),
            Err(poisoned) => poisoned.into_inner().handles.len(),
        }
    }

    /// Non-blocking poll of the queue head.
    pub fn poll(&self) -> Result<Option<ConnectionHandle<C>>, Error> {
        let mut guard = self.lock()?;
        if guard.shutdown {
            return Err(Error::PoolClosed);
        }
        Ok(guard.handles.pop_front())
    }

    /// Non-blocking poll of the queue tail, used by the reapers in LIFO
    /// service order.
    pub fn poll_tail(&self) -> Result<Option<ConnectionHandle<C>>, Error> {
        let mut guard = self.lock()?;
        if guard.shutdown {
            return Err(Error::PoolClosed);
        }
        Ok(guard.handles.pop_back())
    }

    /// Blocking poll with an optional timeout. `None` blocks until a handle
    /// arrives or the queue shuts down. Returns `Ok(None)` on timeout and
    /// `Err(PoolClosed)` if the pool shuts down while waiting.
    pub fn poll_timeout(
        &self,
        m_timeout: Option<Duration>,
    ) -> Result<Option<ConnectionHandle<C>>, Error> {
        let deadline = m_timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock()?;
        loop {
            if guard.shutdown {
                return Err(Error::PoolClosed);
            }
            if let Some(handle) = guard.handles.pop_front() {
                return Ok(Some(handle));
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let wait_result = self
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .map_err(|_| Error::Interrupted)?;
                    guard = wait_result.0;
                }
                None => {
                    guard = self
                        .condvar
                        .wait(guard)
                        .map_err(|_| Error::Interrupted)?;
                }
            }
        }
    }

    /// Non-blocking enqueue at the tail. The handle is handed back to the
    /// caller when the queue cannot accept it: at capacity (which only
    /// happens if connection accounting is broken elsewhere), shut down,
    /// or poisoned. The caller destroys a returned handle.
    pub fn offer(
        &self,
        handle: ConnectionHandle<C>,
    ) -> Result<(), ConnectionHandle<C>> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return Err(handle),
        };
        if guard.shutdown || guard.handles.len() >= self.capacity {
            return Err(handle);
        }
        guard.handles.push_back(handle);
        drop(guard);
        self.condvar.notify_one();
        Ok(())
    }

    /// Non-blocking enqueue at the head, used by the reapers to reinsert
    /// survivors of a tail-first walk. Rejection semantics match `offer`.
    pub fn offer_front(
        &self,
        handle: ConnectionHandle<C>,
    ) -> Result<(), ConnectionHandle<C>> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return Err(handle),
        };
        if guard.shutdown || guard.handles.len() >= self.capacity {
            return Err(handle);
        }
        guard.handles.push_front(handle);
        drop(guard);
        self.condvar.notify_one();
        Ok(())
    }

    /// Remove and return every queued handle. Used by the termination path,
    /// so it works on a shut-down queue and ignores poisoning.
    pub fn drain(&self) -> Vec<ConnectionHandle<C>> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.handles.drain(..).collect()
    }

    /// Cancel all parked waiters. Subsequent polls fail with `PoolClosed`.
    pub fn shutdown(&self) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.shutdown = true;
        drop(guard);
        self.condvar.notify_all();
    }
}

// The coalescing single-slot signal each partition's watcher consumes.
// Multiple producers may post concurrently; repeated posts while one is
// pending collapse into a single wake-up. The watcher re-reads the
// partition counters after every wake, so a lost duplicate carries no
// information.
#[doc(hidden)]
#[derive(Debug, Default)]
pub(crate) struct WatchSignal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl WatchSignal {
    #![allow(clippy::mutex_atomic)]
    pub fn new() -> Self {
        WatchSignal {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Post a token. Non-blocking; a pending token absorbs the post.
    pub fn post(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if !*pending {
                *pending = true;
                self.condvar.notify_one();
            }
        }
    }

    /// Block until a token is available, consuming it. Re-checks `shutdown`
    /// periodically and on wake so the watcher can exit promptly; returns
    /// `Err(PoolClosed)` once shutdown is observed.
    pub fn take(&self, shutdown: &AtomicBool) -> Result<(), Error> {
        let mut pending =
            self.pending.lock().map_err(|_| Error::Interrupted)?;
        loop {
            if shutdown.load(AtomicOrdering::SeqCst) {
                return Err(Error::PoolClosed);
            }
            if *pending {
                *pending = false;
                return Ok(());
            }
            let wait_result = self
                .condvar
                .wait_timeout(
                    pending,
                    Duration::from_millis(SHUTDOWN_RECHECK_MS),
                )
                .map_err(|_| Error::Interrupted)?;
            pending = wait_result.0;
        }
    }
}

/// Sum type representing the current state of the connection pool. Possible
/// states are running, stopping, or stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolState {
    /// The pool is running and able to service connection requests.
    Running,
    /// The connection pool is performing cleanup and is no longer accepting
    /// connection requests.
    Stopping,
    /// The connection pool is stopped and is no longer accepting connection
    /// requests.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolState::Running => String::from("running").fmt(fmt),
            PoolState::Stopping => String::from("stopping").fmt(fmt),
            PoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    use crate::connection::Connection;
    use crate::error::Error;
    use crate::server::ServerInfo;

    #[derive(Debug)]
    struct NullConnection;

    impl Connection for NullConnection {
        type Error = Error;

        fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn handle(tag: usize) -> ConnectionHandle<NullConnection> {
        let server = Arc::new(ServerInfo::new("127.0.0.1", 9090));
        ConnectionHandle::new(server, tag % 7, Some(NullConnection))
    }

    #[test]
    fn queue_is_fifo() {
        let queue = ProtectedQueue::new(4);
        for i in 0..3 {
            assert!(queue.offer(handle(i)).is_ok());
        }
        assert_eq!(queue.len(), 3);
        for i in 0..3 {
            let h = queue.poll().unwrap().unwrap();
            assert_eq!(h.partition_index(), i % 7);
        }
        assert!(queue.poll().unwrap().is_none());
    }

    #[test]
    fn queue_rejects_beyond_capacity() {
        let queue = ProtectedQueue::new(1);
        assert!(queue.offer(handle(0)).is_ok());
        assert!(queue.offer(handle(1)).is_err());
    }

    #[test]
    fn poll_timeout_returns_none_on_timeout() {
        let queue: ProtectedQueue<NullConnection> = ProtectedQueue::new(1);
        let start = Instant::now();
        let result = queue
            .poll_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn poll_timeout_wakes_on_offer() {
        let queue: Arc<ProtectedQueue<NullConnection>> =
            Arc::new(ProtectedQueue::new(1));
        let queue_clone = Arc::clone(&queue);
        let waiter = thread::spawn(move || {
            queue_clone
                .poll_timeout(Some(Duration::from_secs(5)))
                .unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        assert!(queue.offer(handle(0)).is_ok());
        let result = waiter.join().unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn shutdown_cancels_parked_waiters() {
        let queue: Arc<ProtectedQueue<NullConnection>> =
            Arc::new(ProtectedQueue::new(1));
        let queue_clone = Arc::clone(&queue);
        let waiter = thread::spawn(move || {
            queue_clone.poll_timeout(Some(Duration::from_secs(5)))
        });
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        match waiter.join().unwrap() {
            Err(Error::PoolClosed) => (),
            other => panic!("expected PoolClosed, got {:?}", other),
        }
        match queue.poll() {
            Err(Error::PoolClosed) => (),
            other => panic!("expected PoolClosed, got {:?}", other),
        }
    }

    #[test]
    fn watch_signal_coalesces() {
        let signal = WatchSignal::new();
        let shutdown = AtomicBool::new(false);
        signal.post();
        signal.post();
        signal.post();
        assert!(signal.take(&shutdown).is_ok());
        shutdown.store(true, AtomicOrdering::SeqCst);
        match signal.take(&shutdown) {
            Err(Error::PoolClosed) => (),
            other => panic!("expected PoolClosed, got {:?}", other),
        }
    }

    #[test]
    fn options_validation() {
        let mut options = PoolOptions::default();
        assert!(options.validate().is_err());

        options.servers = vec![ServerInfo::new("127.0.0.1", 9090)];
        assert!(options.validate().is_ok());

        options.min_connections_per_server = Some(5);
        options.max_connections_per_server = Some(2);
        assert!(options.validate().is_err());

        options.min_connections_per_server = Some(1);
        options.pool_availability_threshold = Some(250);
        assert!(options.validate().is_err());
    }

    #[test]
    fn pool_state_display() {
        assert_eq!(PoolState::Running.to_string(), "running");
        assert_eq!(PoolState::Stopping.to_string(), "stopping");
        assert_eq!(PoolState::Stopped.to_string(), "stopped");
    }
}
