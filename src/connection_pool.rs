// Copyright 2020 Joyent, Inc.

pub mod types;

mod handle;
mod partition;
mod reaper;
mod strategy;
mod watcher;

use std::cmp;
use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::connection::{
    Connection, ConnectionFactory, LivenessProbe, Multiplexed, Protocol,
};
use crate::connection_pool::handle::ConnectionHandle;
use crate::connection_pool::partition::Partition;
use crate::connection_pool::types::{
    PoolOptions, PoolState, PoolStats, ServiceOrder,
};
use crate::error::Error;
use crate::server::ServerInfo;

// Default number of maximum connections per server partition
const DEFAULT_MAX_CONNECTIONS_PER_SERVER: u32 = 10;
// Default partition floor the watcher fills up to
const DEFAULT_MIN_CONNECTIONS_PER_SERVER: u32 = 1;
// Default per-connect timeout in milliseconds
const DEFAULT_CONNECT_TIMEOUT: u64 = 5000;
// Default watcher refill batch size
const DEFAULT_ACQUIRE_INCREMENT: u32 = 2;
// Default creation retries after the initial attempt
const DEFAULT_ACQUIRE_RETRY_ATTEMPTS: u32 = 3;
// Default delay between creation retries in milliseconds
const DEFAULT_ACQUIRE_RETRY_DELAY: u64 = 1000;
// Default consecutive factory failures before the server-down latch trips
const DEFAULT_MAX_CREATE_FAILED_COUNT: u32 = 3;
// Default free/max percentage at or below which a refill signal fires
const DEFAULT_AVAILABILITY_THRESHOLD: u32 = 20;

/// A pool of client connections to a fleet of Thrift servers
///
/// The pool keeps one partition per configured server; application threads
/// acquire a ready connection with [`get_connection`](#method.get_connection)
/// and return it by dropping (or explicitly closing) the returned
/// [`PooledConnection`]. One watcher thread per partition replenishes
/// connections on demand, and two periodic reapers retire connections that
/// sit idle too long or exceed their maximum age.
pub struct ThriftConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    inner: Arc<PoolInner<C, F>>,
    watcher_threads: Option<Vec<thread::JoinHandle<()>>>,
    reaper_timer: Option<timer::Timer>,
    reaper_guards: Vec<timer::Guard>,
    state: PoolState,
}

impl<C, F> Debug for ThriftConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ThriftConnectionPool")
            .field("partitions", &self.inner.partitions.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<C, F> Clone for ThriftConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    fn clone(&self) -> ThriftConnectionPool<C, F> {
        ThriftConnectionPool {
            inner: Arc::clone(&self.inner),
            watcher_threads: None,
            reaper_timer: None,
            reaper_guards: Vec::new(),
            state: self.state,
        }
    }
}

impl<C, F> ThriftConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    /// Create a new pool from `options`, a connection factory, and an
    /// optional liveness probe.
    ///
    /// Unless `lazy_init` is set this validates every configured server by
    /// obtaining and closing one connection; servers that fail the probe
    /// are logged and dropped, and if none survive the call fails with
    /// [`Error::NoServersAvailable`](../error/enum.Error.html). Surviving
    /// partitions are eagerly filled to `min_connections_per_server`.
    pub fn new(
        options: PoolOptions,
        factory: F,
        probe: Option<Box<dyn LivenessProbe<Connection = C>>>,
    ) -> Result<Self, Error> {
        options.validate()?;

        let logger = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let max_connections = options
            .max_connections_per_server
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_SERVER)
            as usize;
        let min_connections = options
            .min_connections_per_server
            .unwrap_or(DEFAULT_MIN_CONNECTIONS_PER_SERVER)
            as usize;
        let acquire_increment = options
            .acquire_increment
            .unwrap_or(DEFAULT_ACQUIRE_INCREMENT)
            as usize;
        let connect_timeout = options
            .connect_timeout
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_CONNECT_TIMEOUT));
        let protocol = options.protocol.unwrap_or_default();
        let connection_timeout = match options.connection_timeout_ms {
            None | Some(0) => None,
            Some(timeout_ms) => Some(Duration::from_millis(timeout_ms)),
        };
        let lazy_init = options.lazy_init;

        let mut servers = options.servers;

        // Validate each server with a throwaway connection before building
        // its partition. A server that cannot produce a connection now is
        // dropped from the fleet rather than failing pool construction.
        if !lazy_init {
            servers.retain(|server| {
                match factory.create(server, connect_timeout, protocol) {
                    Ok(mut conn) => {
                        if let Err(close_err) = conn.close() {
                            warn!(
                                logger,
                                "failed to close probe connection to {}: {}",
                                server,
                                close_err
                            );
                        }
                        true
                    }
                    Err(create_err) => {
                        error!(
                            logger,
                            "unable to obtain a connection from {}, \
                             removing the server: {}",
                            server,
                            create_err
                        );
                        false
                    }
                }
            });

            if servers.is_empty() {
                return Err(Error::NoServersAvailable);
            }
        }

        let partitions = servers
            .iter()
            .enumerate()
            .map(|(index, server)| {
                Partition::new(
                    server.clone(),
                    index,
                    max_connections,
                    min_connections,
                    acquire_increment,
                )
            })
            .collect();

        let inner = Arc::new(PoolInner {
            partitions,
            factory,
            probe,
            connect_timeout,
            protocol,
            connection_timeout,
            acquire_retry_attempts: options
                .acquire_retry_attempts
                .unwrap_or(DEFAULT_ACQUIRE_RETRY_ATTEMPTS),
            acquire_retry_delay: options.acquire_retry_delay.unwrap_or_else(
                || Duration::from_millis(DEFAULT_ACQUIRE_RETRY_DELAY),
            ),
            max_create_failed_count: options
                .max_connection_create_failed_count
                .unwrap_or(DEFAULT_MAX_CREATE_FAILED_COUNT)
                as usize,
            pool_availability_threshold: options
                .pool_availability_threshold
                .unwrap_or(DEFAULT_AVAILABILITY_THRESHOLD)
                as usize,
            idle_max_age: options.idle_max_age,
            idle_test_period: options.idle_connection_test_period,
            max_connection_age: options.max_connection_age,
            service_order: options.service_order.unwrap_or_default(),
            lazy_init,
            shutting_down: AtomicBool::new(false),
            termination_lock: Mutex::new(()),
            log: logger,
        });

        if !lazy_init {
            inner.eager_fill();
        }

        let suffix = options
            .pool_name
            .map(|name| format!("-{}", name))
            .unwrap_or_default();

        let mut watcher_threads =
            Vec::with_capacity(inner.partitions.len());
        for index in 0..inner.partitions.len() {
            let watcher_pool = Arc::clone(&inner);
            let watcher_thread = thread::Builder::new()
                .name(format!("thrift-pool-watch-{}{}", index, suffix))
                .spawn(move || watcher::run(watcher_pool, index))?;
            watcher_threads.push(watcher_thread);
        }

        // The reapers share one timer thread; each partition gets its own
        // repeating schedule per configured TTL.
        let reaper_timer = timer::Timer::new();
        let mut reaper_guards = Vec::new();

        let idle_period = match (inner.idle_max_age, inner.idle_test_period)
        {
            (Some(idle_max_age), Some(test_period)) => {
                Some(cmp::max(idle_max_age, test_period))
            }
            (Some(idle_max_age), None) => Some(idle_max_age),
            (None, Some(test_period)) => Some(test_period),
            (None, None) => None,
        };

        if let Some(period) = idle_period {
            for index in 0..inner.partitions.len() {
                let reaper_pool = Arc::clone(&inner);
                reaper_guards.push(reaper_timer.schedule_repeating(
                    chrono::Duration::milliseconds(period.as_millis() as i64),
                    move || reaper_pool.run_idle_reaper(index),
                ));
            }
        }

        if let Some(max_age) = inner.max_connection_age {
            for index in 0..inner.partitions.len() {
                let reaper_pool = Arc::clone(&inner);
                reaper_guards.push(reaper_timer.schedule_repeating(
                    chrono::Duration::milliseconds(max_age.as_millis() as i64),
                    move || reaper_pool.run_age_reaper(index),
                ));
            }
        }

        Ok(ThriftConnectionPool {
            inner,
            watcher_threads: Some(watcher_threads),
            reaper_timer: Some(reaper_timer),
            reaper_guards,
            state: PoolState::Running,
        })
    }

    /// Acquire a connection from the pool.
    ///
    /// The default strategy first polls the free queue of the caller's
    /// affine partition, then falls through to the remaining partitions in
    /// index order, and finally blocks on the affine partition for up to
    /// `connection_timeout_ms`. Returns the connection wrapped in a
    /// [`PooledConnection`] guard that releases it back to the pool on
    /// drop.
    pub fn get_connection(
        &self,
    ) -> Result<PooledConnection<C, F>, Error> {
        if self.inner.shutting_down() {
            return Err(Error::PoolClosed);
        }

        let mut handle = self.inner.acquire()?;
        handle.set_logically_closed(false);
        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            handle: Some(handle),
        })
    }

    /// Connection counts across all partitions, or `None` once the pool
    /// has begun shutting down.
    pub fn get_stats(&self) -> Option<PoolStats> {
        match self.state {
            PoolState::Running => Some(self.inner.stats()),
            _ => None,
        }
    }

    pub fn get_state(&self) -> String {
        self.state.to_string()
    }

    /// Stop the connection pool and close every idle connection. Borrowed
    /// connections are closed as their holders release them. Only the
    /// instance returned by `new` tears the pool down; calling `close` on a
    /// clone is a no-op. The call is idempotent and blocks until all
    /// background threads have exited.
    pub fn close(&mut self) {
        let watcher_threads = match self.watcher_threads.take() {
            Some(watcher_threads) => watcher_threads,
            None => {
                debug!(
                    self.inner.log,
                    "close called on a pool clone or an already closed pool"
                );
                return;
            }
        };

        info!(self.inner.log, "shutting down connection pool");
        self.state = PoolState::Stopping;
        self.inner
            .shutting_down
            .store(true, AtomicOrdering::SeqCst);

        // Cancel the reaper schedules before draining the partitions so no
        // reaper pass runs against a terminated queue.
        self.reaper_guards.clear();
        drop(self.reaper_timer.take());

        // Wake every watcher and cancel every parked acquirer; both observe
        // the shutdown flag and fail out with PoolClosed.
        for partition in &self.inner.partitions {
            partition.signal();
            partition.shutdown_queue();
        }

        self.inner.terminate_all_connections();

        for watcher_thread in watcher_threads {
            let _ = watcher_thread.join();
        }

        self.state = PoolState::Stopped;
        info!(self.inner.log, "connection pool stopped");
    }
}

impl<C, F> Drop for ThriftConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    fn drop(&mut self) {
        // Close the pool when the original instance goes out of scope.
        // For clones this is a no-op.
        self.close();
    }
}

// The shared state behind every pool instance, clone, and borrowed
// connection. All hot-path members live inside the per-server partitions;
// the only global mutable state is the write-once shutdown flag.
pub(crate) struct PoolInner<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    pub(crate) partitions: Vec<Partition<C>>,
    factory: F,
    probe: Option<Box<dyn LivenessProbe<Connection = C>>>,
    connect_timeout: Duration,
    protocol: Protocol,
    pub(crate) connection_timeout: Option<Duration>,
    acquire_retry_attempts: u32,
    pub(crate) acquire_retry_delay: Duration,
    max_create_failed_count: usize,
    pub(crate) pool_availability_threshold: usize,
    idle_max_age: Option<Duration>,
    idle_test_period: Option<Duration>,
    max_connection_age: Option<Duration>,
    pub(crate) service_order: ServiceOrder,
    pub(crate) lazy_init: bool,
    pub(crate) shutting_down: AtomicBool,
    termination_lock: Mutex<()>,
    pub(crate) log: Logger,
}

impl<C, F> PoolInner<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    pub(crate) fn shutting_down(&self) -> bool {
        self.shutting_down.load(AtomicOrdering::SeqCst)
    }

    fn obtain_raw_connection(
        &self,
        server: &ServerInfo,
    ) -> Result<C, Error> {
        self.factory
            .create(server, self.connect_timeout, self.protocol)
    }

    /// Establish a connection for `handle`, retrying per the acquire retry
    /// policy. On success the partition's server-down latch is cleared and
    /// any previous (broken) connection in the handle is closed. On final
    /// failure the handle keeps whatever connection it had before the call
    /// and the error surfaces as `ConnectionAcquireFailed`.
    pub(crate) fn obtain_connection(
        &self,
        handle: &mut ConnectionHandle<C>,
    ) -> Result<(), Error> {
        let partition = &self.partitions[handle.partition_index()];
        let server = handle.server_ref();
        let mut attempts_left = self.acquire_retry_attempts;

        loop {
            match self.obtain_raw_connection(&server) {
                Ok(conn) => {
                    if attempts_left != self.acquire_retry_attempts {
                        info!(
                            self.log,
                            "successfully re-established connection to {}",
                            server
                        );
                    }
                    partition.set_server_is_down(false);
                    partition.clear_create_failures();

                    if let Some(mut old_conn) =
                        handle.replace_connection(conn)
                    {
                        if let Err(close_err) = old_conn.close() {
                            debug!(
                                self.log,
                                "error closing replaced connection to {}: {}",
                                server,
                                close_err
                            );
                        }
                    }
                    return Ok(());
                }
                Err(create_err) => {
                    let failures = partition.record_create_failure();
                    if failures >= self.max_create_failed_count {
                        partition.set_server_is_down(true);
                    }
                    error!(
                        self.log,
                        "failed to acquire connection to {}. sleeping for \
                         {}ms. attempts left: {}: {}",
                        server,
                        self.acquire_retry_delay.as_millis(),
                        attempts_left,
                        create_err
                    );
                    if attempts_left == 0 || self.shutting_down() {
                        return Err(Error::ConnectionAcquireFailed(
                            format!("{}: {}", server, create_err),
                        ));
                    }
                    attempts_left -= 1;
                    thread::sleep(self.acquire_retry_delay);
                }
            }
        }
    }

    /// Create a fresh handle for `partition` with a live connection.
    pub(crate) fn create_handle(
        &self,
        partition: &Partition<C>,
    ) -> Result<ConnectionHandle<C>, Error> {
        let mut handle = ConnectionHandle::new(
            partition.server_ref(),
            partition.index(),
            None,
        );
        self.obtain_connection(&mut handle)?;
        Ok(handle)
    }

    // Fill each partition up to its floor during pool construction.
    // Failures are logged and left for the watcher to repair on the first
    // refill signal.
    fn eager_fill(&self) {
        for partition in &self.partitions {
            for _ in 0..partition.min_connections() {
                match self.create_handle(partition) {
                    Ok(handle) => {
                        partition.increment_created();
                        if let Err(rejected) = partition.offer_free(handle)
                        {
                            self.destroy_connection(rejected);
                            break;
                        }
                    }
                    Err(fill_err) => {
                        warn!(
                            self.log,
                            "unable to eagerly fill partition for {}: {}",
                            partition.server(),
                            fill_err
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Run the liveness probe against the handle's connection, preserving
    /// the logical-close flag across the probe and stamping the reset
    /// time. Absent a configured probe every connection passes.
    pub(crate) fn is_connection_alive(
        &self,
        handle: &mut ConnectionHandle<C>,
    ) -> bool {
        let logically_closed = handle.logically_closed();
        handle.set_logically_closed(false);

        let alive = if !handle.has_connection() {
            false
        } else {
            match &self.probe {
                Some(probe) => probe.is_alive(handle.connection_mut()),
                None => true,
            }
        };

        handle.set_logically_closed(logically_closed);
        handle.touch_last_reset();
        alive
    }

    /// Return a borrowed handle to the pool. Expired and probe-failed
    /// handles are destroyed (and a refill is signalled); everything else
    /// goes back on its partition's free queue. During shutdown the handle
    /// is destroyed instead.
    pub(crate) fn release_connection(
        &self,
        mut handle: ConnectionHandle<C>,
    ) {
        handle.set_logically_closed(true);

        if self.shutting_down() {
            self.destroy_connection(handle);
            return;
        }

        let expired = handle.is_expired(self.max_connection_age);
        let probe_failed = !expired
            && handle.possibly_broken()
            && !self.is_connection_alive(&mut handle);

        if expired || probe_failed {
            if probe_failed {
                debug!(
                    self.log,
                    "destroying connection to {}: {}",
                    handle.server(),
                    Error::LivenessFailed
                );
            }
            let partition_index = handle.partition_index();
            self.destroy_connection(handle);
            self.maybe_signal(&self.partitions[partition_index]);
            return;
        }

        handle.touch_last_used();
        handle.set_possibly_broken(false);

        let partition = &self.partitions[handle.partition_index()];
        match partition.offer_free(handle) {
            Ok(()) => (),
            Err(rejected) => {
                // Full queue outside of shutdown means the created
                // accounting is broken somewhere.
                if !self.shutting_down() {
                    let invariant = Error::InternalInvariant(format!(
                        "free queue for {} rejected a released connection",
                        partition.server()
                    ));
                    warn!(self.log, "{}", invariant);
                }
                self.destroy_connection(rejected);
            }
        }
    }

    /// Close a handle's connection and give its slot back to the
    /// partition.
    pub(crate) fn destroy_connection(
        &self,
        mut handle: ConnectionHandle<C>,
    ) {
        let partition = &self.partitions[handle.partition_index()];
        partition.decrement_created();
        partition.set_unable_to_create_more(false);
        handle.internal_close(&self.log);
    }

    /// Post a refill token to the partition's watcher when availability
    /// has dropped to the configured threshold percentage.
    pub(crate) fn maybe_signal(&self, partition: &Partition<C>) {
        if !partition.unable_to_create_more()
            && !self.shutting_down()
            && partition.available() * 100 / partition.max_connections()
                <= self.pool_availability_threshold
        {
            partition.signal();
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let mut total: usize = 0;
        let mut idle: usize = 0;
        for partition in &self.partitions {
            total += partition.created();
            idle += partition.available();
        }
        PoolStats {
            total_connections: (total as u32).into(),
            idle_connections: (idle as u32).into(),
        }
    }
}

/// A connection borrowed from the pool
///
/// Dereferences to the factory-produced client. Dropping the guard (or
/// calling [`close`](#method.close)) returns the connection to the pool;
/// the underlying transport is only torn down if the connection has
/// expired, failed its liveness probe after
/// [`mark_possibly_broken`](#method.mark_possibly_broken), or the pool is
/// shutting down.
pub struct PooledConnection<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    pool: Arc<PoolInner<C, F>>,
    handle: Option<ConnectionHandle<C>>,
}

impl<C, F> PooledConnection<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    /// The user-facing client for this connection.
    pub fn client(&mut self) -> &mut C {
        self.handle.as_mut().unwrap().connection_mut()
    }

    /// Look up a named service client on a multiplexed connection.
    pub fn client_named(&mut self, name: &str) -> Option<&mut C::Client>
    where
        C: Multiplexed,
    {
        self.handle.as_mut().unwrap().connection_mut().client(name)
    }

    /// The server this connection is bound to.
    pub fn server(&self) -> &ServerInfo {
        self.handle.as_ref().unwrap().server()
    }

    /// Record that a call on this connection observed an I/O error. The
    /// pool will probe the connection on release and destroy it if the
    /// probe fails.
    pub fn mark_possibly_broken(&mut self) {
        self.handle.as_mut().unwrap().set_possibly_broken(true);
    }

    /// Replace this connection's broken transport in place, keeping the
    /// borrowed guard valid. Retries per the pool's acquire retry policy;
    /// on failure the previous transport is left in the guard untouched.
    pub fn reacquire(&mut self) -> Result<(), Error> {
        let pool = Arc::clone(&self.pool);
        let handle = self.handle.as_mut().unwrap();
        pool.obtain_connection(handle)?;
        handle.set_possibly_broken(false);
        Ok(())
    }

    /// Return the connection to the pool. Equivalent to dropping the
    /// guard.
    pub fn close(self) {}
}

impl<C, F> Drop for PooledConnection<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release_connection(handle);
        }
    }
}

impl<C, F> Deref for PooledConnection<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    type Target = C;

    fn deref(&self) -> &C {
        self.handle.as_ref().unwrap().connection()
    }
}

impl<C, F> DerefMut for PooledConnection<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    fn deref_mut(&mut self) -> &mut C {
        self.handle.as_mut().unwrap().connection_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Instant;

    #[derive(Debug)]
    struct TestConnection {
        id: usize,
        closed: Arc<AtomicUsize>,
    }

    impl Connection for TestConnection {
        type Error = Error;

        fn close(&mut self) -> Result<(), Error> {
            self.closed.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    struct TestFactory {
        created: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl TestFactory {
        fn new() -> Self {
            TestFactory {
                created: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
                fail: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl ConnectionFactory for TestFactory {
        type Connection = TestConnection;

        fn create(
            &self,
            server: &ServerInfo,
            _connect_timeout: Duration,
            _protocol: Protocol,
        ) -> Result<TestConnection, Error> {
            if self.fail.load(AtomicOrdering::SeqCst) {
                return Err(Error::ConnectionCreate(format!(
                    "{}: connection refused",
                    server
                )));
            }
            let id = self.created.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(TestConnection {
                id,
                closed: Arc::clone(&self.closed),
            })
        }
    }

    struct FlagProbe {
        alive: Arc<AtomicBool>,
        probes: Arc<AtomicUsize>,
    }

    impl LivenessProbe for FlagProbe {
        type Connection = TestConnection;

        fn is_alive(&self, _conn: &mut TestConnection) -> bool {
            self.probes.fetch_add(1, AtomicOrdering::SeqCst);
            self.alive.load(AtomicOrdering::SeqCst)
        }
    }

    fn test_options(servers: Vec<ServerInfo>) -> PoolOptions {
        PoolOptions {
            servers,
            acquire_retry_attempts: Some(1),
            acquire_retry_delay: Some(Duration::from_millis(10)),
            ..Default::default()
        }
    }

    fn spin_until<P>(predicate: P, what: &str)
    where
        P: Fn() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            if Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn fall_through_scans_partitions_in_index_order() {
        let servers = vec![
            ServerInfo::new("127.0.0.1", 9090),
            ServerInfo::new("127.0.0.1", 9091),
            ServerInfo::new("127.0.0.1", 9092),
        ];
        let mut options = test_options(servers);
        options.lazy_init = true;
        options.max_connections_per_server = Some(1);

        let factory = TestFactory::new();
        let pool =
            ThriftConnectionPool::new(options, factory, None).unwrap();
        let inner = Arc::clone(&pool.inner);

        // keep the watchers out of the picture for this test
        for partition in &inner.partitions {
            partition.set_unable_to_create_more(true);
        }

        // leave the affine partition empty and stock the other two
        for index in [1usize, 2usize].iter() {
            let partition = &inner.partitions[*index];
            let handle = inner.create_handle(partition).unwrap();
            partition.increment_created();
            assert!(partition.offer_free(handle).is_ok());
        }

        let first = inner.acquire_from(0).unwrap();
        assert_eq!(first.partition_index(), 1);

        let second = inner.acquire_from(0).unwrap();
        assert_eq!(second.partition_index(), 2);

        inner.release_connection(first);
        inner.release_connection(second);
    }

    #[test]
    fn server_down_latch_trips_after_consecutive_failures() {
        let mut options =
            test_options(vec![ServerInfo::new("127.0.0.1", 9090)]);
        options.min_connections_per_server = Some(1);
        options.max_connections_per_server = Some(3);
        options.max_connection_create_failed_count = Some(2);

        let factory = TestFactory::new();
        let fail = Arc::clone(&factory.fail);
        let pool =
            ThriftConnectionPool::new(options, factory, None).unwrap();
        let inner = Arc::clone(&pool.inner);

        assert_eq!(inner.partitions[0].created(), 1);

        // every create from here on is refused
        fail.store(true, AtomicOrdering::SeqCst);

        let conn = pool.get_connection().unwrap();
        let held_id = conn.id;

        spin_until(
            || {
                inner.partitions[0].server_is_down()
                    && inner.partitions[0].unable_to_create_more()
            },
            "server-down latch",
        );
        assert_eq!(inner.partitions[0].created(), 1);

        // the healthy borrowed connection is unaffected by the latch
        drop(conn);
        let conn = pool.get_connection().unwrap();
        assert_eq!(conn.id, held_id);
    }

    #[test]
    fn liveness_probe_preserves_logical_close_flag() {
        let mut options =
            test_options(vec![ServerInfo::new("127.0.0.1", 9090)]);
        options.min_connections_per_server = Some(1);
        options.max_connections_per_server = Some(1);

        let factory = TestFactory::new();
        let alive = Arc::new(AtomicBool::new(true));
        let probes = Arc::new(AtomicUsize::new(0));
        let probe = FlagProbe {
            alive: Arc::clone(&alive),
            probes: Arc::clone(&probes),
        };
        let pool =
            ThriftConnectionPool::new(options, factory, Some(Box::new(probe)))
                .unwrap();
        let inner = Arc::clone(&pool.inner);

        let mut handle =
            inner.partitions[0].poll_free().unwrap().unwrap();
        let reset_before = handle.last_reset();
        thread::sleep(Duration::from_millis(10));

        assert!(inner.is_connection_alive(&mut handle));
        assert_eq!(probes.load(AtomicOrdering::SeqCst), 1);
        assert!(handle.logically_closed());
        assert!(handle.last_reset() > reset_before);

        alive.store(false, AtomicOrdering::SeqCst);
        assert!(!inner.is_connection_alive(&mut handle));

        inner.release_connection(handle);
    }

    #[test]
    fn lifo_reaper_retires_the_oldest_handle() {
        let mut options =
            test_options(vec![ServerInfo::new("127.0.0.1", 9090)]);
        options.lazy_init = true;
        options.max_connections_per_server = Some(3);
        options.service_order = Some(ServiceOrder::Lifo);
        options.max_connection_age = Some(Duration::from_millis(500));

        let factory = TestFactory::new();
        let pool =
            ThriftConnectionPool::new(options, factory, None).unwrap();
        let inner = Arc::clone(&pool.inner);
        let partition = &inner.partitions[0];

        // the expired handle sits at the head, the end a LIFO walk
        // reaches last
        let old = inner.create_handle(partition).unwrap();
        let old_id = old.connection().id;
        thread::sleep(Duration::from_millis(550));
        let fresh1 = inner.create_handle(partition).unwrap();
        let fresh2 = inner.create_handle(partition).unwrap();
        for handle in vec![old, fresh1, fresh2] {
            partition.increment_created();
            assert!(partition.offer_free(handle).is_ok());
        }

        inner.run_age_reaper(0);

        assert_eq!(partition.created(), 2);
        assert_eq!(partition.available(), 2);
        let survivors = partition.drain_free();
        let survivor_ids: Vec<usize> =
            survivors.iter().map(|h| h.connection().id).collect();
        assert_eq!(survivors.len(), 2);
        assert!(!survivor_ids.contains(&old_id));
        for handle in survivors {
            inner.destroy_connection(handle);
        }
    }

    #[test]
    fn expired_connection_destroyed_on_release() {
        let mut options =
            test_options(vec![ServerInfo::new("127.0.0.1", 9090)]);
        options.min_connections_per_server = Some(1);
        options.max_connections_per_server = Some(2);
        options.max_connection_age = Some(Duration::from_millis(200));

        let factory = TestFactory::new();
        let created = Arc::clone(&factory.created);
        let closed = Arc::clone(&factory.closed);
        let pool =
            ThriftConnectionPool::new(options, factory, None).unwrap();
        let inner = Arc::clone(&pool.inner);

        let conn = pool.get_connection().unwrap();
        let first_id = conn.id;
        thread::sleep(Duration::from_millis(250));
        drop(conn);

        // the expired connection is gone and the watcher replaces it
        spin_until(
            || {
                inner.partitions[0].created() >= 1
                    && inner.partitions[0].available() >= 1
                    && created.load(AtomicOrdering::SeqCst) >= 3
            },
            "replacement connection",
        );
        assert!(closed.load(AtomicOrdering::SeqCst) >= 2);

        let conn = pool.get_connection().unwrap();
        assert_ne!(conn.id, first_id);
    }
}
