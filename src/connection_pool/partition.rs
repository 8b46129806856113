// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::connection_pool::handle::ConnectionHandle;
use crate::connection_pool::types::{ProtectedQueue, ServiceOrder, WatchSignal};
use crate::error::Error;
use crate::server::ServerInfo;

// One per-server slice of the pool. The partition owns the bounded free
// queue and the connection accounting for its server; all hot-path
// contention is confined here rather than in the pool.
//
// Invariants: 0 <= free queue length <= created <= max_connections.
// `created` only increases on the watcher's factory path and only decreases
// on a destroy path.
#[derive(Debug)]
pub(crate) struct Partition<C> {
    server: Arc<ServerInfo>,
    index: usize,
    free: ProtectedQueue<C>,
    created: AtomicUsize,
    max_connections: usize,
    min_connections: usize,
    acquire_increment: usize,
    signal: WatchSignal,
    unable_to_create_more: AtomicBool,
    server_is_down: AtomicBool,
    create_failures: AtomicUsize,
}

impl<C> Partition<C>
where
    C: Connection,
{
    pub fn new(
        server: ServerInfo,
        index: usize,
        max_connections: usize,
        min_connections: usize,
        acquire_increment: usize,
    ) -> Self {
        Partition {
            server: Arc::new(server),
            index,
            free: ProtectedQueue::new(max_connections),
            created: AtomicUsize::new(0),
            max_connections,
            min_connections,
            acquire_increment,
            signal: WatchSignal::new(),
            unable_to_create_more: AtomicBool::new(false),
            server_is_down: AtomicBool::new(false),
            create_failures: AtomicUsize::new(0),
        }
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn server_ref(&self) -> Arc<ServerInfo> {
        Arc::clone(&self.server)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn min_connections(&self) -> usize {
        self.min_connections
    }

    pub fn acquire_increment(&self) -> usize {
        self.acquire_increment
    }

    /// The number of handles currently available for acquisition.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn created(&self) -> usize {
        self.created.load(AtomicOrdering::SeqCst)
    }

    pub fn increment_created(&self) {
        self.created.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub fn decrement_created(&self) {
        self.created.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    /// Non-blocking poll of the free queue head.
    pub fn poll_free(&self) -> Result<Option<ConnectionHandle<C>>, Error> {
        self.free.poll()
    }

    /// Poll one end of the free queue per the reaper traversal order.
    pub fn poll_free_ordered(
        &self,
        order: ServiceOrder,
    ) -> Result<Option<ConnectionHandle<C>>, Error> {
        match order {
            ServiceOrder::Fifo => self.free.poll(),
            ServiceOrder::Lifo => self.free.poll_tail(),
        }
    }

    /// Blocking poll with an optional timeout; `None` waits indefinitely.
    pub fn poll_free_timeout(
        &self,
        m_timeout: Option<Duration>,
    ) -> Result<Option<ConnectionHandle<C>>, Error> {
        self.free.poll_timeout(m_timeout)
    }

    /// Non-blocking enqueue. A rejected handle comes back to the caller
    /// for disposal; outside of shutdown a rejection indicates broken
    /// accounting since `created` never exceeds `max_connections`.
    pub fn offer_free(
        &self,
        handle: ConnectionHandle<C>,
    ) -> Result<(), ConnectionHandle<C>> {
        self.free.offer(handle)
    }

    /// Reinsert a reaper survivor on the side of the queue the ordered
    /// walk has already covered, so the walk advances instead of
    /// revisiting the same handle: tail for a FIFO walk, head for a LIFO
    /// walk.
    pub fn requeue_free(
        &self,
        order: ServiceOrder,
        handle: ConnectionHandle<C>,
    ) -> Result<(), ConnectionHandle<C>> {
        match order {
            ServiceOrder::Fifo => self.free.offer(handle),
            ServiceOrder::Lifo => self.free.offer_front(handle),
        }
    }

    pub fn drain_free(&self) -> Vec<ConnectionHandle<C>> {
        self.free.drain()
    }

    /// Post a refill token to the watcher. Coalescing and non-blocking.
    pub fn signal(&self) {
        self.signal.post();
    }

    /// Block until a refill token arrives, consuming it. Fails with
    /// `PoolClosed` once `shutdown` is observed.
    pub fn wait_signal(&self, shutdown: &AtomicBool) -> Result<(), Error> {
        self.signal.take(shutdown)
    }

    /// Cancel parked acquirers and reject further queue traffic.
    pub fn shutdown_queue(&self) {
        self.free.shutdown();
    }

    pub fn unable_to_create_more(&self) -> bool {
        self.unable_to_create_more.load(AtomicOrdering::SeqCst)
    }

    pub fn set_unable_to_create_more(&self, unable: bool) {
        self.unable_to_create_more
            .store(unable, AtomicOrdering::SeqCst);
    }

    pub fn server_is_down(&self) -> bool {
        self.server_is_down.load(AtomicOrdering::SeqCst)
    }

    pub fn set_server_is_down(&self, down: bool) {
        self.server_is_down.store(down, AtomicOrdering::SeqCst);
    }

    /// Record one factory failure and return the consecutive failure count.
    pub fn record_create_failure(&self) -> usize {
        self.create_failures.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    pub fn clear_create_failures(&self) {
        self.create_failures.store(0, AtomicOrdering::SeqCst);
    }
}
