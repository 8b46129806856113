// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crate::connection::{Connection, ConnectionFactory};
use crate::connection_pool::handle::ConnectionHandle;
use crate::connection_pool::PoolInner;
use crate::error::Error;

// Sequential slot numbers stand in for thread ids, which are opaque in
// Rust. Each caller thread keeps the slot it is handed on first
// acquisition, so long-lived worker threads stay affine to one partition.
static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: usize =
        NEXT_THREAD_SLOT.fetch_add(1, AtomicOrdering::Relaxed);
}

pub(crate) fn thread_slot() -> usize {
    THREAD_SLOT.with(|slot| *slot)
}

// The default acquisition strategy: thread affinity with fall-through.
// The caller's affine partition is polled first; on a miss the remaining
// partitions are scanned in index order; if every non-blocking poll
// misses, the caller parks on the affine partition's free queue.
impl<C, F> PoolInner<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    pub(crate) fn acquire(&self) -> Result<ConnectionHandle<C>, Error> {
        self.acquire_from(thread_slot() % self.partitions.len())
    }

    pub(crate) fn acquire_from(
        &self,
        affine: usize,
    ) -> Result<ConnectionHandle<C>, Error> {
        if let Some(handle) = self.poll_connection(affine)? {
            return Ok(handle);
        }

        let partition = &self.partitions[affine];
        match partition.poll_free_timeout(self.connection_timeout)? {
            Some(handle) => Ok(handle),
            None => Err(Error::AcquisitionTimeout),
        }
    }

    fn poll_connection(
        &self,
        affine: usize,
    ) -> Result<Option<ConnectionHandle<C>>, Error> {
        let mut chosen = affine;
        let mut result = self.partitions[affine].poll_free()?;

        if result.is_none() {
            for (index, partition) in self.partitions.iter().enumerate() {
                if index == affine {
                    continue;
                }
                if let Some(handle) = partition.poll_free()? {
                    chosen = index;
                    result = Some(handle);
                    break;
                }
            }
        }

        let partition = &self.partitions[chosen];
        if !partition.unable_to_create_more() {
            self.maybe_signal(partition);
        }
        Ok(result)
    }

    /// Drain and destroy every idle connection in every partition. Runs
    /// under an exclusive termination latch so concurrent shutdown paths
    /// cannot interleave their drains.
    pub(crate) fn terminate_all_connections(&self) {
        let _termination_guard = match self.termination_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for partition in &self.partitions {
            partition.set_unable_to_create_more(false);
            for handle in partition.drain_free() {
                self.destroy_connection(handle);
            }
        }
    }
}
