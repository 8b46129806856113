// Copyright 2020 Joyent, Inc.

use slog::debug;

use crate::connection::{Connection, ConnectionFactory};
use crate::connection_pool::PoolInner;
use crate::error::Error;

// The two retirement actors. Both walk a partition's free queue by
// removing one handle at a time, deciding its fate while it is detached
// (and therefore invisible to acquirers), and reinserting survivors on
// the side of the queue the walk has already covered. Borrowed handles
// are never touched; an expired borrowed handle is caught by the release
// path instead.
impl<C, F> PoolInner<C, F>
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    /// One pass of the idle reaper over `index`'s free queue: destroy
    /// handles idle beyond the idle TTL, and probe handles whose liveness
    /// test period has elapsed, destroying the ones that fail.
    pub(crate) fn run_idle_reaper(&self, index: usize) {
        if self.shutting_down() {
            return;
        }
        let partition = &self.partitions[index];
        let order = self.service_order;
        let queued = partition.available();

        for _ in 0..queued {
            let mut handle = match partition.poll_free_ordered(order) {
                Ok(Some(handle)) => handle,
                _ => break,
            };

            // Shutdown wins any race with an in-flight probe.
            if self.shutting_down() {
                self.destroy_connection(handle);
                break;
            }

            if handle.is_idle_expired(self.idle_max_age) {
                debug!(
                    self.log,
                    "closing idle connection to {}",
                    partition.server()
                );
                self.destroy_connection(handle);
                self.maybe_signal(partition);
                continue;
            }

            if let Some(test_period) = self.idle_test_period {
                if handle.last_reset().elapsed() >= test_period
                    && !self.is_connection_alive(&mut handle)
                {
                    debug!(
                        self.log,
                        "closing idle connection to {}: {}",
                        partition.server(),
                        Error::LivenessFailed
                    );
                    self.destroy_connection(handle);
                    self.maybe_signal(partition);
                    continue;
                }
            }

            if let Err(rejected) = partition.requeue_free(order, handle) {
                self.destroy_connection(rejected);
                break;
            }
        }
    }

    /// One pass of the age reaper: destroy every free handle older than
    /// the absolute connection TTL.
    pub(crate) fn run_age_reaper(&self, index: usize) {
        if self.shutting_down() {
            return;
        }
        let partition = &self.partitions[index];
        let order = self.service_order;
        let queued = partition.available();

        for _ in 0..queued {
            let handle = match partition.poll_free_ordered(order) {
                Ok(Some(handle)) => handle,
                _ => break,
            };

            if self.shutting_down() {
                self.destroy_connection(handle);
                break;
            }

            if handle.is_expired(self.max_connection_age) {
                debug!(
                    self.log,
                    "closing connection to {} that reached its maximum age",
                    partition.server()
                );
                self.destroy_connection(handle);
                self.maybe_signal(partition);
                continue;
            }

            if let Err(rejected) = partition.requeue_free(order, handle) {
                self.destroy_connection(rejected);
                break;
            }
        }
    }
}
