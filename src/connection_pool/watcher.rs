// Copyright 2020 Joyent, Inc.

use std::cmp;
use std::sync::Arc;
use std::thread;

use slog::{debug, error, o, Logger};

use crate::connection::{Connection, ConnectionFactory};
use crate::connection_pool::partition::Partition;
use crate::connection_pool::PoolInner;
use crate::error::Error;

// The per-partition refill actor. One watcher thread per server blocks on
// the partition's coalescing signal, re-reads the connection counters on
// every wake, and creates connections through the factory until the
// partition is back above its availability threshold and at least at its
// floor.
pub(crate) fn run<C, F>(pool: Arc<PoolInner<C, F>>, index: usize)
where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    let partition = &pool.partitions[index];
    let log = pool
        .log
        .new(o!("watcher" => partition.server().to_string()));

    let mut first_iteration = true;
    loop {
        if pool.shutting_down() {
            debug!(log, "terminating pool watch thread");
            return;
        }

        // A lazily initialized pool creates nothing until first demand, so
        // the first iteration waits for a signal like every later one. An
        // eagerly initialized pool makes one unsignalled pass to repair any
        // shortfall left by construction.
        if pool.lazy_init || !first_iteration {
            if partition.wait_signal(&pool.shutting_down).is_err() {
                debug!(log, "terminating pool watch thread");
                return;
            }
        }
        first_iteration = false;

        let mut deficit = partition
            .max_connections()
            .saturating_sub(partition.created());

        while deficit == 0
            || partition.available() * 100 / partition.max_connections()
                > pool.pool_availability_threshold
        {
            if deficit == 0 {
                partition.set_unable_to_create_more(true);
            }

            if partition.wait_signal(&pool.shutting_down).is_err() {
                debug!(log, "terminating pool watch thread");
                return;
            }
            deficit = partition
                .max_connections()
                .saturating_sub(partition.created());
        }

        if !pool.shutting_down() {
            fill_connections(
                &pool,
                partition,
                cmp::min(deficit, partition.acquire_increment()),
                &log,
            );

            let created = partition.created();
            if created < partition.min_connections() {
                fill_connections(
                    &pool,
                    partition,
                    partition.min_connections() - created,
                    &log,
                );
            }
        }

        if pool.shutting_down() {
            debug!(log, "terminating pool watch thread");
            return;
        }
    }
}

// Create up to `count` connections and enqueue them. The first creation
// failure ends the batch after a retry-delay sleep; the signal that
// prompted this batch has already been consumed, so the next acquisition
// below the threshold will wake the watcher again.
fn fill_connections<C, F>(
    pool: &Arc<PoolInner<C, F>>,
    partition: &Partition<C>,
    count: usize,
    log: &Logger,
) where
    C: Connection,
    F: ConnectionFactory<Connection = C>,
{
    for _ in 0..count {
        if pool.shutting_down() {
            return;
        }

        match pool.create_handle(partition) {
            Ok(handle) => {
                partition.increment_created();
                if let Err(rejected) = partition.offer_free(handle) {
                    if !pool.shutting_down() {
                        let invariant = Error::InternalInvariant(
                            String::from(
                                "free queue rejected a newly created \
                                 connection",
                            ),
                        );
                        error!(log, "{}", invariant);
                    }
                    pool.destroy_connection(rejected);
                    return;
                }
            }
            Err(fill_err) => {
                error!(
                    log,
                    "error in trying to obtain a connection, retrying in \
                     {}ms: {}",
                    pool.acquire_retry_delay.as_millis(),
                    fill_err
                );
                // A latched-down server also stops accepting refill
                // signals until one of its connections is destroyed.
                if partition.server_is_down() {
                    partition.set_unable_to_create_more(true);
                }
                thread::sleep(pool.acquire_retry_delay);
                return;
            }
        }
    }
}
