// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{warn, Logger};

use crate::connection::Connection;
use crate::server::ServerInfo;

// The pool's internal wrapper around one live connection. A handle is
// possessed exclusively: it lives either in its partition's free queue, in
// the hands of a reaper performing a detached probe, or inside the
// `PooledConnection` guard of exactly one caller. Moves between those
// owners transfer the wrapped connection with it.
//
// The connection slot is an Option so the close path can take the
// connection out exactly once, and so the slot can be swapped during a
// reacquire without giving up the handle itself.
#[derive(Debug)]
pub(crate) struct ConnectionHandle<C> {
    server: Arc<ServerInfo>,
    partition: usize,
    conn: Option<C>,
    created_at: Instant,
    last_used: Instant,
    last_reset: Instant,
    possibly_broken: bool,
    logically_closed: bool,
}

impl<C> ConnectionHandle<C>
where
    C: Connection,
{
    pub fn new(
        server: Arc<ServerInfo>,
        partition: usize,
        conn: Option<C>,
    ) -> Self {
        let now = Instant::now();
        ConnectionHandle {
            server,
            partition,
            conn,
            created_at: now,
            last_used: now,
            last_reset: now,
            possibly_broken: false,
            logically_closed: true,
        }
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn server_ref(&self) -> Arc<ServerInfo> {
        Arc::clone(&self.server)
    }

    pub fn partition_index(&self) -> usize {
        self.partition
    }

    pub fn connection(&self) -> &C {
        self.conn.as_ref().unwrap()
    }

    pub fn connection_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap()
    }

    pub fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    /// Swap in a freshly created connection, returning the previous one so
    /// the caller can dispose of it. Used by the reacquire path to keep the
    /// handle identity stable across a transport replacement.
    pub fn replace_connection(&mut self, conn: C) -> Option<C> {
        self.conn.replace(conn)
    }

    pub fn touch_last_used(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn touch_last_reset(&mut self) {
        self.last_reset = Instant::now();
    }

    pub fn last_reset(&self) -> Instant {
        self.last_reset
    }

    pub fn possibly_broken(&self) -> bool {
        self.possibly_broken
    }

    pub fn set_possibly_broken(&mut self, broken: bool) {
        self.possibly_broken = broken;
    }

    pub fn logically_closed(&self) -> bool {
        self.logically_closed
    }

    pub fn set_logically_closed(&mut self, closed: bool) {
        self.logically_closed = closed;
    }

    /// True once the handle has outlived the configured absolute TTL.
    pub fn is_expired(&self, m_max_age: Option<Duration>) -> bool {
        match m_max_age {
            Some(max_age) => self.created_at.elapsed() >= max_age,
            None => false,
        }
    }

    /// True once the handle has sat unused longer than the idle TTL.
    pub fn is_idle_expired(&self, m_idle_max_age: Option<Duration>) -> bool {
        match m_idle_max_age {
            Some(idle_max_age) => self.last_used.elapsed() >= idle_max_age,
            None => false,
        }
    }

    /// Close the wrapped connection. The Option take makes this a one-shot
    /// operation even if a reaper and the shutdown path race to the same
    /// handle.
    pub fn internal_close(&mut self, log: &Logger) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(close_err) = conn.close() {
                warn!(
                    log,
                    "failed to close connection to {}: {}",
                    self.server,
                    close_err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use slog::{o, Drain, Logger};

    use crate::error::Error;

    #[derive(Debug)]
    struct NullConnection {
        closes: usize,
    }

    impl Connection for NullConnection {
        type Error = Error;

        fn close(&mut self) -> Result<(), Error> {
            self.closes += 1;
            Ok(())
        }
    }

    fn test_handle() -> ConnectionHandle<NullConnection> {
        let server = Arc::new(ServerInfo::new("127.0.0.1", 9090));
        ConnectionHandle::new(server, 0, Some(NullConnection { closes: 0 }))
    }

    fn test_log() -> Logger {
        Logger::root(slog_stdlog::StdLog.fuse(), o!())
    }

    #[test]
    fn expiry_disabled_when_unconfigured() {
        let handle = test_handle();
        assert!(!handle.is_expired(None));
        assert!(!handle.is_idle_expired(None));
    }

    #[test]
    fn expiry_fires_after_ttl() {
        let handle = test_handle();
        thread::sleep(Duration::from_millis(30));
        assert!(handle.is_expired(Some(Duration::from_millis(10))));
        assert!(!handle.is_expired(Some(Duration::from_secs(60))));
        assert!(handle.is_idle_expired(Some(Duration::from_millis(10))));
    }

    #[test]
    fn touch_resets_idle_clock() {
        let mut handle = test_handle();
        thread::sleep(Duration::from_millis(30));
        handle.touch_last_used();
        assert!(!handle.is_idle_expired(Some(Duration::from_millis(20))));
    }

    #[test]
    fn internal_close_is_one_shot() {
        let mut handle = test_handle();
        let log = test_log();
        handle.internal_close(&log);
        assert!(!handle.has_connection());
        // second close finds no connection to close
        handle.internal_close(&log);
    }

    #[test]
    fn replace_connection_returns_previous() {
        let mut handle = test_handle();
        let old = handle.replace_connection(NullConnection { closes: 0 });
        assert!(old.is_some());
        assert!(handle.has_connection());
    }
}
