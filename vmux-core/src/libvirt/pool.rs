//! C1 — Connection Pool.
//!
//! Maintains a bounded set of RPC sessions against the hypervisor socket.
//! The underlying `virt::connect::Connect` handle is not safe for
//! concurrent use, so every caller must borrow a session and return it on
//! every exit path; this module is the only place that owns a `Connect`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use virt::connect::Connect;

use crate::config::LibvirtConfig;
use crate::error::{Error, Result};

/// One RPC transport to the hypervisor.
pub struct Session {
    conn: Option<Connect>,
}

impl Session {
    fn open(uri: &str) -> Result<Self> {
        let conn = Connect::open(Some(uri))
            .map_err(|e| Error::BackendUnavailable(format!("libvirt connect failed: {e}")))?;
        Ok(Self { conn: Some(conn) })
    }

    /// One cheap RPC used as a liveness probe on acquire.
    fn is_alive(&self) -> bool {
        match &self.conn {
            Some(conn) => conn.is_alive().unwrap_or(false),
            None => false,
        }
    }

    fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close();
        }
    }

    /// Access the underlying connection for a single RPC round-trip.
    pub fn connect(&self) -> &Connect {
        self.conn.as_ref().expect("session connection always present while held")
    }
}

struct Inner {
    uri: String,
    idle: Mutex<VecDeque<Session>>,
    opened: std::sync::atomic::AtomicU64,
    closed: std::sync::atomic::AtomicU64,
    borrowed: std::sync::atomic::AtomicU64,
    permits: Semaphore,
    closed_for_acquire: std::sync::atomic::AtomicBool,
}

/// A bounded pool of at most `N` hypervisor sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

/// RAII guard: returns the session to the pool on drop unless it was taken
/// out and explicitly discarded (e.g. because a liveness probe failed).
pub struct PooledSession {
    session: Option<Session>,
    pool: ConnectionPool,
}

impl std::ops::Deref for PooledSession {
    type Target = Session;
    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present while guard alive")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

impl ConnectionPool {
    pub fn new(config: &LibvirtConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                uri: config.uri.clone(),
                idle: Mutex::new(VecDeque::new()),
                opened: Default::default(),
                closed: Default::default(),
                borrowed: Default::default(),
                permits: Semaphore::new(config.pool_size),
                closed_for_acquire: Default::default(),
            }),
        }
    }

    /// `Acquire(deadline)`: returns an idle session, opens a fresh one if
    /// under capacity, or waits for a release until `deadline` elapses.
    pub async fn acquire(&self, deadline: Duration) -> Result<PooledSession> {
        if self.inner.closed_for_acquire.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("connection pool is closed".into()));
        }

        let permit = tokio::time::timeout(deadline, self.inner.permits.acquire())
            .await
            .map_err(|_| Error::Timeout("timed out acquiring a hypervisor session".into()))?
            .map_err(|_| Error::Internal("connection pool semaphore closed".into()))?;
        permit.forget();

        let mut idle = self.inner.idle.lock().await;
        while let Some(session) = idle.pop_front() {
            if session.is_alive() {
                self.inner.borrowed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                return Ok(PooledSession { session: Some(session), pool: self.clone() });
            }
            // Dead session: discard and account for it, keep looking.
            session.close();
            self.inner.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        drop(idle);

        let session = match Session::open(&self.inner.uri) {
            Ok(session) => session,
            Err(e) => {
                // The permit was already `forget`-ten above; give it back so
                // a failed open doesn't permanently shrink pool capacity.
                self.inner.permits.add_permits(1);
                return Err(e);
            }
        };
        self.inner.opened.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.borrowed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(PooledSession { session: Some(session), pool: self.clone() })
    }

    /// Returns a borrowed session to the idle queue, unless the pool has
    /// since been `close`d — in which case the session is closed instead, so
    /// a borrower returning after `close()` can't resurrect the idle queue
    /// and leave a live session neither `opened` nor `closed` accounts for.
    fn release(&self, session: Session) {
        self.inner.borrowed.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.permits.add_permits(1);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if inner.closed_for_acquire.load(std::sync::atomic::Ordering::SeqCst) {
                session.close();
                inner.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            } else {
                inner.idle.lock().await.push_back(session);
            }
        });
    }

    /// Drains borrowers implicitly (new acquires fail), closes idle
    /// sessions. Borrowed sessions close themselves on drop once their
    /// holder returns them; no release happens back into the idle queue
    /// after `close`.
    pub async fn close(&self) {
        self.inner.closed_for_acquire.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut idle = self.inner.idle.lock().await;
        while let Some(session) = idle.pop_front() {
            session.close();
            self.inner.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opened: self.inner.opened.load(std::sync::atomic::Ordering::SeqCst),
            closed: self.inner.closed.load(std::sync::atomic::Ordering::SeqCst),
            borrowed: self.inner.borrowed.load(std::sync::atomic::Ordering::SeqCst),
        }
    }

    /// Liveness check used by the health aggregator: acquire and
    /// immediately release a session.
    pub async fn health_check(&self, deadline: Duration) -> Result<()> {
        let _session = self.acquire(deadline).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub opened: u64,
    pub closed: u64,
    pub borrowed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_stats_start_at_zero() {
        let config = LibvirtConfig {
            uri: "test:///default".into(),
            pool_size: 4,
            template_dir: "templates".into(),
            acquire_timeout_secs: 5,
        };
        let pool = ConnectionPool::new(&config);
        let stats = pool.stats();
        assert_eq!(stats.opened, 0);
        assert_eq!(stats.closed, 0);
        assert_eq!(stats.borrowed, 0);
    }

    #[tokio::test]
    async fn acquire_and_release_balances_borrowed_count() {
        let config = LibvirtConfig {
            uri: "test:///default".into(),
            pool_size: 2,
            template_dir: "templates".into(),
            acquire_timeout_secs: 5,
        };
        let pool = ConnectionPool::new(&config);
        {
            let _session = pool.acquire(Duration::from_secs(1)).await.expect("acquire against libvirt test driver");
            assert_eq!(pool.stats().borrowed, 1);
        }
        // session dropped -> released asynchronously; give the spawned task a tick
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().borrowed, 0);
    }

    #[tokio::test]
    async fn close_drains_idle_and_rejects_new_acquires() {
        let config = LibvirtConfig {
            uri: "test:///default".into(),
            pool_size: 1,
            template_dir: "templates".into(),
            acquire_timeout_secs: 5,
        };
        let pool = ConnectionPool::new(&config);
        {
            let _session = pool.acquire(Duration::from_secs(1)).await.expect("acquire");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close().await;
        let result = pool.acquire(Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn acquire_restores_permit_after_failed_open() {
        let config = LibvirtConfig {
            uri: "bogus:///nonexistent".into(),
            pool_size: 1,
            template_dir: "templates".into(),
            acquire_timeout_secs: 5,
        };
        let pool = ConnectionPool::new(&config);

        let first = pool.acquire(Duration::from_millis(200)).await;
        assert!(matches!(first, Err(Error::BackendUnavailable(_))));

        // If the first failed open had leaked its permit, this would block
        // for the full deadline and come back as a Timeout instead.
        let second = pool.acquire(Duration::from_millis(200)).await;
        assert!(matches!(second, Err(Error::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn release_after_close_closes_the_session_instead_of_queuing_it() {
        let config = LibvirtConfig {
            uri: "test:///default".into(),
            pool_size: 1,
            template_dir: "templates".into(),
            acquire_timeout_secs: 5,
        };
        let pool = ConnectionPool::new(&config);
        let session = pool.acquire(Duration::from_secs(1)).await.expect("acquire");

        pool.close().await;
        drop(session);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = pool.stats();
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.closed, 1);
    }
}
