//! Fixed-size pool of independent sessions.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::channel::Connector;
use crate::error::{RemoteError, RemoteResult};
use crate::session::{RemoteSession, SessionConfig};

/// A set of sessions to the same endpoint, checked out one per caller.
///
/// A lease gives its holder a session no other lease holder is using, so
/// concurrent runs never queue behind each other on one channel.
pub struct SessionPool {
    sessions: Vec<Arc<RemoteSession>>,
    free: Mutex<Vec<usize>>,
    permits: Semaphore,
}

impl SessionPool {
    /// Build a pool from existing sessions.
    pub fn new(sessions: Vec<RemoteSession>) -> Self {
        let size = sessions.len();
        Self {
            sessions: sessions.into_iter().map(Arc::new).collect(),
            free: Mutex::new((0..size).rev().collect()),
            permits: Semaphore::new(size),
        }
    }

    /// Build a pool of `size` sessions sharing one connector.
    pub fn with_connector(connector: Arc<dyn Connector>, config: SessionConfig, size: usize) -> Self {
        let sessions = (0..size.max(1))
            .map(|_| RemoteSession::new(connector.clone(), config.clone()))
            .collect();
        Self::new(sessions)
    }

    /// Number of sessions in the pool.
    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions not currently leased.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free session.
    pub async fn acquire(&self) -> RemoteResult<SessionLease<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RemoteError::Closed)?;
        let index = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(RemoteError::Closed)?;
        Ok(SessionLease {
            pool: self,
            index,
            _permit: permit,
        })
    }

    /// Close every session and refuse further leases.
    pub async fn close_all(&self) {
        self.permits.close();
        for session in &self.sessions {
            session.close().await;
        }
    }
}

/// A checked-out session, returned to the pool on drop.
pub struct SessionLease<'a> {
    pool: &'a SessionPool,
    index: usize,
    _permit: SemaphorePermit<'a>,
}

impl Deref for SessionLease<'_> {
    type Target = RemoteSession;

    fn deref(&self) -> &RemoteSession {
        &self.pool.sessions[self.index]
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.pool
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.index);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockRemote;

    #[tokio::test]
    async fn test_leases_are_distinct() {
        let remote = MockRemote::new();
        let pool = SessionPool::with_connector(remote.connector(), SessionConfig::default(), 2);
        assert_eq!(pool.size(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(!std::ptr::eq(&*a, &*b));
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().await.unwrap();
        assert!(!std::ptr::eq(&*b, &*c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let remote = MockRemote::new();
        let pool = SessionPool::with_connector(remote.connector(), SessionConfig::default(), 1);

        let lease = pool.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_secs(1), pool.acquire()).await;
        assert!(waiting.is_err());

        drop(lease);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_all_refuses_new_leases() {
        let remote = MockRemote::new();
        let pool = SessionPool::with_connector(remote.connector(), SessionConfig::default(), 2);
        pool.acquire()
            .await
            .unwrap()
            .execute("true", Duration::from_secs(1))
            .await
            .unwrap();

        pool.close_all().await;
        assert!(matches!(pool.acquire().await, Err(RemoteError::Closed)));
    }
}
