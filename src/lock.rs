//! Per-pool exclusive sections.
//!
//! Every operation that computes a pool's free set and then commits a new
//! allocation holds that pool's section for the whole sequence. Different
//! pools never contend. Waiting is bounded: a caller that cannot enter
//! within the timeout gets [`Error::Busy`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Error, Result};

/// Held for the duration of a pool's unit of work; dropping it leaves the section.
pub type PoolGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
pub struct PoolLocks {
    sections: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl PoolLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sections: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn section(&self, pool_id: u64) -> Result<Arc<AsyncMutex<()>>> {
        let mut sections = self
            .sections
            .lock()
            .map_err(|_| Error::Store("pool lock table poisoned".to_string()))?;
        Ok(Arc::clone(sections.entry(pool_id).or_default()))
    }

    /// Enters the exclusive section for `pool_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if the section is not free within the timeout.
    pub async fn acquire(&self, pool_id: u64) -> Result<PoolGuard> {
        let section = self.section(pool_id)?;
        tokio::time::timeout(self.timeout, section.lock_owned())
            .await
            .map_err(|_| Error::Busy {
                pool_id,
                waited_ms: self.timeout.as_millis() as u64,
            })
    }

    /// Drops the section for a deleted pool.
    pub fn forget(&self, pool_id: u64) {
        if let Ok(mut sections) = self.sections.lock() {
            sections.remove(&pool_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_pool_times_out_while_held() {
        let locks = PoolLocks::new(Duration::from_millis(20));
        let _held = locks.acquire(1).await.unwrap();

        let result = locks.acquire(1).await;
        assert!(matches!(result, Err(Error::Busy { pool_id: 1, .. })));
    }

    #[tokio::test]
    async fn test_different_pools_do_not_contend() {
        let locks = PoolLocks::new(Duration::from_millis(20));
        let _first = locks.acquire(1).await.unwrap();
        assert!(locks.acquire(2).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_allows_reentry() {
        let locks = PoolLocks::new(Duration::from_millis(20));
        {
            let _held = locks.acquire(1).await.unwrap();
        }
        assert!(locks.acquire(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_enters_after_release() {
        let locks = Arc::new(PoolLocks::new(Duration::from_secs(5)));
        let held = locks.acquire(3).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(3).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }
}
