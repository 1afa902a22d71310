//! Named advisory locks.
//!
//! Acquisition never blocks: a lock held elsewhere yields
//! [`ShipwrightError::Wait`] so the task queue reschedules the job instead of
//! parking a worker.
//!
//! A local table serializes the workers of one process. When a
//! [`LeaseStore`] is attached, every acquisition also takes a lease in the
//! shared store, so the CLI and the daemon exclude each other too. Leases
//! expire after a TTL, which frees the keys of a process that died.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use shipwright_state::{Lease, LeaseStore, RecordStore};
use tracing::{debug, warn};

use crate::error::{Result, ShipwrightError};

/// Keyed lock service shared by all workers of one process.
#[derive(Clone)]
pub struct KeyedLocks {
    held: Arc<Mutex<HashSet<String>>>,
    leases: Option<Arc<dyn RecordStore>>,
    /// Identity of this lock table in the lease store
    holder: String,
    retry_delay: Duration,
    lease_ttl: Duration,
}

impl KeyedLocks {
    /// Process-local locks only.
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            leases: None,
            holder: uuid::Uuid::new_v4().to_string(),
            retry_delay,
            lease_ttl: Duration::from_secs(8 * 3600),
        }
    }

    /// Also take a lease in `store` for every lock.
    pub fn with_leases(mut self, store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        self.leases = Some(store);
        self.lease_ttl = ttl;
        self
    }

    /// Suggested delay before retrying a contended lock.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    fn contended(&self, key: &str) -> ShipwrightError {
        debug!(lock = %key, "lock contended");
        ShipwrightError::wait(self.retry_delay, format!("lock {key} is held"))
    }

    fn release_local(held: &Mutex<HashSet<String>>, key: &str) {
        if let Ok(mut held) = held.lock() {
            held.remove(key);
        }
    }

    /// Take the lock `key` or fail with a `Wait` error.
    pub async fn try_acquire(&self, key: impl Into<String>) -> Result<LockGuard> {
        let key = key.into();
        {
            let mut held = self
                .held
                .lock()
                .map_err(|_| ShipwrightError::Invariant("lock table poisoned".into()))?;
            if !held.insert(key.clone()) {
                return Err(self.contended(&key));
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        if let Some(store) = &self.leases {
            let ttl = chrono::Duration::from_std(self.lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(8));
            let lease = Lease {
                key: key.clone(),
                holder: self.holder.clone(),
                token: token.clone(),
                expires_at: Utc::now() + ttl,
            };
            match store.acquire_lease(&lease).await {
                Ok(true) => {}
                Ok(false) => {
                    Self::release_local(&self.held, &key);
                    return Err(self.contended(&key));
                }
                Err(e) => {
                    Self::release_local(&self.held, &key);
                    return Err(e.into());
                }
            }
        }

        debug!(lock = %key, "lock acquired");
        Ok(LockGuard {
            key,
            token,
            held: Arc::clone(&self.held),
            leases: self.leases.clone(),
        })
    }

    /// Held by a worker of this process.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().map(|h| h.contains(key)).unwrap_or(false)
    }

    /// Lock name for a git working directory on a host.
    pub fn git_key(host: &str, path: &str) -> String {
        format!("git:{host}:{path}")
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl std::fmt::Debug for KeyedLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("holder", &self.holder)
            .field("shared", &self.leases.is_some())
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

/// Releases its lock on drop.
///
/// Dropping releases the lease in the background; [`LockGuard::release`]
/// waits for it.
pub struct LockGuard {
    key: String,
    token: String,
    held: Arc<Mutex<HashSet<String>>>,
    leases: Option<Arc<dyn RecordStore>>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        if let Some(store) = self.leases.take() {
            if let Err(e) = store.release_lease(&self.key, &self.token).await {
                warn!(lock = %self.key, error = %e, "could not release lease");
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        KeyedLocks::release_local(&self.held, &self.key);
        let Some(store) = self.leases.take() else {
            return;
        };
        let (key, token) = (self.key.clone(), self.token.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release_lease(&key, &token).await {
                        warn!(lock = %key, error = %e, "could not release lease");
                    }
                });
            }
            Err(_) => warn!(lock = %key, "no runtime to release lease; it will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_state::fakes::MemoryRecordStore;

    #[tokio::test]
    async fn contention_is_a_wait_not_a_block() {
        let locks = KeyedLocks::new(Duration::from_secs(3));
        let guard = locks.try_acquire("release_1").await.unwrap();

        let err = locks.try_acquire("release_1").await.unwrap_err();
        assert!(err.ignores_retry_budget());
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(3)));

        // Other keys are independent.
        let _other = locks.try_acquire("release_2").await.unwrap();

        drop(guard);
        assert!(!locks.is_held("release_1"));
        assert!(locks.try_acquire("release_1").await.is_ok());
    }

    #[tokio::test]
    async fn clones_share_the_table() {
        let a = KeyedLocks::default();
        let b = a.clone();
        let _g = a.try_acquire(KeyedLocks::git_key("h", "/src")).await.unwrap();
        assert!(b.is_held("git:h:/src"));
    }

    #[tokio::test]
    async fn lock_tables_sharing_a_store_exclude_each_other() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let ttl = Duration::from_secs(60);
        let cli = KeyedLocks::default().with_leases(store.clone(), ttl);
        let daemon = KeyedLocks::default().with_leases(store.clone(), ttl);

        let guard = cli.try_acquire("release_7").await.unwrap();
        let err = daemon.try_acquire("release_7").await.unwrap_err();
        assert!(matches!(err, ShipwrightError::Wait { .. }));
        // a failed attempt leaves nothing behind locally
        assert!(!daemon.is_held("release_7"));

        guard.release().await;
        assert!(store.get_lease("release_7").await.unwrap().is_none());
        let again = daemon.try_acquire("release_7").await.unwrap();
        assert!(cli.try_acquire("release_7").await.is_err());
        again.release().await;
    }

    #[tokio::test]
    async fn reacquire_after_drop_in_the_same_process() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let locks = KeyedLocks::default().with_leases(store.clone(), Duration::from_secs(60));

        let first = locks.try_acquire("testrun_b").await.unwrap();
        drop(first);
        // the background release of `first` may not have run yet
        let second = locks.try_acquire("testrun_b").await.unwrap();
        tokio::task::yield_now().await;
        let lease = store.get_lease("testrun_b").await.unwrap().unwrap();
        assert_eq!(lease.token, second.token);
    }
}
