use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::db::Db;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

/// Deterministic advisory-lock key for a (feature, environment) pair: the
/// first eight bytes of SHA-256 over the NUL-joined pair.
pub fn lock_key(feature_name: &str, environment: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(feature_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(environment.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Cooperative, non-blocking-acquire exclusive lock keyed by an i64. Used
/// only for mutual exclusion between coordinator invocations; a failed
/// acquisition is an expected outcome, never an error.
#[async_trait]
pub trait MigrationLock: Send + Sync {
    /// True when the lock was taken; false on contention. Never blocks.
    async fn try_acquire(&self, key: i64) -> Result<bool, LockError>;

    async fn release(&self, key: i64) -> Result<(), LockError>;
}

pub fn memory() -> Arc<dyn MigrationLock> {
    Arc::new(MemoryMigrationLock::default())
}

pub fn postgres(db: Arc<Db>) -> Arc<dyn MigrationLock> {
    Arc::new(PostgresMigrationLock {
        db,
        held: Mutex::new(HashSet::new()),
    })
}

#[derive(Default)]
struct MemoryMigrationLock {
    held: Mutex<HashSet<i64>>,
}

#[async_trait]
impl MigrationLock for MemoryMigrationLock {
    async fn try_acquire(&self, key: i64) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        Ok(held.insert(key))
    }

    async fn release(&self, key: i64) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        if !held.remove(&key) {
            tracing::warn!(key, "released a migration lock that was not held");
        }
        Ok(())
    }
}

struct PostgresMigrationLock {
    db: Arc<Db>,
    // Postgres session advisory locks are re-entrant within one session, and
    // all store traffic shares one session here. Tracking held keys locally
    // keeps same-process contention observable.
    held: Mutex<HashSet<i64>>,
}

#[async_trait]
impl MigrationLock for PostgresMigrationLock {
    async fn try_acquire(&self, key: i64) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        if held.contains(&key) {
            return Ok(false);
        }
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
            .await
            .map_err(|error| LockError::Backend(error.to_string()))?;
        let acquired: bool = row
            .try_get(0)
            .map_err(|error| LockError::Backend(error.to_string()))?;
        if acquired {
            held.insert(key);
        }
        Ok(acquired)
    }

    async fn release(&self, key: i64) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one("SELECT pg_advisory_unlock($1)", &[&key])
            .await
            .map_err(|error| LockError::Backend(error.to_string()))?;
        let released: bool = row
            .try_get(0)
            .map_err(|error| LockError::Backend(error.to_string()))?;
        held.remove(&key);
        if !released {
            tracing::warn!(key, "advisory unlock reported a lock that was not held");
        }
        Ok(())
    }
}
