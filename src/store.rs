//! Transactional record storage.
//!
//! The engine talks to storage only through [`RecordStore`]. A transaction
//! runs against a working copy of the record tables; the copy replaces the
//! committed state only when the closure returns `Ok`, so a failed operation
//! leaves no partial writes behind. Transactions are serialized.
//!
//! The audit log is never copied: a transaction starts with an empty
//! `audit_log` and the entries it appends are moved onto the committed log
//! when it commits.
//!
//! Committed state reaches disk through [`RecordStore::save`], which runs
//! outside the table lock. [`RecordStore::maybe_save`] skips the write when
//! the last save was less than [`SAVE_INTERVAL_MILLIS`] ago.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::model::{Allocation, AuditEntry, Pool};

/// Minimum time between deferred saves.
///
/// Bounds disk I/O under a steady stream of operations. Committed state
/// newer than the last save is written by the next due `maybe_save` or an
/// explicit `save`.
pub const SAVE_INTERVAL_MILLIS: u64 = 5000;

/// The four logical tables plus id counters.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tables {
    pub pools: BTreeMap<u64, Pool>,
    pub allocations: BTreeMap<u64, Allocation>,
    pub leases: BTreeMap<u64, Lease>,
    /// Append-only. Inside a transaction this holds only the entries the
    /// transaction has appended so far.
    pub audit_log: Vec<AuditEntry>,
    #[serde(default)]
    last_pool_id: u64,
    #[serde(default)]
    last_allocation_id: u64,
    #[serde(default)]
    last_lease_id: u64,
    #[serde(default)]
    last_audit_id: u64,
}

impl Tables {
    pub fn next_pool_id(&mut self) -> u64 {
        self.last_pool_id += 1;
        self.last_pool_id
    }

    pub fn next_allocation_id(&mut self) -> u64 {
        self.last_allocation_id += 1;
        self.last_allocation_id
    }

    pub fn next_lease_id(&mut self) -> u64 {
        self.last_lease_id += 1;
        self.last_lease_id
    }

    pub fn pool(&self, pool_id: u64) -> Result<&Pool> {
        self.pools.get(&pool_id).ok_or(Error::PoolNotFound(pool_id))
    }

    pub fn pool_mut(&mut self, pool_id: u64) -> Result<&mut Pool> {
        self.pools
            .get_mut(&pool_id)
            .ok_or(Error::PoolNotFound(pool_id))
    }

    pub fn pool_by_name(&self, name: &str) -> Option<&Pool> {
        self.pools.values().find(|pool| pool.name == name)
    }

    pub fn allocation(&self, allocation_id: u64) -> Result<&Allocation> {
        self.allocations
            .get(&allocation_id)
            .ok_or(Error::AllocationNotFound(allocation_id))
    }

    pub fn lease(&self, lease_id: u64) -> Result<&Lease> {
        self.leases
            .get(&lease_id)
            .ok_or(Error::LeaseNotFound(lease_id))
    }

    pub fn active_allocations(&self, pool_id: u64) -> impl Iterator<Item = &Allocation> {
        self.allocations
            .values()
            .filter(move |allocation| allocation.pool_id == pool_id && allocation.active)
    }

    pub fn lease_for_allocation(&self, allocation_id: u64) -> Option<&Lease> {
        self.leases
            .values()
            .find(|lease| lease.allocation_id == allocation_id)
    }

    pub fn lease_for_allocation_mut(&mut self, allocation_id: u64) -> Option<&mut Lease> {
        self.leases
            .values_mut()
            .find(|lease| lease.allocation_id == allocation_id)
    }

    /// Appends an audit entry, assigning its id.
    pub fn append_audit(&mut self, mut entry: AuditEntry) -> u64 {
        self.last_audit_id += 1;
        entry.id = self.last_audit_id;
        self.audit_log.push(entry);
        self.last_audit_id
    }

    /// Copies everything but the audit log.
    fn working_copy(&self) -> Tables {
        Tables {
            pools: self.pools.clone(),
            allocations: self.allocations.clone(),
            leases: self.leases.clone(),
            audit_log: Vec::new(),
            last_pool_id: self.last_pool_id,
            last_allocation_id: self.last_allocation_id,
            last_lease_id: self.last_lease_id,
            last_audit_id: self.last_audit_id,
        }
    }

    /// Replaces committed state with `working`, appending its staged audit entries.
    fn commit(&mut self, mut working: Tables) {
        let staged = std::mem::take(&mut working.audit_log);
        working.audit_log = std::mem::take(&mut self.audit_log);
        working.audit_log.extend(staged);
        *self = working;
    }
}

/// Storage the engine runs its units of work against.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Runs `f` against a consistent snapshot of committed state.
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R>;

    /// Runs `f` as one atomic unit of work.
    ///
    /// Writes made by `f` become visible only if it returns `Ok`.
    fn transaction<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R>;

    /// Writes committed state to durable storage if anything changed since
    /// the last save.
    async fn save(&self) -> Result<()>;

    /// Like [`save`](RecordStore::save), but may defer the write.
    async fn maybe_save(&self) -> Result<()> {
        self.save().await
    }
}

#[derive(Debug)]
struct Committed {
    tables: Tables,
    /// Bumped on every commit.
    generation: u64,
}

/// Record store kept in memory and, when opened from a path, saved to a
/// JSON file.
#[derive(Debug)]
pub struct JsonStore {
    committed: RwLock<Committed>,
    path: Option<PathBuf>,
    saved_generation: AtomicU64,
    /// Serializes saves; holds the time of the last one.
    last_save: Mutex<Instant>,
    save_interval: Duration,
}

impl JsonStore {
    fn with_tables(tables: Tables, path: Option<PathBuf>) -> Self {
        Self {
            committed: RwLock::new(Committed {
                tables,
                generation: 0,
            }),
            path,
            saved_generation: AtomicU64::new(0),
            last_save: Mutex::new(Instant::now()),
            save_interval: Duration::from_millis(SAVE_INTERVAL_MILLIS),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_tables(Tables::default(), None)
    }

    /// Opens a file-backed store, loading existing records if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tables = if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            serde_json::from_str(&content)?
        } else {
            Tables::default()
        };

        debug!(
            "Opened record store {} ({} pools, {} allocations)",
            path.display(),
            tables.pools.len(),
            tables.allocations.len()
        );

        Ok(Self::with_tables(tables, Some(path.to_path_buf())))
    }

    fn committed(&self) -> Result<std::sync::RwLockReadGuard<'_, Committed>> {
        self.committed.read().map_err(|_| poisoned())
    }
}

impl Default for JsonStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn poisoned() -> Error {
    Error::Store("record store lock poisoned".to_string())
}

fn staging_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", path.display()))
}

/// Writes `content` to a staging file and renames it over `path`.
///
/// The staging file is removed if either step fails.
async fn write_replacing(path: &Path, content: String) -> Result<()> {
    let staging = staging_path(path);
    let written = match tokio::fs::write(&staging, content).await {
        Ok(()) => tokio::fs::rename(&staging, path).await,
        Err(error) => Err(error),
    };
    if let Err(error) = written {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(error.into());
    }
    Ok(())
}

#[async_trait::async_trait]
impl RecordStore for JsonStore {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R> {
        let committed = self.committed()?;
        Ok(f(&committed.tables))
    }

    fn transaction<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut committed = self.committed.write().map_err(|_| poisoned())?;
        let mut working = committed.tables.working_copy();
        let result = f(&mut working)?;
        committed.tables.commit(working);
        committed.generation += 1;
        Ok(result)
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut last_save = self.last_save.lock().await;
        let (content, generation) = {
            let committed = self.committed()?;
            if committed.generation == self.saved_generation.load(Ordering::Acquire) {
                return Ok(());
            }
            (
                serde_json::to_string_pretty(&committed.tables)?,
                committed.generation,
            )
        };

        write_replacing(path, content).await?;
        self.saved_generation.store(generation, Ordering::Release);
        *last_save = Instant::now();
        debug!("Saved record store {} (generation {})", path.display(), generation);
        Ok(())
    }

    async fn maybe_save(&self) -> Result<()> {
        if self.path.is_none() {
            return Ok(());
        }
        if self.last_save.lock().await.elapsed() < self.save_interval {
            return Ok(());
        }
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditAction, NewPool};
    use chrono::Utc;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
            let _ = std::fs::remove_dir(&self.0);
            let _ = std::fs::remove_file(format!("{}.tmp", self.0));
        }
    }

    fn insert_pool(tables: &mut Tables, name: &str) -> u64 {
        let new_pool = NewPool::new(name, "10.0.0.0/24");
        let now = Utc::now();
        let id = tables.next_pool_id();
        tables.pools.insert(
            id,
            Pool {
                id,
                name: new_pool.name,
                cidr: new_pool.cidr,
                description: None,
                gateway: None,
                dns_servers: vec![],
                reserved_ranges: vec![],
                created_at: now,
                updated_at: now,
                active: true,
            },
        );
        id
    }

    fn audit(tables: &mut Tables, pool_id: u64) -> u64 {
        tables.append_audit(AuditEntry::success(
            AuditAction::Allocate,
            Some(pool_id),
            None,
            None,
            Utc::now(),
        ))
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let store = JsonStore::in_memory();
        let id = store
            .transaction(|tables| Ok(insert_pool(tables, "lan")))
            .unwrap();

        let name = store
            .read(|tables| tables.pool(id).map(|pool| pool.name.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(name, "lan");
    }

    #[test]
    fn test_error_rolls_back_all_writes() {
        let store = JsonStore::in_memory();
        let result: Result<()> = store.transaction(|tables| {
            let id = insert_pool(tables, "first");
            audit(tables, id);
            insert_pool(tables, "second");
            Err(Error::PoolExhausted)
        });
        assert!(matches!(result, Err(Error::PoolExhausted)));

        let (pools, entries) = store
            .read(|tables| (tables.pools.len(), tables.audit_log.len()))
            .unwrap();
        assert_eq!(pools, 0);
        assert_eq!(entries, 0);
    }

    #[test]
    fn test_audit_log_is_staged_not_copied() {
        let store = JsonStore::in_memory();
        for _ in 0..3 {
            store
                .transaction(|tables| Ok(audit(tables, 1)))
                .unwrap();
        }

        let (seen, id) = store
            .transaction(|tables| {
                let seen = tables.audit_log.len();
                Ok((seen, audit(tables, 1)))
            })
            .unwrap();
        assert_eq!(seen, 0);
        assert_eq!(id, 4);

        let ids: Vec<u64> = store
            .read(|tables| tables.audit_log.iter().map(|entry| entry.id).collect())
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut tables = Tables::default();
        assert_eq!(tables.next_pool_id(), 1);
        assert_eq!(tables.next_pool_id(), 2);
        assert_eq!(tables.next_allocation_id(), 1);
        assert_eq!(tables.next_lease_id(), 1);
    }

    #[test]
    fn test_missing_records() {
        let tables = Tables::default();
        assert!(matches!(tables.pool(7), Err(Error::PoolNotFound(7))));
        assert!(matches!(tables.allocation(8), Err(Error::AllocationNotFound(8))));
        assert!(matches!(tables.lease(9), Err(Error::LeaseNotFound(9))));
    }

    #[tokio::test]
    async fn test_store_persistence() {
        let path = "test_store_persist.json".to_string();
        let _guard = TestGuard(path.clone());

        {
            let store = JsonStore::open(&path).await.unwrap();
            store
                .transaction(|tables| {
                    let id = insert_pool(tables, "persisted");
                    audit(tables, id);
                    Ok(())
                })
                .unwrap();
            store.save().await.unwrap();
        }

        let store = JsonStore::open(&path).await.unwrap();
        let (name, next_id, entries) = store
            .transaction(|tables| {
                let name = tables.pool_by_name("persisted").map(|pool| pool.name.clone());
                Ok((name, tables.next_pool_id(), audit(tables, 1)))
            })
            .unwrap();
        assert_eq!(name.as_deref(), Some("persisted"));
        assert_eq!(next_id, 2);
        assert_eq!(entries, 2);
    }

    #[tokio::test]
    async fn test_maybe_save_waits_for_interval() {
        let path = "test_store_deferred.json".to_string();
        let _guard = TestGuard(path.clone());

        let store = JsonStore::open(&path).await.unwrap();
        store
            .transaction(|tables| Ok(insert_pool(tables, "deferred")))
            .unwrap();

        store.maybe_save().await.unwrap();
        assert!(!Path::new(&path).exists());

        store.save().await.unwrap();
        assert!(Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_failed_save_removes_staging_file() {
        let path = "test_store_rename_target".to_string();
        let _guard = TestGuard(path.clone());

        let store = JsonStore::open(&path).await.unwrap();
        store
            .transaction(|tables| Ok(insert_pool(tables, "lan")))
            .unwrap();

        std::fs::create_dir(&path).unwrap();
        assert!(store.save().await.is_err());
        assert!(!Path::new(&format!("{}.tmp", path)).exists());
    }

    #[tokio::test]
    async fn test_in_memory_save_is_noop() {
        let store = JsonStore::in_memory();
        store
            .transaction(|tables| Ok(insert_pool(tables, "lan")))
            .unwrap();
        assert!(store.save().await.is_ok());
        assert!(store.maybe_save().await.is_ok());
    }
}
