//! In-memory ledger for tests and development
//!
//! Version rows live in an arena keyed by `(key, version)`; the current row of
//! a key is the one with the highest version. Like a relational store, a
//! locking read only locks a row that exists, so two transactions on a key
//! with no rows can both stage version 1 and the second commit fails with a
//! conflict.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::key::StateKey;
use crate::ledger::{
    CurrentRow, DEFAULT_CALL_TIMEOUT, Ledger, LedgerConfig, LedgerError, LedgerResult,
    LedgerTransaction, with_deadline,
};

/// One stored version of a state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRow {
    pub version: i64,
    pub lock_token: Option<String>,
    pub blob: Vec<u8>,
}

type Arena = BTreeMap<(StateKey, i64), VersionRow>;

#[derive(Default)]
struct Shared {
    rows: Mutex<Arena>,
    row_locks: Mutex<HashMap<StateKey, Arc<Mutex<()>>>>,
}

/// Ledger keeping all versions in process memory
#[derive(Clone)]
pub struct MemoryLedger {
    shared: Arc<Shared>,
    timeout: Duration,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CALL_TIMEOUT)
    }

    /// Create a ledger whose row-lock waits give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            timeout,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> LedgerResult<Self> {
        Ok(Self::with_timeout(config.call_timeout()?))
    }

    /// All committed versions of `key`, oldest first
    pub async fn versions(&self, key: &StateKey) -> Vec<VersionRow> {
        let rows = self.shared.rows.lock().await;
        rows.range(key_range(key)).map(|(_, row)| row.clone()).collect()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn init(&self) -> LedgerResult<()> {
        Ok(())
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            timeout: self.timeout,
            held: HashMap::new(),
            staged: Vec::new(),
        }))
    }
}

fn key_range(key: &StateKey) -> RangeInclusive<(StateKey, i64)> {
    (key.clone(), i64::MIN)..=(key.clone(), i64::MAX)
}

enum Staged {
    Insert {
        key: StateKey,
        row: VersionRow,
    },
    SetToken {
        key: StateKey,
        version: i64,
        lock_token: Option<String>,
    },
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    timeout: Duration,
    held: HashMap<StateKey, OwnedMutexGuard<()>>,
    staged: Vec<Staged>,
}

impl MemoryTransaction {
    async fn lock_row(&mut self, key: &StateKey) -> LedgerResult<()> {
        if self.held.contains_key(key) {
            return Ok(());
        }

        let lock = {
            let mut locks = self.shared.row_locks.lock().await;
            // Drop locks nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let guard = with_deadline(self.timeout, async { Ok(lock.lock_owned().await) }).await?;
        self.held.insert(key.clone(), guard);
        Ok(())
    }

    /// Current row of `key` as seen by this transaction
    fn current_row(&self, rows: &Arena, key: &StateKey) -> Option<VersionRow> {
        let mut current = rows
            .range(key_range(key))
            .next_back()
            .map(|(_, row)| row.clone());

        for change in &self.staged {
            match change {
                Staged::Insert { key: staged, row } if staged == key => {
                    if current.as_ref().is_none_or(|c| row.version > c.version) {
                        current = Some(row.clone());
                    }
                }
                Staged::SetToken {
                    key: staged,
                    version,
                    lock_token,
                } if staged == key => {
                    if let Some(current) = current.as_mut()
                        && current.version == *version
                    {
                        current.lock_token = lock_token.clone();
                    }
                }
                _ => {}
            }
        }

        current
    }

    fn row_exists(&self, rows: &Arena, key: &StateKey, version: i64) -> bool {
        rows.contains_key(&(key.clone(), version))
            || self.staged.iter().any(|change| {
                matches!(change, Staged::Insert { key: staged, row } if staged == key && row.version == version)
            })
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn locking_read_current(&mut self, key: &StateKey) -> LedgerResult<Option<CurrentRow>> {
        loop {
            let current = {
                let rows = self.shared.rows.lock().await;
                self.current_row(&rows, key)
            };

            match current {
                // Lock, then read again: the holder may have committed a newer version
                Some(_) if !self.held.contains_key(key) => self.lock_row(key).await?,
                current => {
                    return Ok(current.map(|row| CurrentRow {
                        version: row.version,
                        lock_token: row.lock_token,
                    }));
                }
            }
        }
    }

    async fn read_current_blob(&mut self, key: &StateKey) -> LedgerResult<Option<Vec<u8>>> {
        let rows = self.shared.rows.lock().await;
        Ok(self.current_row(&rows, key).map(|row| row.blob))
    }

    async fn insert_version(
        &mut self,
        key: &StateKey,
        version: i64,
        lock_token: Option<&str>,
        blob: &[u8],
    ) -> LedgerResult<u64> {
        let rows = self.shared.rows.lock().await;
        if self.row_exists(&rows, key, version) {
            return Err(LedgerError::conflict(key, version));
        }
        drop(rows);

        self.staged.push(Staged::Insert {
            key: key.clone(),
            row: VersionRow {
                version,
                lock_token: lock_token.map(str::to_string),
                blob: blob.to_vec(),
            },
        });
        Ok(1)
    }

    async fn set_lock_token(
        &mut self,
        key: &StateKey,
        version: i64,
        lock_token: Option<&str>,
    ) -> LedgerResult<u64> {
        let rows = self.shared.rows.lock().await;
        if !self.row_exists(&rows, key, version) {
            return Ok(0);
        }
        drop(rows);

        self.staged.push(Staged::SetToken {
            key: key.clone(),
            version,
            lock_token: lock_token.map(str::to_string),
        });
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut rows = shared.rows.lock().await;

        // Another transaction may have committed the same version since we staged it
        for change in &self.staged {
            if let Staged::Insert { key, row } = change
                && rows.contains_key(&(key.clone(), row.version))
            {
                return Err(LedgerError::conflict(key, row.version));
            }
        }

        let MemoryTransaction { staged, held, .. } = *self;
        for change in staged {
            match change {
                Staged::Insert { key, row } => {
                    rows.insert((key, row.version), row);
                }
                Staged::SetToken {
                    key,
                    version,
                    lock_token,
                } => {
                    if let Some(row) = rows.get_mut(&(key, version)) {
                        row.lock_token = lock_token;
                    }
                }
            }
        }

        drop(rows);
        drop(held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}
