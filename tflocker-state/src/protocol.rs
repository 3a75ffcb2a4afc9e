//! Lock-and-write protocol
//!
//! Every operation runs as a single ledger transaction: it starts with a
//! locking read of the key's current row, checks the presented token against
//! the stored one, and then either inserts the next version or flips the lock
//! token of the current row in place. A failed step rolls the whole
//! transaction back before the error is returned.

use std::sync::Arc;

use log::{debug, error, warn};
use thiserror::Error;

use crate::key::StateKey;
use crate::ledger::{Ledger, LedgerError, LedgerTransaction};
use crate::lock::LockToken;

/// Errors returned by protocol operations
#[derive(Debug, Error)]
pub enum StateError {
    /// A write presented a token that does not match the held lock
    #[error("State {key} is locked by another holder")]
    Conflict { key: String },

    /// Lock acquisition while another token holds the lock
    #[error("State {key} is already locked (lock ID: {current})")]
    AlreadyLocked { key: String, current: LockToken },

    /// Unlock with a token that does not hold the lock
    #[error("Can't unlock {key} because the lock is not held by [{token}]")]
    NotHeld { key: String, token: LockToken },

    /// Lock acquisition without a token
    #[error("Lock token must not be empty")]
    EmptyToken,

    /// An insert or update touched an unexpected number of rows
    #[error("{operation} on {key} affected {affected} rows, expected 1")]
    Inconsistency {
        operation: &'static str,
        key: String,
        affected: u64,
    },

    /// Store, connection or timeout failure
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl StateError {
    /// Whether the failure is the caller's lock conflict rather than a server-side fault
    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::AlreadyLocked { .. }
                | Self::NotHeld { .. }
                | Self::EmptyToken
        )
    }
}

/// Result type for protocol operations
pub type StateResult<T> = Result<T, StateError>;

/// Lock attempts made when a racing insert created the key first
const ACQUIRE_ATTEMPTS: usize = 2;

/// Versioned state storage with token-based locking
#[derive(Clone)]
pub struct StateStore {
    ledger: Arc<dyn Ledger>,
}

impl StateStore {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Read the current blob, or an empty blob when nothing was written yet
    pub async fn read(&self, key: &StateKey) -> StateResult<Vec<u8>> {
        let mut txn = self.ledger.begin().await?;
        let result = txn.read_current_blob(key).await.map_err(StateError::from);
        let blob = finish(txn, result).await?;

        debug!("read {}: {} bytes", key, blob.as_ref().map_or(0, Vec::len));
        Ok(blob.unwrap_or_default())
    }

    /// Store `blob` as the next version of `key`
    ///
    /// Succeeds when the key is unlocked or `token` is the held lock; the
    /// lock, if any, stays held after the write.
    pub async fn write(&self, key: &StateKey, token: &LockToken, blob: &[u8]) -> StateResult<()> {
        let mut txn = self.ledger.begin().await?;
        let result = write_next_version(txn.as_mut(), key, token, blob).await;
        let version = finish(txn, result).await.map_err(|e| match e {
            // Another writer committed this version first
            StateError::Ledger(LedgerError::Conflict { .. }) => StateError::Conflict {
                key: key.to_string(),
            },
            other => other,
        })?;

        debug!("wrote {} version {}: {} bytes", key, version, blob.len());
        Ok(())
    }

    /// Delete the state by writing an empty blob as the next version
    pub async fn delete(&self, key: &StateKey, token: &LockToken) -> StateResult<()> {
        self.write(key, token, &[]).await
    }

    /// Acquire the lock on `key` for `token`
    ///
    /// Re-acquiring with the token that already holds the lock succeeds.
    pub async fn acquire_lock(&self, key: &StateKey, token: &LockToken) -> StateResult<()> {
        if token.is_empty() {
            return Err(StateError::EmptyToken);
        }

        let mut attempt = 1;
        loop {
            let mut txn = self.ledger.begin().await?;
            let result = lock_current(txn.as_mut(), key, token).await;
            match finish(txn, result).await {
                Ok(()) => {
                    debug!("locked {} for [{}]", key, token);
                    return Ok(());
                }
                // A concurrent lock created the first version; its row now exists to contend on
                Err(StateError::Ledger(LedgerError::Conflict { .. }))
                    if attempt < ACQUIRE_ATTEMPTS =>
                {
                    debug!("lock on {} raced with another first insert, retrying", key);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the lock on `key`; only the exact holding token may do so
    pub async fn release_lock(&self, key: &StateKey, token: &LockToken) -> StateResult<()> {
        let mut txn = self.ledger.begin().await?;
        let result = unlock_current(txn.as_mut(), key, token).await;
        finish(txn, result).await?;

        debug!("unlocked {} for [{}]", key, token);
        Ok(())
    }
}

async fn write_next_version(
    txn: &mut dyn LedgerTransaction,
    key: &StateKey,
    token: &LockToken,
    blob: &[u8],
) -> StateResult<i64> {
    let (version, held) = match txn.locking_read_current(key).await? {
        Some(row) => (row.version, held_token(row.lock_token)),
        None => (0, None),
    };

    if held.is_some() && !token.matches(held.as_deref()) {
        return Err(StateError::Conflict {
            key: key.to_string(),
        });
    }

    let next = version + 1;
    let affected = txn.insert_version(key, next, held.as_deref(), blob).await?;
    expect_one_row("write", key, affected)?;
    Ok(next)
}

async fn lock_current(
    txn: &mut dyn LedgerTransaction,
    key: &StateKey,
    token: &LockToken,
) -> StateResult<()> {
    let Some(row) = txn.locking_read_current(key).await? else {
        // First version of the key: create it already locked
        let affected = txn.insert_version(key, 1, Some(token.as_str()), &[]).await?;
        return expect_one_row("lock", key, affected);
    };

    match held_token(row.lock_token) {
        Some(held) if token.matches(Some(held.as_str())) => Ok(()),
        Some(held) => Err(StateError::AlreadyLocked {
            key: key.to_string(),
            current: LockToken::from(held),
        }),
        None => {
            let affected = txn
                .set_lock_token(key, row.version, Some(token.as_str()))
                .await?;
            expect_one_row("lock", key, affected)
        }
    }
}

async fn unlock_current(
    txn: &mut dyn LedgerTransaction,
    key: &StateKey,
    token: &LockToken,
) -> StateResult<()> {
    let (version, held) = match txn.locking_read_current(key).await? {
        Some(row) => (row.version, row.lock_token),
        None => (0, None),
    };

    if !token.matches(held.as_deref()) {
        return Err(StateError::NotHeld {
            key: key.to_string(),
            token: token.clone(),
        });
    }

    let affected = txn.set_lock_token(key, version, None).await?;
    expect_one_row("unlock", key, affected)
}

/// Stored token, with an empty string read as unlocked
fn held_token(lock_token: Option<String>) -> Option<String> {
    lock_token.filter(|t| !t.is_empty())
}

fn expect_one_row(operation: &'static str, key: &StateKey, affected: u64) -> StateResult<()> {
    if affected == 1 {
        return Ok(());
    }

    error!(
        "{} on {} affected {} rows, expected 1; rolling back",
        operation, key, affected
    );
    Err(StateError::Inconsistency {
        operation,
        key: key.to_string(),
        affected,
    })
}

/// Commit on success, roll back on failure
async fn finish<T>(txn: Box<dyn LedgerTransaction>, result: StateResult<T>) -> StateResult<T> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                warn!("rollback after [{}] failed: {}", e, rollback);
            }
            Err(e)
        }
    }
}
