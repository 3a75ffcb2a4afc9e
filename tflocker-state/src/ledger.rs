//! Version ledger trait, configuration and error types

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::key::StateKey;

/// Default deadline for a single ledger call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur when interacting with a ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A row with this `(key, version)` already exists
    #[error("Version {version} of {key} already exists")]
    Conflict { key: String, version: i64 },

    /// A ledger call exceeded its deadline
    #[error("Ledger call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection, query or transaction failure in the underlying store
    #[error("Database error: {0}")]
    Database(String),

    /// The ledger type is not supported
    #[error("Unsupported ledger type: {0}")]
    UnsupportedLedger(String),

    /// Configuration error
    #[error("Ledger configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    pub fn conflict(key: &StateKey, version: i64) -> Self {
        Self::Conflict {
            key: key.to_string(),
            version,
        }
    }

    pub fn database(message: impl ToString) -> Self {
        Self::Database(message.to_string())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Version number and lock annotation of a key's current row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentRow {
    pub version: i64,
    pub lock_token: Option<String>,
}

/// Transactional storage of version rows
///
/// A ledger hands out transactions; it never decides on commit or rollback
/// itself.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Make sure the backing table exists
    async fn init(&self) -> LedgerResult<()>;

    /// Open a new transaction
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>>;
}

/// One open ledger transaction
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Read the current row of `key` and lock it until the transaction ends
    ///
    /// Blocks while another transaction holds the lock. Returns `None` when
    /// the key has no rows.
    async fn locking_read_current(&mut self, key: &StateKey) -> LedgerResult<Option<CurrentRow>>;

    /// Read the blob of the current row without taking a row lock
    async fn read_current_blob(&mut self, key: &StateKey) -> LedgerResult<Option<Vec<u8>>>;

    /// Insert a new version row, returning the number of rows inserted
    ///
    /// Fails with [`LedgerError::Conflict`] when `(key, version)` exists.
    async fn insert_version(
        &mut self,
        key: &StateKey,
        version: i64,
        lock_token: Option<&str>,
        blob: &[u8],
    ) -> LedgerResult<u64>;

    /// Update the lock token of an existing row, returning the number of rows updated
    async fn set_lock_token(
        &mut self,
        key: &StateKey,
        version: i64,
        lock_token: Option<&str>,
    ) -> LedgerResult<u64>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;

    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}

/// Run a ledger call under a deadline
pub(crate) async fn with_deadline<T, F>(deadline: Duration, call: F) -> LedgerResult<T>
where
    F: Future<Output = LedgerResult<T>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| LedgerError::Timeout(deadline))?
}

/// Configuration for a ledger
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Ledger type ("postgres" or "memory")
    pub ledger_type: String,
    /// Ledger-specific attributes
    pub attributes: HashMap<String, String>,
}

impl LedgerConfig {
    pub fn new(ledger_type: impl Into<String>) -> Self {
        Self {
            ledger_type: ledger_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Get a numeric attribute value
    pub fn get_u64(&self, key: &str) -> LedgerResult<Option<u64>> {
        self.get_string(key)
            .map(|raw| {
                raw.parse::<u64>().map_err(|e| {
                    LedgerError::configuration(format!("Invalid value for {}: {} ({})", key, raw, e))
                })
            })
            .transpose()
    }

    /// Per-call deadline from `timeout_ms`, defaulting to [`DEFAULT_CALL_TIMEOUT`]
    pub fn call_timeout(&self) -> LedgerResult<Duration> {
        Ok(self
            .get_u64("timeout_ms")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CALL_TIMEOUT))
    }
}
