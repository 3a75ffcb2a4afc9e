//! Postgres ledger
//!
//! Stores every version as one row of the `states` table. The locking read is
//! a `SELECT ... FOR UPDATE` of the newest row, so concurrent protocol
//! operations on one key serialize on that row lock. A select that waited
//! for the lock returns the row it waited on even when the holder committed
//! a newer version, so the read repeats until the locked row is the newest.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::key::StateKey;
use crate::ledger::{
    CurrentRow, Ledger, LedgerConfig, LedgerError, LedgerResult, LedgerTransaction, with_deadline,
};

/// Default size of the connection pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS states (
    state_id UUID NOT NULL,
    name VARCHAR(64) NOT NULL,
    version BIGINT NOT NULL DEFAULT 0,
    lock_token TEXT,
    blob BYTEA NOT NULL,
    PRIMARY KEY (state_id, name, version)
)
"#;

const SELECT_CURRENT_FOR_UPDATE: &str = "SELECT version, lock_token FROM states \
     WHERE state_id = $1 AND name = $2 ORDER BY version DESC LIMIT 1 FOR UPDATE";

const SELECT_CURRENT_BLOB: &str =
    "SELECT blob FROM states WHERE state_id = $1 AND name = $2 ORDER BY version DESC LIMIT 1";

const INSERT_VERSION: &str =
    "INSERT INTO states (state_id, name, version, lock_token, blob) VALUES ($1, $2, $3, $4, $5)";

const UPDATE_LOCK_TOKEN: &str =
    "UPDATE states SET lock_token = $1 WHERE state_id = $2 AND name = $3 AND version = $4";

/// Postgres-backed ledger
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    timeout: Duration,
}

impl PostgresLedger {
    /// Connect a pool to `database_url`
    pub async fn connect(
        database_url: &str,
        timeout: Duration,
        max_connections: u32,
    ) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await
            .map_err(LedgerError::database)?;

        Ok(Self { pool, timeout })
    }

    /// Create a PostgresLedger from configuration
    pub async fn from_config(config: &LedgerConfig) -> LedgerResult<Self> {
        let url = config
            .get_string("url")
            .ok_or_else(|| LedgerError::configuration("Missing required attribute: url"))?;

        let max_connections = match config.get_u64("max_connections")? {
            Some(n) => u32::try_from(n).map_err(|_| {
                LedgerError::configuration(format!("max_connections out of range: {}", n))
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Self::connect(url, config.call_timeout()?, max_connections).await
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn init(&self) -> LedgerResult<()> {
        with_deadline(self.timeout, async {
            sqlx::query(CREATE_TABLE)
                .execute(&self.pool)
                .await
                .map_err(LedgerError::database)?;
            Ok(())
        })
        .await
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>> {
        let txn = with_deadline(self.timeout, async {
            self.pool.begin().await.map_err(LedgerError::database)
        })
        .await?;

        Ok(Box::new(PostgresTransaction {
            txn,
            timeout: self.timeout,
        }))
    }
}

struct PostgresTransaction {
    txn: Transaction<'static, Postgres>,
    timeout: Duration,
}

#[async_trait]
impl LedgerTransaction for PostgresTransaction {
    async fn locking_read_current(&mut self, key: &StateKey) -> LedgerResult<Option<CurrentRow>> {
        let mut locked = None;
        loop {
            let row = with_deadline(self.timeout, async {
                sqlx::query_as::<_, (i64, Option<String>)>(SELECT_CURRENT_FOR_UPDATE)
                    .bind(key.state_id())
                    .bind(key.name())
                    .fetch_optional(&mut *self.txn)
                    .await
                    .map_err(LedgerError::database)
            })
            .await?;

            match row {
                // Granted after a wait; the holder may have committed a newer version
                Some((version, _)) if locked != Some(version) => locked = Some(version),
                row => {
                    return Ok(row.map(|(version, lock_token)| CurrentRow {
                        version,
                        lock_token,
                    }));
                }
            }
        }
    }

    async fn read_current_blob(&mut self, key: &StateKey) -> LedgerResult<Option<Vec<u8>>> {
        with_deadline(self.timeout, async {
            sqlx::query_scalar::<_, Vec<u8>>(SELECT_CURRENT_BLOB)
                .bind(key.state_id())
                .bind(key.name())
                .fetch_optional(&mut *self.txn)
                .await
                .map_err(LedgerError::database)
        })
        .await
    }

    async fn insert_version(
        &mut self,
        key: &StateKey,
        version: i64,
        lock_token: Option<&str>,
        blob: &[u8],
    ) -> LedgerResult<u64> {
        let result = with_deadline(self.timeout, async {
            sqlx::query(INSERT_VERSION)
                .bind(key.state_id())
                .bind(key.name())
                .bind(version)
                .bind(lock_token)
                .bind(blob)
                .execute(&mut *self.txn)
                .await
                .map_err(|e| match e {
                    sqlx::Error::Database(db) if db.is_unique_violation() => {
                        LedgerError::conflict(key, version)
                    }
                    other => LedgerError::database(other),
                })
        })
        .await?;

        Ok(result.rows_affected())
    }

    async fn set_lock_token(
        &mut self,
        key: &StateKey,
        version: i64,
        lock_token: Option<&str>,
    ) -> LedgerResult<u64> {
        let result = with_deadline(self.timeout, async {
            sqlx::query(UPDATE_LOCK_TOKEN)
                .bind(lock_token)
                .bind(key.state_id())
                .bind(key.name())
                .bind(version)
                .execute(&mut *self.txn)
                .await
                .map_err(LedgerError::database)
        })
        .await?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let PostgresTransaction { txn, timeout } = *self;
        with_deadline(timeout, async { txn.commit().await.map_err(LedgerError::database) }).await
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        let PostgresTransaction { txn, timeout } = *self;
        with_deadline(timeout, async {
            txn.rollback().await.map_err(LedgerError::database)
        })
        .await
    }
}
