//! tflocker State Engine
//!
//! This crate provides the versioned storage and locking engine behind the
//! tflocker HTTP state backend. Infrastructure tools store one opaque blob per
//! `(name, state_id)` address and serialize their read-modify-write cycles by
//! holding a lock token.
//!
//! # Overview
//!
//! The engine consists of:
//!
//! - **Ledger**: A trait for transactional, append-only storage of version rows
//!   (Postgres for production, in-memory for tests and development)
//! - **StateStore**: The lock-and-write protocol (read, write, delete, lock, unlock)
//!   executed as one transaction per operation against a ledger
//! - **LockToken / LockInfo**: The opaque lock capability and the lock body codec
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tflocker_state::{LockToken, MemoryLedger, StateKey, StateStore};
//!
//! let store = StateStore::new(Arc::new(MemoryLedger::new()));
//! let key = StateKey::parse("env", "5b1f2c7e-0a53-4c10-9a4e-3a3c8a0d9f11")?;
//! let token = LockToken::new("tok1");
//!
//! store.acquire_lock(&key, &token).await?;
//! store.write(&key, &token, b"data").await?;
//! store.release_lock(&key, &token).await?;
//!
//! assert_eq!(store.read(&key).await?, b"data");
//! ```

pub mod key;
pub mod ledger;
pub mod ledgers;
pub mod lock;
pub mod protocol;

// Re-export main types for convenience
pub use key::{KeyError, StateKey};
pub use ledger::{CurrentRow, Ledger, LedgerConfig, LedgerError, LedgerResult, LedgerTransaction};
pub use ledgers::{MemoryLedger, PostgresLedger, VersionRow, create_ledger};
pub use lock::{LockInfo, LockToken};
pub use protocol::{StateError, StateResult, StateStore};
