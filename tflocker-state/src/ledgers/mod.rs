//! Ledger implementations for version storage

mod memory;
mod postgres;

pub use memory::{MemoryLedger, VersionRow};
pub use postgres::{DEFAULT_MAX_CONNECTIONS, PostgresLedger};

use crate::ledger::{Ledger, LedgerConfig, LedgerError, LedgerResult};

/// Create a ledger from configuration
///
/// This function dispatches to the appropriate ledger implementation
/// based on the ledger_type in the configuration.
pub async fn create_ledger(config: &LedgerConfig) -> LedgerResult<Box<dyn Ledger>> {
    match config.ledger_type.as_str() {
        "postgres" => {
            let ledger = PostgresLedger::from_config(config).await?;
            Ok(Box::new(ledger))
        }
        "memory" => {
            let ledger = MemoryLedger::from_config(config)?;
            Ok(Box::new(ledger))
        }
        other => Err(LedgerError::UnsupportedLedger(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_ledger() {
        let config = LedgerConfig::new("mysql");

        let result = create_ledger(&config).await;
        if let Err(LedgerError::UnsupportedLedger(name)) = result {
            assert_eq!(name, "mysql");
        } else {
            panic!("Expected UnsupportedLedger error");
        }
    }

    #[tokio::test]
    async fn test_create_memory_ledger() {
        let config = LedgerConfig::new("memory").with("timeout_ms", 100);
        let ledger = create_ledger(&config).await.unwrap();
        ledger.init().await.unwrap();
        assert!(ledger.begin().await.is_ok());
    }
}
