use crate::error::LedgerError;
use filechain_types::HASH_HEX_LEN;
use serde::{Deserialize, Serialize};

/// Proof-of-work parameters applied when sealing local events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Number of leading zero hex digits a sealed block hash must have.
    pub difficulty: usize,
    /// Upper bound on nonces tried before sealing reports failure.
    pub max_mining_attempts: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: 4,
            max_mining_attempts: 10_000_000,
        }
    }
}

impl LedgerConfig {
    pub fn with_difficulty(difficulty: usize) -> Self {
        Self {
            difficulty,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.difficulty > HASH_HEX_LEN {
            return Err(LedgerError::InvalidConfig(format!(
                "difficulty {} exceeds hash length {}",
                self.difficulty, HASH_HEX_LEN
            )));
        }
        if self.max_mining_attempts == 0 {
            return Err(LedgerError::InvalidConfig(
                "max_mining_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
