//! Proof-of-work sealing.
//!
//! A [`BlockTemplate`] freezes everything but the nonce, so the search can
//! run on a worker thread while the ledger keeps serving readers.

use crate::error::LedgerError;
use filechain_types::{
    compute_hash, hash_meets_difficulty, now_ms, Block, BlockIndex, RegistrationEvent,
};
use tracing::debug;

/// Everything needed to seal a block except the nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub index: BlockIndex,
    /// Read once when the template is built and never refreshed per attempt.
    pub timestamp: u64,
    pub previous_hash: String,
    pub payload: RegistrationEvent,
}

impl BlockTemplate {
    /// Template for the block following `tip`.
    pub fn on_top_of(tip: &Block, payload: RegistrationEvent) -> Self {
        Self {
            index: tip.index + 1,
            timestamp: now_ms(),
            previous_hash: tip.hash.clone(),
            payload,
        }
    }

    /// Try nonces from 0 until the hash has `difficulty` leading zero hex
    /// digits or `max_attempts` nonces have been tried.
    pub fn seal(self, difficulty: usize, max_attempts: u64) -> Result<Block, LedgerError> {
        for nonce in 0..max_attempts {
            let hash = compute_hash(
                self.index,
                self.timestamp,
                &self.payload,
                &self.previous_hash,
                nonce,
            );
            if hash_meets_difficulty(&hash, difficulty) {
                debug!(index = self.index, nonce, difficulty, "Sealed block");
                return Ok(Block {
                    index: self.index,
                    timestamp: self.timestamp,
                    payload: self.payload,
                    previous_hash: self.previous_hash,
                    hash,
                    nonce,
                });
            }
        }

        Err(LedgerError::MiningExhausted {
            attempts: max_attempts,
        })
    }
}
