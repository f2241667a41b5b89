use filechain_storage::StorageError;
use filechain_types::{BlockIndex, FileRecordError};
use thiserror::Error;

/// Why a block or chain failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain is empty")]
    Empty,

    #[error("genesis block does not match the canonical genesis")]
    GenesisMismatch,

    #[error("expected block index {expected}, found {found}")]
    IndexGap {
        expected: BlockIndex,
        found: BlockIndex,
    },

    #[error("block {index} does not reference its predecessor's hash")]
    PreviousHashMismatch { index: BlockIndex },

    #[error("block {index} hash does not match its contents")]
    HashMismatch { index: BlockIndex },
}

/// Errors surfaced by the ledger engine.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("proof-of-work not found after {attempts} attempts")]
    MiningExhausted { attempts: u64 },

    #[error("invalid block: {0}")]
    InvalidBlock(#[source] ChainError),

    #[error("invalid chain: {0}")]
    InvalidChain(#[source] ChainError),

    #[error("candidate chain of length {candidate} is not longer than local length {local}")]
    ChainNotLonger { candidate: usize, local: usize },

    #[error("invalid file record: {0}")]
    InvalidRecord(#[from] FileRecordError),

    #[error("invalid ledger configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to persist chain: {0}")]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// Whether the node can no longer honour its durability contract.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}
