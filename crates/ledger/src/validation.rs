//! Block-link and whole-chain validation.
//!
//! Proof-of-work difficulty is not re-checked here: recomputing the hash is
//! enough, since any change to the nonce or payload changes the hash.

use crate::error::ChainError;
use filechain_types::Block;
use once_cell::sync::Lazy;

static GENESIS: Lazy<Block> = Lazy::new(Block::genesis);

/// The canonical genesis block computed locally.
pub fn genesis() -> &'static Block {
    &GENESIS
}

/// Check that `candidate` directly extends `predecessor`.
pub fn check_link(candidate: &Block, predecessor: &Block) -> Result<(), ChainError> {
    let expected = predecessor.index + 1;
    if candidate.index != expected {
        return Err(ChainError::IndexGap {
            expected,
            found: candidate.index,
        });
    }
    if candidate.previous_hash != predecessor.hash {
        return Err(ChainError::PreviousHashMismatch {
            index: candidate.index,
        });
    }
    if !candidate.has_valid_hash() {
        return Err(ChainError::HashMismatch {
            index: candidate.index,
        });
    }
    Ok(())
}

pub fn validate_link(candidate: &Block, predecessor: &Block) -> bool {
    check_link(candidate, predecessor).is_ok()
}

/// Check a full chain: canonical genesis followed by valid links only.
pub fn check_chain(candidate: &[Block]) -> Result<(), ChainError> {
    let first = candidate.first().ok_or(ChainError::Empty)?;
    if first != genesis() {
        return Err(ChainError::GenesisMismatch);
    }
    for pair in candidate.windows(2) {
        check_link(&pair[1], &pair[0])?;
    }
    Ok(())
}

pub fn validate_chain(candidate: &[Block]) -> bool {
    check_chain(candidate).is_ok()
}
