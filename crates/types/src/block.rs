use crate::event::RegistrationEvent;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;

/// Height of a block within the chain (genesis is 0).
pub type BlockIndex = u64;

/// Fixed genesis timestamp (2024-01-01T00:00:00Z) shared by every node.
pub const GENESIS_TIMESTAMP_MS: u64 = 1_704_067_200_000;
/// `previousHash` value carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";
/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// One sealed, hash-linked ledger unit carrying a single registration event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: BlockIndex,
    /// Milliseconds since the Unix epoch, fixed when sealing started.
    pub timestamp: u64,
    pub payload: RegistrationEvent,
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
}

/// The exact fields covered by a block hash, in protocol order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a> {
    index: BlockIndex,
    timestamp: u64,
    payload: &'a RegistrationEvent,
    previous_hash: &'a str,
    nonce: u64,
}

/// Feeds serializer output straight into the digest.
struct DigestWriter<'a>(&'a mut Sha256);

impl io::Write for DigestWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compute the canonical block hash.
///
/// The preimage is the compact JSON object
/// `{"index","timestamp","payload","previousHash","nonce"}` in exactly that
/// order; any change to the encoding breaks cross-node agreement.
pub fn compute_hash(
    index: BlockIndex,
    timestamp: u64,
    payload: &RegistrationEvent,
    previous_hash: &str,
    nonce: u64,
) -> String {
    let input = HashInput {
        index,
        timestamp,
        payload,
        previous_hash,
        nonce,
    };
    let mut hasher = Sha256::new();
    // Plain data never fails to serialize; an empty hash can never validate.
    if serde_json::to_writer(DigestWriter(&mut hasher), &input).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Whether `hash` starts with `difficulty` zero hex digits.
pub fn hash_meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

impl Block {
    /// Build a block and fill in its hash.
    pub fn new(
        index: BlockIndex,
        timestamp: u64,
        payload: RegistrationEvent,
        previous_hash: impl Into<String>,
        nonce: u64,
    ) -> Self {
        let previous_hash = previous_hash.into();
        let hash = compute_hash(index, timestamp, &payload, &previous_hash, nonce);
        Self {
            index,
            timestamp,
            payload,
            previous_hash,
            hash,
            nonce,
        }
    }

    /// The globally identical root block. Not subject to proof-of-work.
    pub fn genesis() -> Self {
        Self::new(
            0,
            GENESIS_TIMESTAMP_MS,
            RegistrationEvent::genesis(),
            GENESIS_PREVIOUS_HASH,
            0,
        )
    }

    /// Recompute the hash from the block's content, ignoring the stored `hash`.
    pub fn compute_hash(&self) -> String {
        compute_hash(
            self.index,
            self.timestamp,
            &self.payload,
            &self.previous_hash,
            self.nonce,
        )
    }

    /// Whether the stored hash matches the block's content.
    pub fn has_valid_hash(&self) -> bool {
        self.hash.len() == HASH_HEX_LEN && self.hash == self.compute_hash()
    }

    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        hash_meets_difficulty(&self.hash, difficulty)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}
