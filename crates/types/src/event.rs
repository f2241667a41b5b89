use crate::time::now_ms;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier shared by ledger entries, local storage, redundancy tracking,
/// and reward records.
pub type FileId = String;

/// Sentinel file id carried by the genesis block; never a live file.
pub const GENESIS_FILE_ID: &str = "genesis";

/// Errors emitted when a file record is structurally unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileRecordError {
    #[error("file id must not be empty")]
    EmptyId,
    #[error("file id {0:?} is reserved for the genesis block")]
    ReservedId(String),
    #[error("content hash must be 64 hex characters, got {0}")]
    InvalidContentHash(usize),
}

/// What a registration event does to the referenced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Register,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            EventKind::Register => "REGISTER",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
        };
        f.write_str(value)
    }
}

/// Metadata describing one registered file.
///
/// Field order is part of the block hash contract: the record is serialized
/// in declaration order when a block is hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Globally unique id assigned by the node that first registered the file.
    pub id: FileId,
    pub filename: String,
    pub original_path: String,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file bytes.
    pub content_hash: String,
    /// Node id of the uploader.
    pub uploader: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FileRecord {
    /// Describe freshly uploaded bytes, assigning a new random id.
    pub fn new(
        filename: impl Into<String>,
        original_path: impl Into<String>,
        bytes: &[u8],
        uploader: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.into(),
            original_path: original_path.into(),
            size_bytes: bytes.len() as u64,
            content_hash: content_hash(bytes),
            uploader: uploader.into(),
            timestamp_ms: now_ms(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The fixed, empty record embedded in the genesis block.
    pub fn genesis() -> Self {
        Self {
            id: GENESIS_FILE_ID.to_string(),
            filename: String::new(),
            original_path: String::new(),
            size_bytes: 0,
            content_hash: String::new(),
            uploader: String::new(),
            timestamp_ms: 0,
            description: None,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.id == GENESIS_FILE_ID
    }

    /// Whether `bytes` hash to the declared content hash.
    pub fn matches_content(&self, bytes: &[u8]) -> bool {
        content_hash(bytes) == self.content_hash
    }

    /// Check the record can be sealed into a new registration event.
    pub fn validate(&self) -> Result<(), FileRecordError> {
        if self.id.trim().is_empty() {
            return Err(FileRecordError::EmptyId);
        }
        if self.is_genesis() {
            return Err(FileRecordError::ReservedId(self.id.clone()));
        }
        let hash_len = self.content_hash.len();
        if hash_len != 64 || !self.content_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FileRecordError::InvalidContentHash(hash_len));
        }
        Ok(())
    }
}

/// A single ledger entry: one action applied to one file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEvent {
    pub kind: EventKind,
    pub file: FileRecord,
}

impl RegistrationEvent {
    pub fn new(kind: EventKind, file: FileRecord) -> Self {
        Self { kind, file }
    }

    pub fn register(file: FileRecord) -> Self {
        Self::new(EventKind::Register, file)
    }

    pub fn update(file: FileRecord) -> Self {
        Self::new(EventKind::Update, file)
    }

    pub fn delete(file: FileRecord) -> Self {
        Self::new(EventKind::Delete, file)
    }

    pub fn genesis() -> Self {
        Self::register(FileRecord::genesis())
    }

    pub fn file_id(&self) -> &str {
        &self.file.id
    }
}

/// Lowercase hex SHA-256 digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
