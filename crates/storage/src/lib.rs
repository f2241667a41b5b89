//! Filechain Storage
//!
//! Durable state for a node: the ledger chain, persisted wholesale as a JSON
//! array after every mutation, and the content store holding raw file bytes
//! keyed by file id.

pub mod chain_store;
pub mod content_store;

pub use chain_store::{ChainStore, JsonChainStore, MemoryChainStore};
pub use content_store::{ContentStore, FsContentStore, MemoryContentStore};

use std::path::PathBuf;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid file id {0:?}")]
    InvalidFileId(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
