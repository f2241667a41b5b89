//! Chain persistence backends.

use crate::{Result, StorageError};
use filechain_types::Block;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable home of the ledger chain.
///
/// Implementations always store the full chain; there is no incremental
/// append path.
pub trait ChainStore: Send + Sync {
    /// Load the persisted chain. `None` means nothing has been persisted yet.
    fn load(&self) -> Result<Option<Vec<Block>>>;

    /// Replace the persisted chain with `chain`.
    fn save(&self, chain: &[Block]) -> Result<()>;
}

/// Stores the chain as a single JSON array on disk.
///
/// Writes go to a sibling temporary file that is synced and then renamed
/// over the target, so readers only ever observe a complete snapshot.
#[derive(Debug, Clone)]
pub struct JsonChainStore {
    path: PathBuf,
}

impl JsonChainStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "chain.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ChainStore for JsonChainStore {
    fn load(&self) -> Result<Option<Vec<Block>>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io(&self.path, err)),
        };
        let chain: Vec<Block> = serde_json::from_slice(&data)?;
        debug!(path = %self.path.display(), blocks = chain.len(), "Loaded persisted chain");
        Ok(Some(chain))
    }

    fn save(&self, chain: &[Block]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let encoded = serde_json::to_vec_pretty(chain)?;
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp).map_err(|e| StorageError::io(&temp, e))?;
            file.write_all(&encoded)
                .map_err(|e| StorageError::io(&temp, e))?;
            file.sync_all().map_err(|e| StorageError::io(&temp, e))?;
        }
        fs::rename(&temp, &self.path).map_err(|e| StorageError::io(&self.path, e))?;

        debug!(path = %self.path.display(), blocks = chain.len(), "Persisted chain");
        Ok(())
    }
}

/// In-memory chain store for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryChainStore {
    chain: RwLock<Option<Vec<Block>>>,
    saves: RwLock<u64>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(chain: Vec<Block>) -> Self {
        Self {
            chain: RwLock::new(Some(chain)),
            saves: RwLock::new(0),
        }
    }

    /// Number of completed `save` calls.
    pub fn save_count(&self) -> u64 {
        *self.saves.read()
    }

    pub fn snapshot(&self) -> Option<Vec<Block>> {
        self.chain.read().clone()
    }
}

impl ChainStore for MemoryChainStore {
    fn load(&self) -> Result<Option<Vec<Block>>> {
        Ok(self.chain.read().clone())
    }

    fn save(&self, chain: &[Block]) -> Result<()> {
        *self.chain.write() = Some(chain.to_vec());
        *self.saves.write() += 1;
        Ok(())
    }
}
