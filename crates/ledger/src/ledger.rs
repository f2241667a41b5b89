//! The stateful ledger engine.

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::mining::BlockTemplate;
use crate::validation::{check_chain, check_link, genesis};
use crate::Result;
use filechain_storage::{ChainStore, MemoryChainStore};
use filechain_types::{Block, BlockIndex, EventKind, FileId, FileRecord, RegistrationEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ledger shared between the overlay and the node. The mutex owns chain and
/// file index together so every mutation is single-writer.
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Authoritative local chain plus its derived file index.
pub struct Ledger {
    config: LedgerConfig,
    chain: Vec<Block>,
    /// File id -> position of the latest block touching that id.
    file_index: HashMap<FileId, usize>,
    store: Arc<dyn ChainStore>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("config", &self.config)
            .field("height", &self.tip().index)
            .field("files", &self.file_index.len())
            .finish()
    }
}

impl Ledger {
    /// Load the chain from `store`, or initialise it with genesis.
    ///
    /// Genesis-only and empty stored chains are not validated. Anything
    /// longer must pass full validation; a corrupt store fails startup.
    pub fn open(config: LedgerConfig, store: Arc<dyn ChainStore>) -> Result<Self> {
        config.validate()?;

        let mut ledger = Self {
            config,
            chain: vec![genesis().clone()],
            file_index: HashMap::new(),
            store,
        };

        match ledger.store.load()? {
            Some(stored) if stored.len() > 1 => {
                let height = stored.len() - 1;
                ledger.replace(stored)?;
                info!(height, "Loaded persisted chain");
            }
            Some(_) => debug!("Persisted chain holds genesis only"),
            None => {
                ledger.store.save(&ledger.chain)?;
                info!("Initialised new chain with genesis block");
            }
        }

        Ok(ledger)
    }

    /// Ledger backed by a fresh in-memory store.
    pub fn in_memory(config: LedgerConfig) -> Result<Self> {
        Self::open(config, Arc::new(MemoryChainStore::new()))
    }

    pub fn into_shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn tip(&self) -> &Block {
        // The chain always holds at least genesis.
        &self.chain[self.chain.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Snapshot of the next block position so sealing can run unlocked.
    pub fn next_template(&self, payload: RegistrationEvent) -> BlockTemplate {
        BlockTemplate::on_top_of(self.tip(), payload)
    }

    /// Seal `payload` against the current tip without attaching it.
    pub fn seal(&self, payload: RegistrationEvent) -> Result<Block> {
        self.next_template(payload)
            .seal(self.config.difficulty, self.config.max_mining_attempts)
    }

    /// Seal `payload` on top of the tip and attach it.
    pub fn append(&mut self, payload: RegistrationEvent) -> Result<Block> {
        payload.file.validate()?;
        let block = self.seal(payload)?;
        self.accept_block(block.clone())?;
        Ok(block)
    }

    /// Attach an externally sealed block if it links onto the tip.
    pub fn accept_block(&mut self, block: Block) -> Result<()> {
        check_link(&block, self.tip()).map_err(LedgerError::InvalidBlock)?;

        let position = self.chain.len();
        let file_id = block.payload.file_id().to_string();
        let previous = self.file_index.insert(file_id.clone(), position);
        self.chain.push(block);

        if let Err(err) = self.store.save(&self.chain) {
            self.chain.pop();
            match previous {
                Some(prev) => self.file_index.insert(file_id, prev),
                None => self.file_index.remove(&file_id),
            };
            warn!(error = %err, "Failed to persist appended block");
            return Err(err.into());
        }

        debug!(index = position, file_id = %file_id, "Appended block");
        Ok(())
    }

    /// Adopt `candidate` wholesale iff it is strictly longer and valid.
    ///
    /// Returns the index of the first block that was not already part of the
    /// local chain. On any error the local chain is unchanged.
    pub fn replace(&mut self, candidate: Vec<Block>) -> Result<BlockIndex> {
        if candidate.len() <= self.chain.len() {
            return Err(LedgerError::ChainNotLonger {
                candidate: candidate.len(),
                local: self.chain.len(),
            });
        }
        check_chain(&candidate).map_err(LedgerError::InvalidChain)?;

        self.store.save(&candidate)?;

        let first_new = self
            .chain
            .iter()
            .zip(candidate.iter())
            .take_while(|(local, theirs)| local.hash == theirs.hash)
            .count() as BlockIndex;

        info!(
            previous_len = self.chain.len(),
            new_len = candidate.len(),
            first_new,
            "Replaced local chain"
        );
        self.chain = candidate;
        self.rebuild_index();
        Ok(first_new)
    }

    fn rebuild_index(&mut self) {
        self.file_index.clear();
        for (position, block) in self.chain.iter().enumerate() {
            self.file_index
                .insert(block.payload.file_id().to_string(), position);
        }
    }

    /// Live file set: the most recent record per id, minus deleted ids and
    /// the genesis sentinel. Most recently touched files come first.
    pub fn all_files(&self) -> Vec<FileRecord> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for block in self.chain.iter().rev() {
            let event = &block.payload;
            if event.file.is_genesis() || !seen.insert(event.file_id()) {
                continue;
            }
            if event.kind != EventKind::Delete {
                files.push(event.file.clone());
            }
        }
        files
    }

    /// Latest block touching `file_id`, including a DELETE.
    pub fn find_file(&self, file_id: &str) -> Option<&Block> {
        let position = *self.file_index.get(file_id)?;
        let block = self.chain.get(position)?;
        if block.payload.file.is_genesis() {
            return None;
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filechain_storage::{JsonChainStore, StorageError};
    use tempfile::tempdir;

    fn record(name: &str) -> FileRecord {
        FileRecord::new(name, format!("/data/{name}"), name.as_bytes(), "node-a")
    }

    fn ledger() -> Ledger {
        Ledger::in_memory(LedgerConfig::with_difficulty(1)).unwrap()
    }

    /// Store that refuses every save after the first `allowed`.
    struct FailingStore {
        inner: MemoryChainStore,
        allowed: u64,
    }

    impl ChainStore for FailingStore {
        fn load(&self) -> filechain_storage::Result<Option<Vec<Block>>> {
            self.inner.load()
        }

        fn save(&self, chain: &[Block]) -> filechain_storage::Result<()> {
            if self.inner.save_count() >= self.allowed {
                return Err(StorageError::Io {
                    path: "chain.json".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.save(chain)
        }
    }

    #[test]
    fn test_new_ledger_holds_genesis() {
        let ledger = ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.tip(), genesis());
        assert!(ledger.all_files().is_empty());
        assert!(ledger.find_file("genesis").is_none());
    }

    #[test]
    fn test_append_on_genesis() {
        let mut ledger = ledger();
        let block = ledger
            .append(RegistrationEvent::register(record("a.txt")))
            .unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, genesis().hash);
        assert!(block.meets_difficulty(1));
        assert_eq!(ledger.tip(), &block);
    }

    #[test]
    fn test_append_rejects_invalid_record() {
        let mut ledger = ledger();
        let err = ledger
            .append(RegistrationEvent::register(FileRecord::genesis()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRecord(_)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_mining_exhaustion_leaves_ledger_unchanged() {
        let config = LedgerConfig {
            difficulty: 64,
            max_mining_attempts: 8,
        };
        let mut ledger = Ledger::in_memory(config).unwrap();
        let err = ledger
            .append(RegistrationEvent::register(record("a.txt")))
            .unwrap_err();
        assert!(matches!(err, LedgerError::MiningExhausted { attempts: 8 }));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.all_files().is_empty());
    }

    #[test]
    fn test_accept_block_rejects_stale_template() {
        let mut ledger = ledger();
        let stale = ledger
            .seal(RegistrationEvent::register(record("a.txt")))
            .unwrap();
        ledger
            .append(RegistrationEvent::register(record("b.txt")))
            .unwrap();
        let err = ledger.accept_block(stale).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidBlock(_)));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_replace_rules() {
        let mut local = ledger();
        local
            .append(RegistrationEvent::register(record("a.txt")))
            .unwrap();
        let before = local.chain().to_vec();

        // Equal length.
        let mut other = ledger();
        other
            .append(RegistrationEvent::register(record("b.txt")))
            .unwrap();
        assert!(matches!(
            local.replace(other.chain().to_vec()),
            Err(LedgerError::ChainNotLonger { candidate: 2, local: 2 })
        ));

        // Shorter.
        assert!(local.replace(vec![genesis().clone()]).is_err());

        // Longer but tampered.
        other
            .append(RegistrationEvent::register(record("c.txt")))
            .unwrap();
        let mut tampered = other.chain().to_vec();
        tampered[1].payload.file.filename = "evil".into();
        assert!(matches!(
            local.replace(tampered),
            Err(LedgerError::InvalidChain(_))
        ));
        assert_eq!(local.chain(), &before[..]);

        // Longer and valid.
        let first_new = local.replace(other.chain().to_vec()).unwrap();
        assert_eq!(first_new, 1);
        assert_eq!(local.chain(), other.chain());
        assert_eq!(local.all_files().len(), 2);
    }

    #[test]
    fn test_replace_reports_shared_prefix() {
        let mut local = ledger();
        local
            .append(RegistrationEvent::register(record("a.txt")))
            .unwrap();
        let mut longer = Ledger::in_memory(LedgerConfig::with_difficulty(1)).unwrap();
        longer.replace(local.chain().to_vec()).unwrap();
        longer
            .append(RegistrationEvent::register(record("b.txt")))
            .unwrap();
        assert_eq!(local.replace(longer.chain().to_vec()).unwrap(), 2);
    }

    #[test]
    fn test_all_files_drops_deleted() {
        let mut ledger = ledger();
        let file = record("a.txt");
        ledger
            .append(RegistrationEvent::register(file.clone()))
            .unwrap();
        ledger.append(RegistrationEvent::delete(file.clone())).unwrap();
        assert!(ledger.all_files().is_empty());

        let found = ledger.find_file(&file.id).unwrap();
        assert_eq!(found.payload.kind, EventKind::Delete);
    }

    #[test]
    fn test_all_files_latest_record_wins() {
        let mut ledger = ledger();
        let a = record("a.txt");
        let b = record("b.txt");
        ledger.append(RegistrationEvent::register(a.clone())).unwrap();
        ledger.append(RegistrationEvent::register(b.clone())).unwrap();
        let renamed = FileRecord {
            filename: "a-v2.txt".into(),
            ..a.clone()
        };
        ledger
            .append(RegistrationEvent::update(renamed.clone()))
            .unwrap();

        let files = ledger.all_files();
        assert_eq!(files, vec![renamed.clone(), b.clone()]);
        assert_eq!(ledger.find_file(&a.id).unwrap().payload.file, renamed);
        assert_eq!(ledger.find_file(&b.id).unwrap().index, 2);
        assert!(ledger.find_file("missing").is_none());
    }

    #[test]
    fn test_persist_failure_rolls_back_append() {
        let store = Arc::new(FailingStore {
            inner: MemoryChainStore::new(),
            allowed: 1,
        });
        let mut ledger = Ledger::open(LedgerConfig::with_difficulty(1), store).unwrap();
        let file = record("a.txt");
        let err = ledger
            .append(RegistrationEvent::register(file.clone()))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.len(), 1);
        assert!(ledger.find_file(&file.id).is_none());
    }

    #[test]
    fn test_persist_failure_keeps_local_chain_on_replace() {
        let mut source = ledger();
        source
            .append(RegistrationEvent::register(record("a.txt")))
            .unwrap();

        let store = Arc::new(FailingStore {
            inner: MemoryChainStore::new(),
            allowed: 1,
        });
        let mut ledger = Ledger::open(LedgerConfig::with_difficulty(1), store).unwrap();
        assert!(ledger.replace(source.chain().to_vec()).is_err());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.json");
        let file = record("a.txt");
        {
            let store = Arc::new(JsonChainStore::new(&path));
            let mut ledger = Ledger::open(LedgerConfig::with_difficulty(1), store).unwrap();
            ledger
                .append(RegistrationEvent::register(file.clone()))
                .unwrap();
        }

        let store = Arc::new(JsonChainStore::new(&path));
        let ledger = Ledger::open(LedgerConfig::with_difficulty(1), store).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.find_file(&file.id).is_some());
    }

    #[test]
    fn test_corrupt_store_fails_startup() {
        let mut source = ledger();
        source
            .append(RegistrationEvent::register(record("a.txt")))
            .unwrap();
        let mut chain = source.chain().to_vec();
        chain[1].previous_hash = "bogus".into();

        let store = Arc::new(MemoryChainStore::with_chain(chain));
        let err = Ledger::open(LedgerConfig::default(), store).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidChain(_)));
    }

    #[test]
    fn test_invalid_config_fails_startup() {
        let config = LedgerConfig {
            difficulty: 65,
            ..LedgerConfig::default()
        };
        assert!(matches!(
            Ledger::in_memory(config),
            Err(LedgerError::InvalidConfig(_))
        ));
    }
}
