//! Hooks the overlay calls into outside subsystems.

use filechain_types::{BlockIndex, FileRecord};

/// Tracks which nodes hold copies of which files.
pub trait RedundancyTracker: Send + Sync {
    /// The local content store now holds the bytes for `record`.
    fn notify_local_file_stored(&self, record: &FileRecord);

    /// `node_id` announced a block registering `file_id`.
    fn notify_remote_file_seen(&self, node_id: &str, file_id: &str, size_hint: u64);
}

/// Credits nodes for validating blocks and serving file bytes.
pub trait RewardLedger: Send + Sync {
    fn notify_block_validated(&self, node_id: &str, block_index: BlockIndex);

    fn notify_bytes_served(
        &self,
        node_id: &str,
        file_id: &str,
        byte_count: u64,
        block_index: BlockIndex,
    );
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRedundancyTracker;

impl RedundancyTracker for NoopRedundancyTracker {
    fn notify_local_file_stored(&self, _record: &FileRecord) {}

    fn notify_remote_file_seen(&self, _node_id: &str, _file_id: &str, _size_hint: u64) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRewardLedger;

impl RewardLedger for NoopRewardLedger {
    fn notify_block_validated(&self, _node_id: &str, _block_index: BlockIndex) {}

    fn notify_bytes_served(
        &self,
        _node_id: &str,
        _file_id: &str,
        _byte_count: u64,
        _block_index: BlockIndex,
    ) {
    }
}
