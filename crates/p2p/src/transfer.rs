//! Chunked file transfer over a peer session.

use crate::error::TransferError;
use crate::message::FileChunk;
use base64::{engine::general_purpose, Engine as _};
use filechain_types::FileId;
use std::collections::HashMap;

/// Raw bytes per RESPONSE_FILE_CHUNK before base64 encoding.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Split `bytes` into wire chunks, the last one flagged `is_last`.
///
/// An empty file still produces a single empty final chunk.
pub fn encode_chunks<'a>(file_id: &'a str, bytes: &'a [u8]) -> impl Iterator<Item = FileChunk> + 'a {
    let total = bytes.len().div_ceil(CHUNK_SIZE).max(1);
    (0..total).map(move |i| {
        let start = (i * CHUNK_SIZE).min(bytes.len());
        let end = (start + CHUNK_SIZE).min(bytes.len());
        FileChunk {
            file_id: file_id.to_string(),
            chunk: general_purpose::STANDARD.encode(&bytes[start..end]),
            is_last: i + 1 == total,
        }
    })
}

/// One in-flight inbound transfer.
#[derive(Debug, Default)]
struct FileTransfer {
    chunks: Vec<Vec<u8>>,
    bytes_received: u64,
}

/// Per-session reassembly of inbound transfers keyed by file id.
#[derive(Debug, Default)]
pub struct TransferAssembler {
    transfers: HashMap<FileId, FileTransfer>,
}

impl TransferAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one chunk. Returns the whole file once the final chunk lands.
    ///
    /// A chunk that fails to decode abandons its transfer.
    pub fn accept(&mut self, chunk: FileChunk) -> Result<Option<(FileId, Vec<u8>)>, TransferError> {
        let decoded = match general_purpose::STANDARD.decode(chunk.chunk.as_bytes()) {
            Ok(decoded) => decoded,
            Err(source) => {
                self.transfers.remove(&chunk.file_id);
                return Err(TransferError::Decode {
                    file_id: chunk.file_id,
                    source,
                });
            }
        };

        let transfer = self.transfers.entry(chunk.file_id.clone()).or_default();
        transfer.bytes_received += decoded.len() as u64;
        transfer.chunks.push(decoded);

        if !chunk.is_last {
            return Ok(None);
        }

        let transfer = self.transfers.remove(&chunk.file_id).unwrap_or_default();
        Ok(Some((chunk.file_id, transfer.chunks.concat())))
    }

    /// Drop any partial state for `file_id`.
    pub fn abandon(&mut self, file_id: &str) -> bool {
        self.transfers.remove(file_id).is_some()
    }

    pub fn bytes_received(&self, file_id: &str) -> Option<u64> {
        self.transfers.get(file_id).map(|t| t.bytes_received)
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }
}
