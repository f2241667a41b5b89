use filechain_ledger::LedgerError;
use filechain_storage::StorageError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// A frame that could not be turned into a [`crate::Message`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownKind(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("RESPONSE_CHAIN carried no blocks")]
    EmptyChain,
}

/// A chunk that could not be folded into its transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("chunk for {file_id} is not valid base64: {source}")]
    Decode {
        file_id: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// P2P overlay errors
#[derive(Debug, Error)]
pub enum P2PError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("peer {0} is disconnected")]
    PeerClosed(SocketAddr),

    #[error("peer {addr} did not drain its queue within {timeout:?}")]
    SendTimeout { addr: SocketAddr, timeout: Duration },

    #[error("no peer delivered {file_id} within {timeout:?}")]
    FileTimeout { file_id: String, timeout: Duration },

    #[error("no connected peers")]
    NoPeers,

    #[error("sealing worker failed: {0}")]
    Worker(String),

    #[error("invalid overlay configuration: {0}")]
    InvalidConfig(String),
}

impl P2PError {
    /// Whether the local node can no longer keep its chain durable.
    pub fn is_fatal(&self) -> bool {
        match self {
            P2PError::Ledger(err) => err.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, P2PError>;
