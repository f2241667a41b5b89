//! Filechain P2P overlay: newline-delimited JSON sessions over TCP, block
//! gossip, longest-chain resync, and chunked file transfer between peers.
//!
//! - **message**: the wire envelope and the typed [`Payload`] it decodes into
//! - **framing**: newline framing with an oversized-frame guard
//! - **transfer**: 64 KiB base64 chunking and per-session reassembly
//! - **session**: one reader and one writer task per connection
//! - **overlay**: peer registry, dispatch rules, and the API the node uses
//!
//! Sessions never mutate the chain. All ledger changes go through the
//! [`OverlayNode`], which holds the shared ledger lock only for the
//! duration of a single append or replace.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod framing;
pub mod message;
pub mod overlay;
pub mod session;
pub mod transfer;

pub use collaborators::{NoopRedundancyTracker, NoopRewardLedger, RedundancyTracker, RewardLedger};
pub use config::OverlayConfig;
pub use error::{P2PError, ProtocolError, Result, TransferError};
pub use framing::{FrameBuffer, FrameEvent};
pub use message::{FileChunk, FileRequest, Handshake, Message, MessageKind, Payload};
pub use overlay::{Collaborators, OverlayNode, PeerInfo, PeerState};
pub use session::{ConnId, Direction, Outbound, PeerHandle, Session, SessionHandler};
pub use transfer::{encode_chunks, TransferAssembler, CHUNK_SIZE};
