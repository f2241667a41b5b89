//! Wire messages.
//!
//! Every frame is an envelope `{"type", "data", "sender", "timestamp"}`.
//! Decoding happens once at the framing boundary, turning the loosely typed
//! envelope into a [`Message`] whose [`Payload`] is a closed enum.

use crate::error::ProtocolError;
use filechain_types::{now_ms_i64, Block, FileId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Discriminant carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    QueryLatest,
    QueryAll,
    ResponseChain,
    BroadcastBlock,
    RequestFile,
    ResponseFileChunk,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Handshake,
        MessageKind::QueryLatest,
        MessageKind::QueryAll,
        MessageKind::ResponseChain,
        MessageKind::BroadcastBlock,
        MessageKind::RequestFile,
        MessageKind::ResponseFileChunk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Handshake => "HANDSHAKE",
            MessageKind::QueryLatest => "QUERY_LATEST",
            MessageKind::QueryAll => "QUERY_ALL",
            MessageKind::ResponseChain => "RESPONSE_CHAIN",
            MessageKind::BroadcastBlock => "BROADCAST_BLOCK",
            MessageKind::RequestFile => "REQUEST_FILE",
            MessageKind::ResponseFileChunk => "RESPONSE_FILE_CHUNK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HANDSHAKE payload: the port the sender listens on and its node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub port: u16,
    pub node_id: String,
}

/// REQUEST_FILE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub file_id: FileId,
}

/// RESPONSE_FILE_CHUNK payload. `chunk` is standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: FileId,
    pub chunk: String,
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Handshake(Handshake),
    QueryLatest,
    QueryAll,
    /// Never empty once decoded.
    ResponseChain(Vec<Block>),
    BroadcastBlock(Block),
    RequestFile(FileRequest),
    ResponseFileChunk(FileChunk),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Handshake(_) => MessageKind::Handshake,
            Payload::QueryLatest => MessageKind::QueryLatest,
            Payload::QueryAll => MessageKind::QueryAll,
            Payload::ResponseChain(_) => MessageKind::ResponseChain,
            Payload::BroadcastBlock(_) => MessageKind::BroadcastBlock,
            Payload::RequestFile(_) => MessageKind::RequestFile,
            Payload::ResponseFileChunk(_) => MessageKind::ResponseFileChunk,
        }
    }
}

/// Raw envelope as it appears on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    timestamp: i64,
}

/// A decoded protocol message. `sender` and `timestamp` are informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub timestamp: i64,
    pub payload: Payload,
}

impl Message {
    /// Stamp `payload` with `sender` and the current wall-clock time.
    pub fn new(sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            sender: sender.into(),
            timestamp: now_ms_i64(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Serialize to one wire frame, including the trailing newline.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = match &self.payload {
            Payload::Handshake(handshake) => serde_json::to_value(handshake)?,
            Payload::QueryLatest | Payload::QueryAll => Value::Null,
            Payload::ResponseChain(blocks) => serde_json::to_value(blocks)?,
            Payload::BroadcastBlock(block) => serde_json::to_value(block)?,
            Payload::RequestFile(request) => serde_json::to_value(request)?,
            Payload::ResponseFileChunk(chunk) => serde_json::to_value(chunk)?,
        };
        let envelope = Envelope {
            kind: self.kind().as_str().to_string(),
            data,
            sender: self.sender.clone(),
            timestamp: self.timestamp,
        };
        let mut frame = serde_json::to_vec(&envelope)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Parse one frame (without its newline).
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(frame)?;
        let kind = MessageKind::parse(&envelope.kind)
            .ok_or_else(|| ProtocolError::UnknownKind(envelope.kind.clone()))?;

        let payload = match kind {
            MessageKind::Handshake => Payload::Handshake(data(kind, envelope.data)?),
            MessageKind::QueryLatest => Payload::QueryLatest,
            MessageKind::QueryAll => Payload::QueryAll,
            MessageKind::ResponseChain => {
                let blocks: Vec<Block> = data(kind, envelope.data)?;
                if blocks.is_empty() {
                    return Err(ProtocolError::EmptyChain);
                }
                Payload::ResponseChain(blocks)
            }
            MessageKind::BroadcastBlock => Payload::BroadcastBlock(data(kind, envelope.data)?),
            MessageKind::RequestFile => Payload::RequestFile(data(kind, envelope.data)?),
            MessageKind::ResponseFileChunk => {
                Payload::ResponseFileChunk(data(kind, envelope.data)?)
            }
        };

        Ok(Self {
            sender: envelope.sender,
            timestamp: envelope.timestamp,
            payload,
        })
    }
}

fn data<T: DeserializeOwned>(kind: MessageKind, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}
