use crate::error::P2PError;
use std::time::Duration;

/// How long a send may wait on a full per-peer queue before the peer is dropped.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Overlay network configuration
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Stable identifier advertised in handshakes and stamped on messages.
    pub node_id: String,
    pub listen_host: String,
    /// `0` picks an ephemeral port.
    pub listen_port: u16,
    /// Port advertised in HANDSHAKE. Defaults to the bound port.
    pub advertised_port: Option<u16>,
    pub connect_timeout: Duration,
    /// Longest accepted frame in bytes. `0` disables the guard.
    ///
    /// A full-chain RESPONSE_CHAIN is a single frame, so a non-zero limit
    /// also caps the chain length a peer can resync from.
    pub max_frame_bytes: usize,
    /// Outbound messages buffered per peer before senders wait.
    pub outbound_queue: usize,
    /// Longest wait on a full outbound queue; the peer is closed after it.
    pub send_timeout: Duration,
    pub file_request_timeout: Duration,
    /// Reseal attempts when the tip moves while a block is being mined.
    pub max_seal_retries: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            node_id: "filechain-node".to_string(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 6001,
            advertised_port: None,
            connect_timeout: Duration::from_secs(5),
            max_frame_bytes: 0,
            outbound_queue: 1024,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            file_request_timeout: Duration::from_secs(30),
            max_seal_retries: 3,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<(), P2PError> {
        if self.node_id.trim().is_empty() {
            return Err(P2PError::InvalidConfig("node_id must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(P2PError::InvalidConfig(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(P2PError::InvalidConfig(
                "send_timeout must be greater than zero".into(),
            ));
        }
        if self.file_request_timeout.is_zero() {
            return Err(P2PError::InvalidConfig(
                "file_request_timeout must be greater than zero".into(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(P2PError::InvalidConfig(
                "outbound_queue must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
