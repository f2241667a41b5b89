//! The overlay node: peer registry, message dispatch, and sync policy.

use crate::collaborators::{NoopRedundancyTracker, NoopRewardLedger, RedundancyTracker, RewardLedger};
use crate::config::OverlayConfig;
use crate::error::{P2PError, Result};
use crate::message::{FileRequest, Handshake, Message, Payload};
use crate::session::{ConnId, Direction, PeerHandle, Session, SessionHandler};
use async_trait::async_trait;
use filechain_ledger::{check_link, LedgerError, SharedLedger};
use filechain_storage::ContentStore;
use filechain_types::{now_ms, Block, BlockIndex, EventKind, FileId, FileRecord, RegistrationEvent};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Synced,
}

/// Peer information snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub conn_id: u64,
    pub remote_addr: SocketAddr,
    /// Remote ip plus the port the peer advertised in its handshake.
    pub advertised_addr: Option<SocketAddr>,
    pub node_id: Option<String>,
    pub state: PeerState,
    pub inbound: bool,
    pub connected_at_ms: u64,
}

#[derive(Debug)]
struct PeerEntry {
    handle: PeerHandle,
    state: PeerState,
    node_id: Option<String>,
    advertised_addr: Option<SocketAddr>,
    connected_at_ms: u64,
}

impl PeerEntry {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            conn_id: self.handle.conn_id().0,
            remote_addr: self.handle.remote_addr(),
            advertised_addr: self.advertised_addr,
            node_id: self.node_id.clone(),
            state: self.state,
            inbound: self.handle.direction() == Direction::Inbound,
            connected_at_ms: self.connected_at_ms,
        }
    }
}

/// External subsystems notified by the overlay.
#[derive(Clone)]
pub struct Collaborators {
    pub redundancy: Arc<dyn RedundancyTracker>,
    pub rewards: Arc<dyn RewardLedger>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            redundancy: Arc::new(NoopRedundancyTracker),
            rewards: Arc::new(NoopRewardLedger),
        }
    }
}

struct FileWaiter {
    id: u64,
    sender: oneshot::Sender<Arc<[u8]>>,
}

/// What the ledger decided for an inbound block or chain.
enum SyncOutcome {
    Ignored,
    Appended(Block),
    Replaced { first_new: BlockIndex, tip: BlockIndex },
    QueryAll,
    Rejected(LedgerError),
}

struct OverlayInner {
    config: OverlayConfig,
    ledger: SharedLedger,
    content: Arc<dyn ContentStore>,
    collaborators: Collaborators,
    peers: RwLock<HashMap<ConnId, PeerEntry>>,
    waiters: Mutex<HashMap<FileId, Vec<FileWaiter>>>,
    next_waiter: AtomicU64,
    local_addr: RwLock<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    fatal: watch::Sender<Option<String>>,
}

/// One participant in the overlay.
#[derive(Clone)]
pub struct OverlayNode {
    inner: Arc<OverlayInner>,
}

impl OverlayNode {
    pub fn new(
        config: OverlayConfig,
        ledger: SharedLedger,
        content: Arc<dyn ContentStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let (fatal, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(OverlayInner {
                config,
                ledger,
                content,
                collaborators,
                peers: RwLock::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                next_waiter: AtomicU64::new(1),
                local_addr: RwLock::new(None),
                accept_task: Mutex::new(None),
                fatal,
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.inner.ledger
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Bind the listener and start accepting peers. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let bind = format!("{}:{}", self.inner.config.listen_host, self.inner.config.listen_port);
        let listener = TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.write() = Some(addr);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "Accepted inbound connection");
                        if let Err(err) = inner.attach(stream, Direction::Inbound).await {
                            warn!(%remote, error = %err, "Failed to attach inbound peer");
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to accept connection"),
                }
            }
        });
        *self.inner.accept_task.lock() = Some(task);

        info!(node_id = %self.node_id(), %addr, "Overlay listening");
        Ok(addr)
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        for handle in self.inner.peer_handles(None) {
            handle.close();
        }
        info!(node_id = %self.node_id(), "Overlay stopped");
    }

    /// Dial `addr` and start a session. Fails fast after the connect timeout.
    pub async fn connect_to_peer(&self, addr: &str) -> Result<PeerInfo> {
        let connect_timeout = self.inner.config.connect_timeout;
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(P2PError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout: connect_timeout,
                })
            }
        };
        let handle = self.inner.attach(stream, Direction::Outbound).await?;
        info!(peer = %addr, conn = %handle.conn_id(), "Connected to peer");
        self.inner
            .peers
            .read()
            .get(&handle.conn_id())
            .map(PeerEntry::info)
            .ok_or(P2PError::PeerClosed(handle.remote_addr()))
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.peers.read().values().map(PeerEntry::info).collect();
        peers.sort_by_key(|peer| peer.conn_id);
        peers
    }

    pub fn get_chain(&self) -> Vec<Block> {
        self.inner.ledger.lock().chain().to_vec()
    }

    pub fn get_all_files(&self) -> Vec<FileRecord> {
        self.inner.ledger.lock().all_files()
    }

    /// Latest block touching `file_id`, DELETE included.
    pub fn find_file(&self, file_id: &str) -> Option<Block> {
        self.inner.ledger.lock().find_file(file_id).cloned()
    }

    /// Watch for a fatal persistence failure. The value becomes `Some` once.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.inner.fatal.subscribe()
    }

    /// Seal `event` off the async runtime and attach it to the local chain.
    /// Does not broadcast; see [`OverlayNode::broadcast_own_block`].
    pub async fn register_event(&self, event: RegistrationEvent) -> Result<Block> {
        self.inner.register_event(event).await
    }

    /// Store `bytes`, seal a REGISTER event for them, and gossip the block.
    pub async fn register_file(
        &self,
        filename: &str,
        original_path: &str,
        bytes: Vec<u8>,
        description: Option<String>,
    ) -> Result<Block> {
        let mut record = FileRecord::new(filename, original_path, &bytes, self.node_id());
        record.description = description;

        let content = self.inner.content.clone();
        let file_id = record.id.clone();
        tokio::task::spawn_blocking(move || content.put(&file_id, &bytes))
            .await
            .map_err(|err| P2PError::Worker(err.to_string()))??;

        let file_id = record.id.clone();
        let block = match self.register_event(RegistrationEvent::register(record)).await {
            Ok(block) => block,
            Err(err) => {
                self.inner.discard_content(file_id).await;
                return Err(err);
            }
        };
        self.broadcast_own_block(&block).await;
        Ok(block)
    }

    /// Send BROADCAST_BLOCK to every connected peer. Returns how many peers
    /// the block was queued for.
    pub async fn broadcast_own_block(&self, block: &Block) -> usize {
        let message = self.inner.message(Payload::BroadcastBlock(block.clone()));
        self.inner.broadcast(message, None).await
    }

    /// Ask every peer for `file_id` and wait for the first complete copy.
    ///
    /// When the ledger knows the file's content hash, copies that do not
    /// match are discarded and the wait continues. The winning copy is
    /// written to the content store.
    pub async fn request_file_from_network(
        &self,
        file_id: &str,
        wait: Duration,
    ) -> Result<Vec<u8>> {
        let peers = self.inner.peer_handles(None);
        if peers.is_empty() {
            return Err(P2PError::NoPeers);
        }

        let waiter_id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .entry(file_id.to_string())
            .or_default()
            .push(FileWaiter { id: waiter_id, sender });

        let request = self.inner.message(Payload::RequestFile(FileRequest {
            file_id: file_id.to_string(),
        }));
        for peer in &peers {
            if let Err(err) = peer.send(request.clone()).await {
                debug!(conn = %peer.conn_id(), error = %err, "Failed to send file request");
            }
        }
        debug!(file_id, peers = peers.len(), "Requested file from network");

        let bytes = match timeout(wait, receiver).await {
            Ok(Ok(bytes)) => bytes,
            _ => {
                self.inner.cancel_waiter(file_id, waiter_id);
                return Err(P2PError::FileTimeout {
                    file_id: file_id.to_string(),
                    timeout: wait,
                });
            }
        };

        let content = self.inner.content.clone();
        let id = file_id.to_string();
        let stored = bytes.clone();
        tokio::task::spawn_blocking(move || content.put(&id, &stored))
            .await
            .map_err(|err| P2PError::Worker(err.to_string()))??;

        if let Some(block) = self.find_file(file_id) {
            self.inner
                .collaborators
                .redundancy
                .notify_local_file_stored(&block.payload.file);
        }
        info!(file_id, bytes = bytes.len(), "Downloaded file from network");
        Ok(bytes.to_vec())
    }
}

impl OverlayInner {
    fn message(&self, payload: Payload) -> Message {
        Message::new(self.config.node_id.clone(), payload)
    }

    fn advertised_port(&self) -> u16 {
        self.config
            .advertised_port
            .or_else(|| self.local_addr.read().map(|addr| addr.port()))
            .unwrap_or(self.config.listen_port)
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream, direction: Direction) -> Result<PeerHandle> {
        let session = Session::new(stream, direction, &self.config)?;
        let handle = session.handle().clone();
        self.peers.write().insert(
            handle.conn_id(),
            PeerEntry {
                handle: handle.clone(),
                state: PeerState::Connecting,
                node_id: None,
                advertised_addr: None,
                connected_at_ms: now_ms(),
            },
        );
        gauge!("filechain_p2p_peers").set(self.peers.read().len() as f64);

        session.spawn(self.clone());

        let handshake = self.message(Payload::Handshake(Handshake {
            port: self.advertised_port(),
            node_id: self.config.node_id.clone(),
        }));
        handle.send(handshake).await?;
        self.set_state(handle.conn_id(), PeerState::Handshaking);
        Ok(handle)
    }

    fn set_state(&self, conn_id: ConnId, state: PeerState) {
        if let Some(entry) = self.peers.write().get_mut(&conn_id) {
            // A handshake may already have completed from the other side.
            if !(entry.state == PeerState::Synced && state == PeerState::Handshaking) {
                entry.state = state;
            }
        }
    }

    fn peer_handles(&self, except: Option<ConnId>) -> Vec<PeerHandle> {
        self.peers
            .read()
            .values()
            .filter(|entry| Some(entry.handle.conn_id()) != except)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    fn peer_node_id(&self, conn_id: ConnId) -> Option<String> {
        self.peers
            .read()
            .get(&conn_id)
            .and_then(|entry| entry.node_id.clone())
    }

    async fn broadcast(&self, message: Message, except: Option<ConnId>) -> usize {
        let mut sent = 0;
        for peer in self.peer_handles(except) {
            match peer.send(message.clone()).await {
                Ok(()) => sent += 1,
                Err(err) => debug!(conn = %peer.conn_id(), error = %err, "Broadcast send failed"),
            }
        }
        sent
    }

    async fn reply(&self, peer: &PeerHandle, payload: Payload) {
        if let Err(err) = peer.send(self.message(payload)).await {
            debug!(conn = %peer.conn_id(), error = %err, "Reply failed");
        }
    }

    fn signal_fatal(&self, err: &LedgerError) {
        error!(error = %err, "Chain persistence failed; node must stop");
        counter!("filechain_p2p_fatal_errors_total").increment(1);
        self.fatal.send_replace(Some(err.to_string()));
    }

    fn record_height(&self, height: BlockIndex) {
        gauge!("filechain_chain_height").set(height as f64);
    }

    async fn register_event(&self, event: RegistrationEvent) -> Result<Block> {
        event.file.validate().map_err(LedgerError::from)?;

        let mut last_err = None;
        for attempt in 0..=self.config.max_seal_retries {
            let (template, difficulty, max_attempts) = {
                let ledger = self.ledger.lock();
                let config = ledger.config();
                (
                    ledger.next_template(event.clone()),
                    config.difficulty,
                    config.max_mining_attempts,
                )
            };

            let block = tokio::task::spawn_blocking(move || template.seal(difficulty, max_attempts))
                .await
                .map_err(|err| P2PError::Worker(err.to_string()))??;

            let accepted = self.ledger.lock().accept_block(block.clone());
            match accepted {
                Ok(()) => {
                    self.after_local_append(&block).await;
                    return Ok(block);
                }
                Err(LedgerError::InvalidBlock(reason)) => {
                    debug!(attempt, %reason, "Tip moved while sealing, resealing");
                    last_err = Some(LedgerError::InvalidBlock(reason));
                }
                Err(err) => {
                    if err.is_fatal() {
                        self.signal_fatal(&err);
                    }
                    return Err(err.into());
                }
            }
        }

        Err(last_err
            .map(P2PError::from)
            .unwrap_or_else(|| P2PError::Worker("sealing did not run".into())))
    }

    async fn after_local_append(&self, block: &Block) {
        counter!("filechain_p2p_blocks_appended_total", "source" => "local").increment(1);
        self.record_height(block.index);
        self.collaborators
            .rewards
            .notify_block_validated(&self.config.node_id, block.index);

        let event = &block.payload;
        if event.kind == EventKind::Delete {
            return;
        }
        let content = self.content.clone();
        let file_id = event.file.id.clone();
        let present = tokio::task::spawn_blocking(move || content.contains(&file_id))
            .await
            .ok()
            .and_then(|res| res.ok())
            .unwrap_or(false);
        if present {
            self.collaborators.redundancy.notify_local_file_stored(&event.file);
        }
        info!(index = block.index, file_id = %event.file.id, kind = %event.kind, "Registered event");
    }

    fn apply_outcome(&self, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Appended(block) => {
                counter!("filechain_p2p_blocks_appended_total", "source" => "peer").increment(1);
                self.record_height(block.index);
                self.collaborators
                    .rewards
                    .notify_block_validated(&self.config.node_id, block.index);
            }
            SyncOutcome::Replaced { first_new, tip } => {
                counter!("filechain_p2p_chain_replacements_total").increment(1);
                self.record_height(*tip);
                for index in *first_new..=*tip {
                    self.collaborators
                        .rewards
                        .notify_block_validated(&self.config.node_id, index);
                }
            }
            SyncOutcome::Rejected(err) if err.is_fatal() => self.signal_fatal(err),
            SyncOutcome::Rejected(err) => debug!(error = %err, "Rejected peer data"),
            SyncOutcome::Ignored | SyncOutcome::QueryAll => {}
        }
    }

    async fn handle_handshake(&self, peer: &PeerHandle, handshake: Handshake) {
        if handshake.node_id == self.config.node_id {
            warn!(conn = %peer.conn_id(), "Closing connection to self");
            peer.close();
            return;
        }

        let advertised = SocketAddr::new(peer.remote_addr().ip(), handshake.port);
        if let Some(entry) = self.peers.write().get_mut(&peer.conn_id()) {
            entry.node_id = Some(handshake.node_id.clone());
            entry.advertised_addr = Some(advertised);
            entry.state = PeerState::Synced;
        }
        info!(conn = %peer.conn_id(), node_id = %handshake.node_id, %advertised, "Peer handshake complete");
        self.reply(peer, Payload::QueryAll).await;
    }

    async fn handle_chain_response(&self, peer: &PeerHandle, blocks: Vec<Block>) {
        let Some(received) = blocks.last().cloned() else {
            return;
        };
        let outcome = {
            let mut ledger = self.ledger.lock();
            let local_tip = ledger.tip().clone();
            if received.index <= local_tip.index {
                SyncOutcome::Ignored
            } else if received.previous_hash == local_tip.hash {
                match ledger.accept_block(received.clone()) {
                    Ok(()) => SyncOutcome::Appended(received),
                    Err(err) => SyncOutcome::Rejected(err),
                }
            } else if blocks.len() == 1 {
                SyncOutcome::QueryAll
            } else {
                match ledger.replace(blocks) {
                    Ok(first_new) => SyncOutcome::Replaced {
                        first_new,
                        tip: received.index,
                    },
                    Err(err) => SyncOutcome::Rejected(err),
                }
            }
        };

        match &outcome {
            SyncOutcome::Appended(block) => {
                info!(conn = %peer.conn_id(), index = block.index, "Appended block from chain response")
            }
            SyncOutcome::Replaced { tip, .. } => {
                info!(conn = %peer.conn_id(), height = *tip, "Adopted longer chain from peer")
            }
            SyncOutcome::Rejected(err) => {
                warn!(conn = %peer.conn_id(), error = %err, "Rejected chain from peer")
            }
            SyncOutcome::QueryAll => {
                debug!(conn = %peer.conn_id(), "Peer is ahead, querying all peers for full chain");
                self.broadcast(self.message(Payload::QueryAll), None).await;
            }
            SyncOutcome::Ignored => debug!(conn = %peer.conn_id(), "Peer chain not ahead"),
        }
        self.apply_outcome(&outcome);
    }

    async fn handle_broadcast_block(&self, peer: &PeerHandle, sender: &str, block: Block) {
        let outcome = {
            let mut ledger = self.ledger.lock();
            let tip_index = ledger.tip().index;
            let attaches = check_link(&block, ledger.tip()).is_ok();
            if attaches {
                match ledger.accept_block(block.clone()) {
                    Ok(()) => SyncOutcome::Appended(block.clone()),
                    Err(err) => SyncOutcome::Rejected(err),
                }
            } else if block.index > tip_index {
                SyncOutcome::QueryAll
            } else {
                SyncOutcome::Ignored
            }
        };

        match &outcome {
            SyncOutcome::Appended(block) => {
                debug!(conn = %peer.conn_id(), index = block.index, "Appended gossiped block");
                let relay = self.message(Payload::BroadcastBlock(block.clone()));
                self.broadcast(relay, Some(peer.conn_id())).await;

                let event = &block.payload;
                if event.kind != EventKind::Delete {
                    let origin = self
                        .peer_node_id(peer.conn_id())
                        .unwrap_or_else(|| sender.to_string());
                    self.collaborators.redundancy.notify_remote_file_seen(
                        &origin,
                        &event.file.id,
                        event.file.size_bytes,
                    );
                }
            }
            SyncOutcome::QueryAll => {
                debug!(conn = %peer.conn_id(), index = block.index, "Gossiped block does not attach, resyncing");
                self.reply(peer, Payload::QueryAll).await;
            }
            _ => {}
        }
        self.apply_outcome(&outcome);
    }

    async fn serve_file(&self, peer: &PeerHandle, request: FileRequest) {
        let content = self.content.clone();
        let file_id = request.file_id.clone();
        let lookup = tokio::task::spawn_blocking(move || content.get(&file_id)).await;

        let bytes = match lookup {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                debug!(conn = %peer.conn_id(), file_id = %request.file_id, "Requested file not held locally");
                return;
            }
            Ok(Err(err)) => {
                warn!(file_id = %request.file_id, error = %err, "Failed to read requested file");
                return;
            }
            Err(err) => {
                warn!(file_id = %request.file_id, error = %err, "File lookup task failed");
                return;
            }
        };

        let byte_count = bytes.len() as u64;
        if let Err(err) = peer.send_file(request.file_id.clone(), Arc::from(bytes)).await {
            debug!(conn = %peer.conn_id(), error = %err, "Failed to queue file");
            return;
        }

        let block_index = {
            let ledger = self.ledger.lock();
            ledger
                .find_file(&request.file_id)
                .map(|block| block.index)
                .unwrap_or(ledger.tip().index)
        };
        counter!("filechain_p2p_bytes_served_total").increment(byte_count);
        self.collaborators.rewards.notify_bytes_served(
            &self.config.node_id,
            &request.file_id,
            byte_count,
            block_index,
        );
        info!(conn = %peer.conn_id(), file_id = %request.file_id, bytes = byte_count, "Serving file");
    }

    /// Drop stored bytes that never made it into the ledger.
    async fn discard_content(&self, file_id: FileId) {
        let content = self.content.clone();
        let id = file_id.clone();
        match tokio::task::spawn_blocking(move || content.remove(&id)).await {
            Ok(Ok(())) => debug!(file_id = %file_id, "Discarded content of unregistered file"),
            Ok(Err(err)) => warn!(file_id = %file_id, error = %err, "Failed to discard content"),
            Err(err) => warn!(file_id = %file_id, error = %err, "Content cleanup task failed"),
        }
    }

    fn cancel_waiter(&self, file_id: &str, waiter_id: u64) {
        let mut waiters = self.waiters.lock();
        let Some(list) = waiters.get_mut(file_id) else {
            return;
        };
        list.retain(|waiter| waiter.id != waiter_id);
        if list.is_empty() {
            waiters.remove(file_id);
            drop(waiters);
            for peer in self.peer_handles(None) {
                peer.abandon_transfer(file_id);
            }
        }
    }
}

#[async_trait]
impl SessionHandler for OverlayInner {
    async fn on_message(&self, peer: &PeerHandle, message: Message) {
        let Message {
            sender, payload, ..
        } = message;
        match payload {
            Payload::Handshake(handshake) => self.handle_handshake(peer, handshake).await,
            Payload::QueryLatest => {
                let tip = self.ledger.lock().tip().clone();
                self.reply(peer, Payload::ResponseChain(vec![tip])).await;
            }
            Payload::QueryAll => {
                let chain = self.ledger.lock().chain().to_vec();
                self.reply(peer, Payload::ResponseChain(chain)).await;
            }
            Payload::ResponseChain(blocks) => self.handle_chain_response(peer, blocks).await,
            Payload::BroadcastBlock(block) => {
                self.handle_broadcast_block(peer, &sender, block).await
            }
            Payload::RequestFile(request) => self.serve_file(peer, request).await,
            Payload::ResponseFileChunk(chunk) => {
                debug!(conn = %peer.conn_id(), file_id = %chunk.file_id, "Unassembled chunk reached dispatch");
            }
        }
    }

    async fn on_file(&self, peer: &PeerHandle, file_id: FileId, bytes: Vec<u8>) {
        if !self.waiters.lock().contains_key(&file_id) {
            debug!(conn = %peer.conn_id(), file_id = %file_id, "Dropping unrequested file");
            return;
        }

        let expected = self
            .ledger
            .lock()
            .find_file(&file_id)
            .map(|block| block.payload.file.clone());
        if let Some(record) = &expected {
            if !record.matches_content(&bytes) {
                warn!(conn = %peer.conn_id(), file_id = %file_id, "Discarding file with mismatched content hash");
                counter!("filechain_p2p_transfers_rejected_total").increment(1);
                return;
            }
        }

        let Some(waiters) = self.waiters.lock().remove(&file_id) else {
            return;
        };
        let bytes: Arc<[u8]> = Arc::from(bytes);
        for waiter in waiters {
            let _ = waiter.sender.send(bytes.clone());
        }
        debug!(conn = %peer.conn_id(), file_id = %file_id, bytes = bytes.len(), "File transfer complete");
    }

    fn wants_file(&self, file_id: &str) -> bool {
        self.waiters.lock().contains_key(file_id)
    }

    async fn on_closed(&self, peer: &PeerHandle) {
        let removed = self.peers.write().remove(&peer.conn_id());
        gauge!("filechain_p2p_peers").set(self.peers.read().len() as f64);
        if let Some(entry) = removed {
            info!(
                conn = %peer.conn_id(),
                node_id = entry.node_id.as_deref().unwrap_or("unknown"),
                "Peer disconnected"
            );
        }
    }
}
