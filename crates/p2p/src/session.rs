//! Peer sessions.
//!
//! Each TCP connection gets a reader task (framing, decoding, file
//! reassembly) and a writer task draining a bounded outbound queue. The two
//! share a shutdown flag so either side failing tears the whole session down.

use crate::config::{OverlayConfig, DEFAULT_SEND_TIMEOUT};
use crate::error::{P2PError, Result};
use crate::framing::{FrameBuffer, FrameEvent};
use crate::message::{Message, Payload};
use crate::transfer::{encode_chunks, TransferAssembler};
use async_trait::async_trait;
use filechain_types::FileId;
use metrics::counter;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Work queued for a session's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    /// Stream a whole file as successive RESPONSE_FILE_CHUNK frames.
    File { file_id: FileId, bytes: Arc<[u8]> },
}

/// Receives everything a session reads.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_message(&self, peer: &PeerHandle, message: Message);

    /// A RESPONSE_FILE_CHUNK sequence for `file_id` completed.
    async fn on_file(&self, peer: &PeerHandle, file_id: FileId, bytes: Vec<u8>);

    /// Whether chunks for `file_id` should be reassembled at all. Chunks for
    /// unwanted ids are dropped before they are buffered.
    fn wants_file(&self, _file_id: &str) -> bool {
        true
    }

    async fn on_closed(&self, peer: &PeerHandle);
}

struct PeerShared {
    conn_id: ConnId,
    remote_addr: SocketAddr,
    direction: Direction,
    outbound: mpsc::Sender<Outbound>,
    send_timeout: Duration,
    transfers: Mutex<TransferAssembler>,
    shutdown: watch::Sender<bool>,
}

/// Cheap, clonable handle to a live session.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<PeerShared>,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("conn_id", &self.inner.conn_id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("direction", &self.inner.direction)
            .finish()
    }
}

impl PeerHandle {
    fn new(
        conn_id: ConnId,
        remote_addr: SocketAddr,
        direction: Direction,
        capacity: usize,
        send_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(PeerShared {
                conn_id,
                remote_addr,
                direction,
                outbound,
                send_timeout,
                transfers: Mutex::new(TransferAssembler::new()),
                shutdown,
            }),
        };
        (handle, rx)
    }

    /// A handle with no socket behind it; queued work lands on the returned
    /// receiver.
    pub fn detached(remote_addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        Self::new(
            ConnId::next(),
            remote_addr,
            Direction::Inbound,
            capacity,
            DEFAULT_SEND_TIMEOUT,
        )
    }

    pub fn conn_id(&self) -> ConnId {
        self.inner.conn_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.enqueue(Outbound::Message(message)).await
    }

    pub async fn send_file(&self, file_id: FileId, bytes: Arc<[u8]>) -> Result<()> {
        self.enqueue(Outbound::File { file_id, bytes }).await
    }

    /// Queue `work` without letting one stalled peer hold up the caller:
    /// a full queue gets `send_timeout` to drain, then the session is closed.
    async fn enqueue(&self, work: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(P2PError::PeerClosed(self.remote_addr()));
        }
        let work = match self.inner.outbound.try_send(work) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(P2PError::PeerClosed(self.remote_addr())),
            Err(TrySendError::Full(work)) => work,
        };

        let send_timeout = self.inner.send_timeout;
        match self.inner.outbound.send_timeout(work, send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(P2PError::PeerClosed(self.remote_addr())),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    conn = %self.conn_id(),
                    peer = %self.remote_addr(),
                    timeout = ?send_timeout,
                    "Outbound queue stalled, closing peer"
                );
                counter!("filechain_p2p_slow_peers_closed_total").increment(1);
                self.close();
                Err(P2PError::SendTimeout {
                    addr: self.remote_addr(),
                    timeout: send_timeout,
                })
            }
        }
    }

    /// Drop partial inbound state for `file_id`.
    pub fn abandon_transfer(&self, file_id: &str) -> bool {
        self.inner.transfers.lock().abandon(file_id)
    }

    pub fn transfers_in_flight(&self) -> usize {
        self.inner.transfers.lock().in_flight()
    }

    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Feed a decoded chunk into this session's reassembly state.
    pub(crate) fn accept_chunk(&self, chunk: crate::message::FileChunk) -> Option<(FileId, Vec<u8>)> {
        let file_id = chunk.file_id.clone();
        match self.inner.transfers.lock().accept(chunk) {
            Ok(done) => done,
            Err(err) => {
                warn!(conn = %self.conn_id(), file_id = %file_id, error = %err, "Abandoning file transfer");
                counter!("filechain_p2p_transfers_abandoned_total").increment(1);
                None
            }
        }
    }
}

/// A connected socket that has not started its tasks yet.
///
/// Splitting construction from [`Session::spawn`] lets the caller register
/// the handle before the first inbound frame can be dispatched.
pub struct Session {
    handle: PeerHandle,
    stream: TcpStream,
    outbound_rx: mpsc::Receiver<Outbound>,
    node_id: String,
    max_frame_bytes: usize,
}

impl Session {
    pub fn new(stream: TcpStream, direction: Direction, config: &OverlayConfig) -> Result<Self> {
        let remote_addr = stream.peer_addr()?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%remote_addr, error = %err, "Failed to set TCP_NODELAY");
        }
        let (handle, outbound_rx) = PeerHandle::new(
            ConnId::next(),
            remote_addr,
            direction,
            config.outbound_queue,
            config.send_timeout,
        );
        Ok(Self {
            handle,
            stream,
            outbound_rx,
            node_id: config.node_id.clone(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Start the reader and writer tasks. The returned task ends after
    /// `handler.on_closed` has run.
    pub fn spawn(self, handler: Arc<dyn SessionHandler>) -> JoinHandle<()> {
        let Session {
            handle,
            stream,
            outbound_rx,
            node_id,
            max_frame_bytes,
        } = self;
        let (reader, writer) = stream.into_split();

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            handle.clone(),
            node_id,
            max_frame_bytes,
        ));

        tokio::spawn(async move {
            if let Err(err) = read_loop(reader, &handle, &handler, max_frame_bytes).await {
                debug!(conn = %handle.conn_id(), error = %err, "Session read failed");
            }
            handle.close();
            let _ = writer_task.await;
            handler.on_closed(&handle).await;
            debug!(conn = %handle.conn_id(), peer = %handle.remote_addr(), "Session closed");
        })
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer: &PeerHandle,
    handler: &Arc<dyn SessionHandler>,
    max_frame_bytes: usize,
) -> Result<()> {
    let mut shutdown = peer.shutdown_signal();
    let mut framer = FrameBuffer::new(max_frame_bytes);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = shutdown.wait_for(|closed| *closed) => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }

        for event in framer.push(&buf[..read]) {
            match event {
                FrameEvent::Frame(frame) => dispatch_frame(peer, handler, &frame).await,
                FrameEvent::Oversized => {
                    warn!(conn = %peer.conn_id(), limit = max_frame_bytes, "Dropping oversized frame");
                    counter!("filechain_p2p_messages_dropped_total", "reason" => "oversized")
                        .increment(1);
                }
            }
        }
    }
}

async fn dispatch_frame(peer: &PeerHandle, handler: &Arc<dyn SessionHandler>, frame: &[u8]) {
    let message = match Message::decode(frame) {
        Ok(message) => message,
        Err(err) => {
            warn!(conn = %peer.conn_id(), error = %err, "Dropping malformed message");
            counter!("filechain_p2p_messages_dropped_total", "reason" => "malformed")
                .increment(1);
            return;
        }
    };
    counter!("filechain_p2p_messages_received_total", "type" => message.kind().as_str())
        .increment(1);

    match message.payload {
        Payload::ResponseFileChunk(chunk) => {
            if !handler.wants_file(&chunk.file_id) {
                peer.abandon_transfer(&chunk.file_id);
                debug!(conn = %peer.conn_id(), file_id = %chunk.file_id, "Dropping chunk for unrequested file");
                counter!("filechain_p2p_messages_dropped_total", "reason" => "unrequested")
                    .increment(1);
                return;
            }
            if let Some((file_id, bytes)) = peer.accept_chunk(chunk) {
                handler.on_file(peer, file_id, bytes).await;
            }
        }
        _ => handler.on_message(peer, message).await,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    peer: PeerHandle,
    node_id: String,
    max_frame_bytes: usize,
) {
    let mut shutdown = peer.shutdown_signal();
    loop {
        let work = tokio::select! {
            work = rx.recv() => work,
            _ = shutdown.wait_for(|closed| *closed) => None,
        };
        let Some(work) = work else { break };

        // A peer that stopped reading must not pin this task in write_all.
        let written = tokio::select! {
            written = write_work(&mut writer, work, &node_id, max_frame_bytes) => written,
            _ = shutdown.wait_for(|closed| *closed) => break,
        };
        if let Err(err) = written {
            debug!(conn = %peer.conn_id(), error = %err, "Session write failed");
            break;
        }
    }
    peer.close();
    let _ = writer.shutdown().await;
}

async fn write_work(
    writer: &mut OwnedWriteHalf,
    work: Outbound,
    node_id: &str,
    max_frame_bytes: usize,
) -> Result<()> {
    match work {
        Outbound::Message(message) => {
            let frame = message.encode()?;
            if max_frame_bytes != 0 && frame.len() > max_frame_bytes {
                warn!(
                    kind = %message.kind(),
                    bytes = frame.len(),
                    limit = max_frame_bytes,
                    "Sending frame larger than max_frame_bytes; peers with the same limit will drop it"
                );
            }
            writer.write_all(&frame).await?;
        }
        Outbound::File { file_id, bytes } => {
            for chunk in encode_chunks(&file_id, &bytes) {
                let frame = Message::new(node_id, Payload::ResponseFileChunk(chunk)).encode()?;
                writer.write_all(&frame).await?;
            }
            debug!(file_id = %file_id, bytes = bytes.len(), "Streamed file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FileChunk;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        files: Mutex<Vec<(FileId, Vec<u8>)>>,
        closed: Mutex<u32>,
        refuse_files: bool,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn on_message(&self, _peer: &PeerHandle, message: Message) {
            self.messages.lock().push(message);
        }

        async fn on_file(&self, _peer: &PeerHandle, file_id: FileId, bytes: Vec<u8>) {
            self.files.lock().push((file_id, bytes));
        }

        async fn on_closed(&self, _peer: &PeerHandle) {
            *self.closed.lock() += 1;
        }

        fn wants_file(&self, _file_id: &str) -> bool {
            !self.refuse_files
        }
    }

    fn chunk_message(file_id: &str, chunk: &str, is_last: bool) -> Message {
        Message::new(
            "remote",
            Payload::ResponseFileChunk(FileChunk {
                file_id: file_id.into(),
                chunk: chunk.into(),
                is_last,
            }),
        )
    }

    async fn wait_until(recorder: &Recorder, check: impl Fn(&Recorder) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check(recorder) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_session_survives_malformed_lines() {
        let (mut client, server) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(server, Direction::Inbound, &OverlayConfig::default()).unwrap();
        session.spawn(recorder.clone());

        let good = Message::new("remote", Payload::QueryAll).encode().unwrap();
        client.write_all(b"garbage\n{\"type\":\"NOPE\"}\n").await.unwrap();
        client.write_all(&good[..5]).await.unwrap();
        client.write_all(&good[5..]).await.unwrap();

        wait_until(&recorder, |r| r.messages.lock().len() == 1).await;
        assert_eq!(recorder.messages.lock()[0].payload, Payload::QueryAll);

        drop(client);
        wait_until(&recorder, |r| *r.closed.lock() == 1).await;
    }

    #[tokio::test]
    async fn test_file_streams_between_sessions() {
        let (a, b) = socket_pair().await;
        let config = OverlayConfig::default();
        let sender = Session::new(a, Direction::Outbound, &config).unwrap();
        let sender_handle = sender.handle().clone();
        sender.spawn(Arc::new(Recorder::default()));

        let recorder = Arc::new(Recorder::default());
        Session::new(b, Direction::Inbound, &config)
            .unwrap()
            .spawn(recorder.clone());

        let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        sender_handle
            .send_file("f1".into(), Arc::from(bytes.clone()))
            .await
            .unwrap();

        wait_until(&recorder, |r| r.files.lock().len() == 1).await;
        let files = recorder.files.lock();
        assert_eq!(files[0].0, "f1");
        assert_eq!(files[0].1, bytes);
        assert!(recorder.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_transfer_discards_partial_state() {
        let (mut client, server) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(server, Direction::Inbound, &OverlayConfig::default()).unwrap();
        let handle = session.handle().clone();
        session.spawn(recorder.clone());

        let first = Message::new(
            "remote",
            Payload::ResponseFileChunk(FileChunk {
                file_id: "f1".into(),
                chunk: "aGVsbG8=".into(),
                is_last: false,
            }),
        );
        client.write_all(&first.encode().unwrap()).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while handle.transfers_in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(handle.abandon_transfer("f1"));
        let last = Message::new(
            "remote",
            Payload::ResponseFileChunk(FileChunk {
                file_id: "f1".into(),
                chunk: "IQ==".into(),
                is_last: true,
            }),
        );
        client.write_all(&last.encode().unwrap()).await.unwrap();

        wait_until(&recorder, |r| r.files.lock().len() == 1).await;
        assert_eq!(recorder.files.lock()[0].1, b"!".to_vec());
    }

    #[tokio::test]
    async fn test_close_ends_session_and_rejects_sends() {
        let (_client, server) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(server, Direction::Inbound, &OverlayConfig::default()).unwrap();
        let handle = session.handle().clone();
        let task = session.spawn(recorder.clone());

        handle.close();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(*recorder.closed.lock(), 1);
        assert!(matches!(
            handle.send(Message::new("me", Payload::QueryAll)).await,
            Err(P2PError::PeerClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_unwanted_chunks_are_not_buffered() {
        let (mut client, server) = socket_pair().await;
        let recorder = Arc::new(Recorder {
            refuse_files: true,
            ..Recorder::default()
        });
        let session = Session::new(server, Direction::Inbound, &OverlayConfig::default()).unwrap();
        let handle = session.handle().clone();
        session.spawn(recorder.clone());

        for _ in 0..3 {
            let chunk = chunk_message("unsolicited", "aGVsbG8=", false);
            client.write_all(&chunk.encode().unwrap()).await.unwrap();
        }
        let marker = Message::new("remote", Payload::QueryLatest).encode().unwrap();
        client.write_all(&marker).await.unwrap();

        // Frames dispatch in order, so the marker arriving means the chunks were seen.
        wait_until(&recorder, |r| r.messages.lock().len() == 1).await;
        assert_eq!(handle.transfers_in_flight(), 0);
        assert!(recorder.files.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_closes_peer_after_send_timeout() {
        let (handle, _rx) = PeerHandle::new(
            ConnId::next(),
            SocketAddr::from(([127, 0, 0, 1], 9000)),
            Direction::Outbound,
            1,
            Duration::from_millis(50),
        );
        let message = Message::new("me", Payload::QueryAll);
        handle.send(message.clone()).await.unwrap();

        let err = timeout(Duration::from_secs(5), handle.send(message.clone()))
            .await
            .expect("send must not wait past its timeout")
            .unwrap_err();
        assert!(matches!(err, P2PError::SendTimeout { .. }));
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(message).await,
            Err(P2PError::PeerClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_session_with_non_reading_peer_shuts_down() {
        let (_client, server) = socket_pair().await;
        let config = OverlayConfig {
            outbound_queue: 1,
            send_timeout: Duration::from_millis(100),
            ..OverlayConfig::default()
        };
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(server, Direction::Inbound, &config).unwrap();
        let handle = session.handle().clone();
        let task = session.spawn(recorder.clone());

        // The client never reads, so socket buffers and then the queue fill up.
        let bytes: Arc<[u8]> = Arc::from(vec![7u8; 1024 * 1024]);
        let mut outcome = Ok(());
        for _ in 0..256 {
            outcome = handle.send_file("big".into(), bytes.clone()).await;
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(P2PError::SendTimeout { .. })));

        timeout(Duration::from_secs(5), task)
            .await
            .expect("writer stayed blocked on the stalled socket")
            .unwrap();
        assert_eq!(*recorder.closed.lock(), 1);
    }
}
