use filechain_ledger::{Ledger, LedgerConfig};
use filechain_p2p::{
    Collaborators, Message, OverlayConfig, OverlayNode, P2PError, Payload, PeerState,
};
use filechain_storage::{ContentStore, MemoryContentStore};
use filechain_types::{content_hash, Block, FileRecord, RegistrationEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

struct TestNode {
    overlay: OverlayNode,
    content: Arc<MemoryContentStore>,
    addr: SocketAddr,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_node(node_id: &str) -> TestNode {
    spawn_node_with(node_id, |_| {}).await
}

async fn spawn_node_with(node_id: &str, tune: impl FnOnce(&mut OverlayConfig)) -> TestNode {
    init_tracing();
    let ledger = Ledger::in_memory(LedgerConfig::with_difficulty(1))
        .expect("ledger")
        .into_shared();
    let content = Arc::new(MemoryContentStore::new());
    let mut config = OverlayConfig {
        node_id: node_id.to_string(),
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        connect_timeout: Duration::from_secs(2),
        ..OverlayConfig::default()
    };
    tune(&mut config);
    let overlay = OverlayNode::new(config, ledger, content.clone(), Collaborators::default())
        .expect("overlay");
    let addr = overlay.start().await.expect("listen");
    TestNode {
        overlay,
        content,
        addr,
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let reached = timeout(Duration::from_secs(10), async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn synced_peers(node: &TestNode, count: usize) {
    eventually("handshakes", || {
        let peers = node.overlay.list_peers();
        peers.len() == count && peers.iter().all(|p| p.state == PeerState::Synced)
    })
    .await;
}

fn event(name: &str, bytes: &[u8], uploader: &str) -> RegistrationEvent {
    RegistrationEvent::register(FileRecord::new(name, format!("/srv/{name}"), bytes, uploader))
}

#[tokio::test]
async fn broadcast_block_reaches_peers_and_is_relayed() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-b").await;
    let c = spawn_node("node-c").await;

    // Line topology: A - B - C.
    b.overlay.connect_to_peer(&a.addr.to_string()).await.unwrap();
    c.overlay.connect_to_peer(&b.addr.to_string()).await.unwrap();
    synced_peers(&b, 2).await;

    let block = a
        .overlay
        .register_file("notes.txt", "/home/a/notes.txt", b"hello overlay".to_vec(), None)
        .await
        .unwrap();

    eventually("B appends", || b.overlay.get_chain().len() == 2).await;
    eventually("C receives relay", || c.overlay.get_chain().len() == 2).await;
    assert_eq!(b.overlay.get_chain()[1], block);
    assert_eq!(c.overlay.get_chain(), a.overlay.get_chain());
    assert_eq!(c.overlay.get_all_files()[0].filename, "notes.txt");
}

#[tokio::test]
async fn node_three_blocks_behind_resyncs_on_gossip() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-b").await;
    b.overlay.connect_to_peer(&a.addr.to_string()).await.unwrap();
    synced_peers(&a, 1).await;

    for i in 0..3 {
        a.overlay
            .register_event(event(&format!("quiet-{i}"), b"x", "node-a"))
            .await
            .unwrap();
    }
    assert_eq!(b.overlay.get_chain().len(), 1);

    let tip = a
        .overlay
        .register_event(event("loud", b"y", "node-a"))
        .await
        .unwrap();
    a.overlay.broadcast_own_block(&tip).await;

    eventually("B adopts A's chain", || b.overlay.get_chain().len() == 5).await;
    assert_eq!(b.overlay.get_chain(), a.overlay.get_chain());
    assert_eq!(b.overlay.get_all_files().len(), 4);
}

#[tokio::test]
async fn late_joiner_syncs_through_handshake() {
    let a = spawn_node("node-a").await;
    for i in 0..3 {
        a.overlay
            .register_event(event(&format!("f{i}"), b"z", "node-a"))
            .await
            .unwrap();
    }

    let b = spawn_node("node-b").await;
    b.overlay.connect_to_peer(&a.addr.to_string()).await.unwrap();
    eventually("B syncs", || b.overlay.get_chain().len() == 4).await;
    assert_eq!(a.overlay.get_chain().len(), 4);
}

#[tokio::test]
async fn five_megabyte_file_streams_intact() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-b").await;

    let bytes: Vec<u8> = (0..5 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect();
    let block = a
        .overlay
        .register_file("big.bin", "/data/big.bin", bytes.clone(), Some("5 MB".into()))
        .await
        .unwrap();
    let file_id = block.payload.file.id.clone();

    b.overlay.connect_to_peer(&a.addr.to_string()).await.unwrap();
    eventually("B learns the file", || b.overlay.find_file(&file_id).is_some()).await;

    let downloaded = b
        .overlay
        .request_file_from_network(&file_id, Duration::from_secs(20))
        .await
        .unwrap();
    assert_eq!(downloaded.len(), bytes.len());
    assert_eq!(content_hash(&downloaded), block.payload.file.content_hash);
    assert_eq!(b.content.get(&file_id).unwrap(), Some(bytes));
}

#[tokio::test]
async fn unknown_file_request_times_out() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-b").await;
    b.overlay.connect_to_peer(&a.addr.to_string()).await.unwrap();
    synced_peers(&b, 1).await;

    let err = b
        .overlay
        .request_file_from_network("does-not-exist", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, P2PError::FileTimeout { .. }));
    assert_eq!(b.overlay.list_peers().len(), 1);
    assert!(a.content.is_empty());
}

#[tokio::test]
async fn malformed_lines_do_not_end_the_session() {
    let a = spawn_node("node-a").await;
    let stream = TcpStream::connect(a.addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let first = lines.next_line().await.unwrap().unwrap();
    let handshake = Message::decode(first.as_bytes()).unwrap();
    assert!(matches!(handshake.payload, Payload::Handshake(ref h) if h.node_id == "node-a"));

    write.write_all(b"{not json}\n").await.unwrap();
    write
        .write_all(b"{\"type\":\"MYSTERY\",\"data\":null}\n")
        .await
        .unwrap();
    let query = Message::new("raw-client", Payload::QueryLatest).encode().unwrap();
    write.write_all(&query).await.unwrap();

    let reply = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply = Message::decode(reply.as_bytes()).unwrap();
    assert_eq!(reply.payload, Payload::ResponseChain(a.overlay.get_chain()));
    assert_eq!(reply.sender, "node-a");
}

#[tokio::test]
async fn connection_failures_are_reported_not_fatal() {
    let a = spawn_node("node-a").await;
    let unused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    assert!(a.overlay.connect_to_peer(&unused.to_string()).await.is_err());

    let b = spawn_node("node-b").await;
    b.overlay.connect_to_peer(&a.addr.to_string()).await.unwrap();
    synced_peers(&a, 1).await;
}

#[tokio::test]
async fn self_connection_is_dropped() {
    let a = spawn_node("node-a").await;
    let _ = a.overlay.connect_to_peer(&a.addr.to_string()).await;
    eventually("self sessions closed", || a.overlay.list_peers().is_empty()).await;
}

#[tokio::test]
async fn stalled_peer_is_dropped_without_blocking_gossip() {
    let a = spawn_node_with("node-a", |config| {
        config.outbound_queue = 4;
        config.send_timeout = Duration::from_millis(200);
    })
    .await;
    let b = spawn_node("node-b").await;

    // Connects but never reads a byte.
    let _stalled = TcpStream::connect(a.addr).await.unwrap();
    b.overlay.connect_to_peer(&a.addr.to_string()).await.unwrap();
    eventually("both peers attached", || a.overlay.list_peers().len() == 2).await;

    // Stale index 0, so B ignores it; large enough to fill socket buffers.
    let padding = FileRecord::new("pad.bin", "/srv/pad.bin", b"pad", "node-a")
        .with_description("x".repeat(128 * 1024));
    let filler = Block::new(0, 0, RegistrationEvent::register(padding), "stale", 0);

    let flood = timeout(Duration::from_secs(30), async {
        for _ in 0..300 {
            a.overlay.broadcast_own_block(&filler).await;
        }
    })
    .await;
    assert!(flood.is_ok(), "broadcast waited on a peer that never reads");
    eventually("stalled peer dropped", || a.overlay.list_peers().len() == 1).await;

    let block = a
        .overlay
        .register_file("after.txt", "/srv/after.txt", b"still flowing".to_vec(), None)
        .await
        .unwrap();
    eventually("B appends", || b.overlay.get_chain().len() == 2).await;
    assert_eq!(b.overlay.find_file(&block.payload.file.id), Some(block));
}

#[tokio::test]
async fn full_chain_response_respects_frame_limit() {
    let a = spawn_node("node-a").await;
    for i in 0..5 {
        a.overlay
            .register_event(event(&format!("bulk-{i}"), b"bulk", "node-a"))
            .await
            .unwrap();
    }

    // The whole chain is one RESPONSE_CHAIN frame, well past 1 KiB.
    let limited = spawn_node_with("node-limited", |config| config.max_frame_bytes = 1024).await;
    limited
        .overlay
        .connect_to_peer(&a.addr.to_string())
        .await
        .unwrap();
    synced_peers(&limited, 1).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(limited.overlay.get_chain().len(), 1);
    assert_eq!(limited.overlay.list_peers().len(), 1, "oversized frame must not end the session");

    // Default config has no frame limit, so resync ships the chain whole.
    assert_eq!(OverlayConfig::default().max_frame_bytes, 0);
    let open = spawn_node("node-open").await;
    open.overlay
        .connect_to_peer(&a.addr.to_string())
        .await
        .unwrap();
    eventually("unlimited node syncs", || open.overlay.get_chain().len() == 6).await;
    assert_eq!(open.overlay.get_chain(), a.overlay.get_chain());
}
