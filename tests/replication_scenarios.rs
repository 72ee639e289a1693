//! Black-box scenarios driven against an in-process fake primary over a
//! loopback `TcpListener`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis_replica_stream::{Configuration, Event, EventListener, Replicator};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()) })
    }

    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Reads and discards the handshake commands (`PING`, `REPLCONF
/// listening-port`, `REPLCONF ip-address`, `REPLCONF capa eof`, `REPLCONF
/// capa psync2`), replying `+PONG`/`+OK` to each, then returns the raw
/// `PSYNC` array bytes so the test can inspect the requested offset.
async fn drain_handshake(conn: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let mut total = Vec::new();

    for reply in [&b"+PONG\r\n"[..], b"+OK\r\n", b"+OK\r\n", b"+OK\r\n", b"+OK\r\n"] {
        let n = conn.read(&mut buf).await.unwrap();
        total.extend_from_slice(&buf[..n]);
        conn.write_all(reply).await.unwrap();
    }

    // The next read is the PSYNC command itself.
    let n = conn.read(&mut buf).await.unwrap();
    buf[..n].to_vec()
}

async fn spawn_fake_primary(script: impl FnOnce(TcpStream) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + 'static) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        script(conn).await;
    });

    port
}

#[tokio::test]
async fn cold_start_fullresync_emits_rdb_key_then_precommandsync() {
    let port = spawn_fake_primary(|mut conn| Box::pin(async move {
        drain_handshake(&mut conn).await;

        conn.write_all(b"+FULLRESYNC abc123 100\r\n").await.unwrap();

        // A minimal RDB: magic + version + one string key "k"->"v" + EOF + checksum.
        let mut rdb = Vec::new();
        rdb.extend_from_slice(b"REDIS0011");
        rdb.push(0x00); // value type: string
        rdb.push(0x01);
        rdb.push(b'k');
        rdb.push(0x01);
        rdb.push(b'v');
        rdb.push(0xFF); // EOF
        rdb.extend_from_slice(&[0u8; 8]); // checksum

        conn.write_all(format!("${}\r\n", rdb.len()).as_bytes()).await.unwrap();
        conn.write_all(&rdb).await.unwrap();

        // Keep the connection open briefly so the reader can enter the
        // command loop and emit PreCommandSync before the test inspects it.
        tokio::time::sleep(Duration::from_millis(200)).await;
    })).await;

    let config = Configuration::builder("127.0.0.1", port)
        .connection_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let replicator = Replicator::new(config);
    let listener = RecordingListener::new();
    replicator.add_event_listener(listener.clone());
    replicator.open();

    tokio::time::sleep(Duration::from_millis(300)).await;
    replicator.close().await;

    let events = listener.snapshot();
    assert!(matches!(events.first(), Some(Event::RdbKey(_))), "expected RdbKey first, got {events:?}");
    assert!(
        events.iter().any(|e| matches!(e, Event::PreCommandSync)),
        "expected PreCommandSync, got {events:?}"
    );
}

#[tokio::test]
async fn partial_resync_advances_offset_by_frame_length() {
    let received_ack = Arc::new(AtomicUsize::new(0));
    let received_ack_clone = received_ack.clone();

    let port = spawn_fake_primary(move |mut conn| Box::pin(async move {
        drain_handshake(&mut conn).await;
        conn.write_all(b"+CONTINUE\r\n").await.unwrap();

        let frame = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        conn.write_all(frame).await.unwrap();

        // Give the client a moment, then read whatever heartbeat ACK it sends.
        let mut buf = vec![0u8; 256];
        if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(500), conn.read(&mut buf)).await {
            if n > 0 {
                received_ack_clone.fetch_add(1, Ordering::SeqCst);
            }
        }
    })).await;

    let config = Configuration::builder("127.0.0.1", port)
        .connection_timeout(Duration::from_secs(2))
        .heartbeat_period(Duration::from_millis(100))
        .build()
        .unwrap();

    let replicator = Replicator::new(config);
    let listener = RecordingListener::new();
    replicator.add_event_listener(listener.clone());
    replicator.open();

    tokio::time::sleep(Duration::from_millis(300)).await;
    replicator.close().await;

    let events = listener.snapshot();
    let command = events.iter().find_map(|e| match e {
        Event::Command(cmd) if cmd.name == "SET" => Some(cmd.clone()),
        _ => None,
    });

    assert!(command.is_some(), "expected a SET command event, got {events:?}");
    assert!(received_ack.load(Ordering::SeqCst) >= 1, "expected at least one heartbeat ACK");
}

#[tokio::test]
async fn loading_reply_triggers_retry_without_rdb() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let listener_sock = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener_sock.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut conn, _) = listener_sock.accept().await.unwrap();
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            drain_handshake(&mut conn).await;
            let _ = conn.write_all(b"+LOADING\r\n").await;
            drop(conn);
        }
    });

    let config = Configuration::builder("127.0.0.1", port)
        .connection_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let replicator = Replicator::new(config);
    replicator.open();

    tokio::time::sleep(Duration::from_millis(900)).await;
    replicator.close().await;

    assert!(attempts.load(Ordering::SeqCst) >= 2, "expected at least one reconnect after LOADING");
}

#[tokio::test]
async fn getack_is_answered_with_the_pre_frame_offset() {
    let acked_offset = Arc::new(Mutex::new(None));
    let acked_offset_clone = acked_offset.clone();

    let port = spawn_fake_primary(move |mut conn| Box::pin(async move {
        drain_handshake(&mut conn).await;
        conn.write_all(b"+FULLRESYNC abc123 131\r\n").await.unwrap();

        let mut rdb = Vec::new();
        rdb.extend_from_slice(b"REDIS0011");
        rdb.push(0xFF); // EOF, no keys
        rdb.extend_from_slice(&[0u8; 8]);
        conn.write_all(format!("${}\r\n", rdb.len()).as_bytes()).await.unwrap();
        conn.write_all(&rdb).await.unwrap();

        // GETACK arrives as its own command frame; replOffset is 131 before
        // this frame is counted, so the reply must ack 131, not 131 + this
        // frame's length.
        let getack = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";
        conn.write_all(getack).await.unwrap();

        let mut buf = vec![0u8; 256];
        if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(500), conn.read(&mut buf)).await {
            *acked_offset_clone.lock().unwrap() = Some(String::from_utf8_lossy(&buf[..n]).into_owned());
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    })).await;

    let config = Configuration::builder("127.0.0.1", port)
        .connection_timeout(Duration::from_secs(2))
        .heartbeat_period(Duration::from_secs(60))
        .build()
        .unwrap();

    let replicator = Replicator::new(config);
    replicator.open();

    tokio::time::sleep(Duration::from_millis(300)).await;
    replicator.close().await;

    let reply = acked_offset.lock().unwrap().clone();
    assert_eq!(
        reply.as_deref(),
        Some("*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$3\r\n131\r\n")
    );
}

#[tokio::test]
async fn diskless_fullresync_streams_an_rdb_key_then_the_trailer() {
    let port = spawn_fake_primary(|mut conn| Box::pin(async move {
        drain_handshake(&mut conn).await;
        conn.write_all(b"+FULLRESYNC abc123 0\r\n").await.unwrap();

        let mut rdb = Vec::new();
        rdb.extend_from_slice(b"REDIS0011");
        rdb.push(0x00); // value type: string
        rdb.push(0x01);
        rdb.push(b'k');
        rdb.push(0x01);
        rdb.push(b'v');
        rdb.push(0xFF); // EOF
        rdb.extend_from_slice(&[0u8; 8]); // checksum

        // Disk-less replication: the bulk header carries `-1` instead of a
        // length, and a 40-byte trailer follows the RDB's own EOF+checksum.
        conn.write_all(b"$-1\r\n").await.unwrap();
        conn.write_all(&rdb).await.unwrap();
        conn.write_all(&[0xAB; 40]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
    })).await;

    let config = Configuration::builder("127.0.0.1", port)
        .connection_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let replicator = Replicator::new(config);
    let listener = RecordingListener::new();
    replicator.add_event_listener(listener.clone());
    replicator.open();

    tokio::time::sleep(Duration::from_millis(300)).await;
    replicator.close().await;

    let events = listener.snapshot();
    assert!(matches!(events.first(), Some(Event::RdbKey(_))), "expected RdbKey first, got {events:?}");
    assert!(
        events.iter().any(|e| matches!(e, Event::PreCommandSync)),
        "expected PreCommandSync after the trailer was consumed, got {events:?}"
    );
}

#[tokio::test]
async fn manual_close_stops_the_retry_loop() {
    let port = spawn_fake_primary(|mut conn| Box::pin(async move {
        drain_handshake(&mut conn).await;
        conn.write_all(b"+CONTINUE\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    })).await;

    let config = Configuration::builder("127.0.0.1", port)
        .connection_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let replicator = Replicator::new(config);
    replicator.open();
    tokio::time::sleep(Duration::from_millis(200)).await;

    replicator.close().await;
    assert!(replicator.is_manual_closed());
}
