//! End-to-end transfers between a real server and client over loopback.

use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rdt_core::client::{Client, ClientConfig, ClientError};
use rdt_core::packet::{ErrorCode, Flags, Packet};
use rdt_core::server::{Server, ServerConfig};
use rdt_core::{ProtocolKind, Shutdown};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

struct TestServer {
    addr: SocketAddr,
    storage_dir: PathBuf,
    shutdown: Shutdown,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shut_down();
    }
}

fn scratch_dir(tag: &str) -> PathBuf {
    let suffix: String = SmallRng::from_entropy()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let dir = std::env::temp_dir().join(format!("rdt-test-{tag}-{suffix}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn start_server(tag: &str) -> TestServer {
    let storage_dir = scratch_dir(tag);
    let shutdown = Shutdown::new();
    let config = ServerConfig {
        bind: ([127, 0, 0, 1], 0).into(),
        storage_dir: storage_dir.clone(),
        ..Default::default()
    };
    let server = Server::bind(config, shutdown.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    TestServer {
        addr,
        storage_dir,
        shutdown,
    }
}

fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn connect(server: &TestServer, protocol: ProtocolKind) -> Client {
    Client::connect(ClientConfig::new(server.addr, protocol))
        .await
        .unwrap()
}

#[tokio::test]
async fn clean_upload_stop_and_wait() -> anyhow::Result<()> {
    let server = start_server("upload-sw").await;
    let source_dir = scratch_dir("upload-sw-src");
    let source = source_dir.join("hello.txt");
    tokio::fs::write(&source, b"hi").await?;

    let client = connect(&server, ProtocolKind::StopAndWait).await;
    let sent = client.upload(&source, "hello.txt").await?;
    assert_eq!(sent, 2);
    assert!(client.close().await?, "expected a FIN|ACK");

    let stored = tokio::fs::read(server.storage_dir.join("hello.txt")).await?;
    assert_eq!(stored, b"hi");
    Ok(())
}

#[tokio::test]
async fn stop_and_wait_upload_spans_multiple_chunks() -> anyhow::Result<()> {
    // Four chunks, so the sequence space walks 0, 1, 0, 1: the frames at
    // sequence 1 must be delivered like any others, not mistaken for
    // operation-packet replays.
    let server = start_server("upload-sw-multi").await;
    let source_dir = scratch_dir("upload-sw-multi-src");
    let contents = patterned_bytes(3 * 1024 + 512);
    let source = source_dir.join("chunky.bin");
    tokio::fs::write(&source, &contents).await?;

    let client = connect(&server, ProtocolKind::StopAndWait).await;
    let sent = client.upload(&source, "chunky.bin").await?;
    assert_eq!(sent, contents.len() as u64);
    client.close().await?;

    let stored = tokio::fs::read(server.storage_dir.join("chunky.bin")).await?;
    assert_eq!(stored, contents);
    Ok(())
}

#[tokio::test]
async fn upload_is_byte_exact_across_many_chunks() -> anyhow::Result<()> {
    let server = start_server("upload-sr").await;
    let source_dir = scratch_dir("upload-sr-src");
    let contents = patterned_bytes(50 * 1024 + 37);
    let source = source_dir.join("blob.bin");
    tokio::fs::write(&source, &contents).await?;

    let client = connect(&server, ProtocolKind::SelectiveRepeat).await;
    let sent = client.upload(&source, "blob.bin").await?;
    assert_eq!(sent, contents.len() as u64);
    client.close().await?;

    let stored = tokio::fs::read(server.storage_dir.join("blob.bin")).await?;
    assert_eq!(stored, contents);
    Ok(())
}

#[tokio::test]
async fn download_honors_destination_directory() -> anyhow::Result<()> {
    let server = start_server("download-sw").await;
    let contents = patterned_bytes(3 * 1024 + 5);
    tokio::fs::write(server.storage_dir.join("report.pdf"), &contents).await?;

    let dest_dir = scratch_dir("download-sw-dst");
    let client = connect(&server, ProtocolKind::StopAndWait).await;
    let received = client.download("report.pdf", Some(&dest_dir)).await?;
    assert_eq!(received, contents.len() as u64);
    client.close().await?;

    let fetched = tokio::fs::read(dest_dir.join("report.pdf")).await?;
    assert_eq!(fetched, contents);
    Ok(())
}

#[tokio::test]
async fn download_selective_repeat_round_trip() -> anyhow::Result<()> {
    let server = start_server("download-sr").await;
    let contents = patterned_bytes(64 * 1024);
    tokio::fs::write(server.storage_dir.join("big.bin"), &contents).await?;

    let dest = scratch_dir("download-sr-dst").join("copy.bin");
    let client = connect(&server, ProtocolKind::SelectiveRepeat).await;
    let received = client.download("big.bin", Some(&dest)).await?;
    assert_eq!(received, contents.len() as u64);
    client.close().await?;

    assert_eq!(tokio::fs::read(&dest).await?, contents);
    Ok(())
}

#[tokio::test]
async fn download_of_missing_file_reports_error_003() -> anyhow::Result<()> {
    let server = start_server("missing").await;
    let dest_dir = scratch_dir("missing-dst");

    let client = connect(&server, ProtocolKind::StopAndWait).await;
    let error = client
        .download("nowhere.txt", Some(&dest_dir))
        .await
        .unwrap_err();
    match error {
        ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("expected a server error, got {other:?}"),
    }

    // No temp or final file may be left behind.
    let mut entries = tokio::fs::read_dir(&dest_dir).await?;
    assert!(entries.next_entry().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn upload_replaces_existing_file_atomically() -> anyhow::Result<()> {
    let server = start_server("replace").await;
    let source_dir = scratch_dir("replace-src");

    let first = patterned_bytes(2048);
    let source = source_dir.join("v1.bin");
    tokio::fs::write(&source, &first).await?;
    let client = connect(&server, ProtocolKind::SelectiveRepeat).await;
    client.upload(&source, "data.bin").await?;
    client.close().await?;

    let second = patterned_bytes(4096 + 9);
    let source = source_dir.join("v2.bin");
    tokio::fs::write(&source, &second).await?;
    let client = connect(&server, ProtocolKind::SelectiveRepeat).await;
    client.upload(&source, "data.bin").await?;
    client.close().await?;

    let stored = tokio::fs::read(server.storage_dir.join("data.bin")).await?;
    assert_eq!(stored, second);

    // The temp file was renamed away, not left beside the final file.
    let mut entries = tokio::fs::read_dir(&server.storage_dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["data.bin"]);
    Ok(())
}

#[tokio::test]
async fn concurrent_clients_transfer_in_parallel() -> anyhow::Result<()> {
    let server = start_server("concurrent").await;
    let download_contents = patterned_bytes(20 * 1024);
    tokio::fs::write(server.storage_dir.join("shared.bin"), &download_contents).await?;

    let upload_contents = patterned_bytes(30 * 1024 + 1);
    let source_dir = scratch_dir("concurrent-src");
    let source = source_dir.join("incoming.bin");
    tokio::fs::write(&source, &upload_contents).await?;

    let uploader = connect(&server, ProtocolKind::SelectiveRepeat).await;
    let downloader = connect(&server, ProtocolKind::StopAndWait).await;
    let dest = scratch_dir("concurrent-dst").join("shared.bin");

    let (uploaded, downloaded) = tokio::join!(
        uploader.upload(&source, "incoming.bin"),
        downloader.download("shared.bin", Some(&dest)),
    );
    assert_eq!(uploaded?, upload_contents.len() as u64);
    assert_eq!(downloaded?, download_contents.len() as u64);
    uploader.close().await?;
    downloader.close().await?;

    assert_eq!(
        tokio::fs::read(server.storage_dir.join("incoming.bin")).await?,
        upload_contents
    );
    assert_eq!(tokio::fs::read(&dest).await?, download_contents);
    Ok(())
}

async fn exchange(socket: &UdpSocket, buf: &mut [u8], frame: Packet) -> anyhow::Result<Packet> {
    socket.send(&frame.encode()).await?;
    let len = timeout(Duration::from_secs(2), socket.recv(buf)).await??;
    Ok(Packet::decode(&buf[..len])?)
}

/// Drives the wire protocol by hand: SYN, the operation packet, one data
/// frame, a duplicate of it, and FIN, checking the literal replies.
#[tokio::test]
async fn raw_handshake_upload_and_teardown() -> anyhow::Result<()> {
    let server = start_server("raw").await;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server.addr).await?;
    let mut buf = [0u8; 2048];

    // SYN -> SYN|ACK
    let reply = exchange(&socket, &mut buf, Packet::syn()).await?;
    assert_eq!(reply.flags, Flags::SYN | Flags::ACK);

    // Operation packet at seq 1 -> ACK 1
    let operation = Packet::data(1, b"UPLOAD:hello.txt:stop_and_wait".to_vec());
    let reply = exchange(&socket, &mut buf, operation).await?;
    assert!(reply.flags.ack());
    assert_eq!(reply.ack_number, 1);

    // DATA(0, "hi") -> ACK 0
    let reply = exchange(&socket, &mut buf, Packet::data(0, b"hi".to_vec())).await?;
    assert!(reply.flags.ack());
    assert_eq!(reply.ack_number, 0);

    // A retransmit of the same frame is re-acknowledged, not re-written.
    let reply = exchange(&socket, &mut buf, Packet::data(0, b"hi".to_vec())).await?;
    assert!(reply.flags.ack());
    assert_eq!(reply.ack_number, 0);

    // FIN(100) -> FIN|ACK(101), and the upload lands.
    let reply = exchange(&socket, &mut buf, Packet::fin(100)).await?;
    assert_eq!(reply.flags, Flags::FIN | Flags::ACK);
    assert_eq!(reply.sequence_number, 101);

    let stored = tokio::fs::read(server.storage_dir.join("hello.txt")).await?;
    assert_eq!(stored, b"hi");
    Ok(())
}

/// Frames whose digest does not match are dropped with no reply at all.
#[tokio::test]
async fn corrupted_frames_are_ignored() -> anyhow::Result<()> {
    let server = start_server("corrupt").await;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server.addr).await?;
    let mut buf = [0u8; 2048];

    let mut frame = Packet::syn().encode();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    socket.send(&frame).await?;
    assert!(
        timeout(Duration::from_millis(500), socket.recv(&mut buf))
            .await
            .is_err(),
        "server must stay silent on integrity failure"
    );

    // The session is unharmed: a clean SYN still connects.
    socket.send(&Packet::syn().encode()).await?;
    let len = timeout(Duration::from_secs(2), socket.recv(&mut buf)).await??;
    let reply = Packet::decode(&buf[..len])?;
    assert_eq!(reply.flags, Flags::SYN | Flags::ACK);
    Ok(())
}

/// A FIN for a session the server no longer has still earns a FIN|ACK, so
/// a client whose first FIN|ACK was lost can finish closing.
#[tokio::test]
async fn fin_is_idempotent() -> anyhow::Result<()> {
    let server = start_server("fin").await;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server.addr).await?;
    let mut buf = [0u8; 2048];

    for _ in 0..2 {
        socket.send(&Packet::fin(100).encode()).await?;
        let len = timeout(Duration::from_secs(2), socket.recv(&mut buf)).await??;
        let reply = Packet::decode(&buf[..len])?;
        assert_eq!(reply.flags, Flags::FIN | Flags::ACK);
        assert_eq!(reply.sequence_number, 101);
    }
    Ok(())
}
