//! End-to-end exercises over real sockets: one listener serving
//! HTTP/1.1, the h2c upgrade into HTTP/2, and the WebSocket handshake.

use std::io::Read as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use torii::Server;
use torii::core::graceful::Shutdown;
use torii::core::listener::AcceptPool;
use torii::core::{RuntimeContext, ServerConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: std::net::SocketAddr,
    _shutdown: Shutdown,
    _root: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let root = tempfile::tempdir().unwrap();

    // 500 bytes of html for the compression scenario.
    let mut index = String::from("<html><body>");
    while index.len() < 493 {
        index.push('x');
    }
    index.push_str("</body>");
    assert_eq!(index.len(), 500);
    std::fs::write(root.path().join("index.html"), &index).unwrap();

    // 1 MiB of patterned binary for the range scenario.
    let large: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.path().join("large.bin"), &large).unwrap();

    let config = ServerConfig {
        listen_port: 0,
        bind_address: "127.0.0.1".into(),
        initial_user_connection: 4,
        max_user_connection: 8,
        buffer_size: 128 * 1024,
        root_path: root.path().to_path_buf(),
        temp_file_path: root.path().to_path_buf(),
        server_name: "torii-e2e".into(),
        time_wait_seconds: 1,
        ..ServerConfig::default()
    };

    let ctx = Arc::new(RuntimeContext::new(config).unwrap());
    let pool = AcceptPool::bind(ctx.config()).unwrap();
    let addr = pool.local_addr();

    let server = Arc::new(Server::new(ctx).unwrap());
    let shutdown = Shutdown::no_signal();
    shutdown.spawn_task_fn(move |guard| async move {
        let _ = server.serve_on(pool, guard).await;
    });

    TestServer {
        addr,
        _shutdown: shutdown,
        _root: root,
    }
}

/// Reads a full response head (through the blank line), returning
/// (head, leftover bytes already read past it).
async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut collected = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut byte))
            .await
            .expect("head read timed out")
            .unwrap();
        assert!(n > 0, "eof before end of head");
        collected.push(byte[0]);
        if collected.ends_with(b"\r\n\r\n") {
            return (String::from_utf8(collected).unwrap(), Vec::new());
        }
    }
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut body = vec![0u8; len];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut body))
        .await
        .expect("body read timed out")
        .unwrap();
    body
}

#[tokio::test]
async fn get_html_with_gzip_negotiation() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert_eq!(header_value(&head, "content-encoding").as_deref(), Some("gzip"));
    assert_eq!(header_value(&head, "connection").as_deref(), Some("keep-alive"));

    let len: usize = header_value(&head, "content-length").unwrap().parse().unwrap();
    let body = read_exact_len(&mut stream, len).await;

    let mut unpacked = Vec::new();
    flate2::read::GzDecoder::new(&body[..])
        .read_to_end(&mut unpacked)
        .unwrap();
    assert_eq!(unpacked.len(), 500);
    assert!(unpacked.starts_with(b"<html><body>"));

    // Keep-alive: a second request on the same connection answers.
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let (head2, _) = read_head(&mut stream).await;
    assert!(head2.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header_value(&head2, "content-length").as_deref(), Some("500"));
}

#[tokio::test]
async fn ranged_get_on_a_large_binary() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"GET /large.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=100-199\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"), "head: {head}");
    assert_eq!(
        header_value(&head, "content-range").as_deref(),
        Some("bytes 100-199/1048576")
    );
    assert_eq!(header_value(&head, "content-length").as_deref(), Some("100"));

    let body = read_exact_len(&mut stream, 100).await;
    let expected: Vec<u8> = (100..200u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(body, expected);
}

#[tokio::test]
async fn missing_file_is_a_404_page() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"GET /gone.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(header_value(&head, "connection").as_deref(), Some("close"));
}

/// Reads one h2 frame: (type, flags, stream_id, payload).
async fn read_h2_frame(stream: &mut TcpStream) -> (u8, u8, u32, Vec<u8>) {
    let mut head = [0u8; 9];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut head))
        .await
        .expect("frame head timed out")
        .unwrap();
    let len = ((head[0] as usize) << 16) | ((head[1] as usize) << 8) | head[2] as usize;
    let stream_id =
        u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & !(1 << 31);
    let payload = read_exact_len(stream, len).await;
    (head[3], head[4], stream_id, payload)
}

#[tokio::test]
async fn h2c_upgrade_serves_the_request_on_stream_one() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(
            b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: Upgrade, HTTP2-Settings\r\n\
              Upgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, _) = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "head: {head}");
    assert_eq!(header_value(&head, "upgrade").as_deref(), Some("h2c"));

    // Continue in HTTP/2: preface + our (empty) SETTINGS.
    stream
        .write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n")
        .await
        .unwrap();
    stream
        .write_all(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut saw_settings = false;
    let mut data_total = 0usize;
    loop {
        let (kind, flags, stream_id, payload) = read_h2_frame(&mut stream).await;
        match kind {
            0x4 => saw_settings = true, // SETTINGS / ACK
            0x1 => {
                assert_eq!(stream_id, 1, "response HEADERS ride stream 1");
                assert_eq!(flags & 0x4, 0x4, "END_HEADERS expected");
            }
            0x0 => {
                assert_eq!(stream_id, 1);
                data_total += payload.len();
                if flags & 0x1 == 0x1 {
                    break; // END_STREAM
                }
            }
            other => panic!("unexpected frame type {other}"),
        }
    }
    assert!(saw_settings);
    assert_eq!(data_total, 500, "cumulative DATA equals the file size");
}

#[tokio::test]
async fn websocket_handshake_and_echo() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, _) = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "head: {head}");
    assert_eq!(
        header_value(&head, "sec-websocket-accept").as_deref(),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );

    // Masked text frame "hi" from the client.
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81, 0x82];
    frame.extend_from_slice(&mask);
    frame.push(b'h' ^ mask[0]);
    frame.push(b'i' ^ mask[1]);
    stream.write_all(&frame).await.unwrap();

    // Echo comes back unmasked.
    let mut reply_head = [0u8; 2];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut reply_head))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(reply_head[0], 0x81);
    assert_eq!(reply_head[1], 0x02, "unmasked, length 2");
    let payload = read_exact_len(&mut stream, 2).await;
    assert_eq!(&payload, b"hi");

    // Close echoes close.
    let mut close = vec![0x88, 0x80];
    close.extend_from_slice(&mask);
    stream.write_all(&close).await.unwrap();
    let mut close_reply = [0u8; 2];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut close_reply))
        .await
        .expect("close reply timed out")
        .unwrap();
    assert_eq!(close_reply[0], 0x88);
}
