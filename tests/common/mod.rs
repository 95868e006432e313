//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::EnvFilter;
use ws_engine::frame::{OpCode, encode_frame};
use ws_engine::{Config, Event, Server, ServerHandle};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const UPGRADE: &str = "GET / HTTP/1.1\r\n\
    Host: 127.0.0.1\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\
    \r\n";

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// Payload that makes the test handler panic
pub const PANIC_TRIGGER: &[u8] = b"panic please";

/// Route engine logs to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a server on an ephemeral port whose handler echoes every message
/// and forwards every event to the returned channel
pub fn start_echo_server(config: Config) -> (Server, UnboundedReceiver<Event>) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        config,
        move |server: &ServerHandle, event: Event| {
            if let Event::Message { id, payload, binary } = &event {
                if payload.as_ref() == PANIC_TRIGGER {
                    panic!("handler asked to panic");
                }
                server.send(*id, payload.clone(), *binary);
            }
            let _ = tx.send(event);
        },
    )
    .unwrap();
    (server, rx)
}

/// Start a server whose handler only records events
pub fn start_recording_server(config: Config) -> (Server, UnboundedReceiver<Event>) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        config,
        move |_: &ServerHandle, event: Event| {
            let _ = tx.send(event);
        },
    )
    .unwrap();
    (server, rx)
}

pub async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Events already delivered, without waiting
pub fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Minimal WebSocket client speaking raw frames
pub struct TestClient {
    pub stream: TcpStream,
}

impl TestClient {
    /// Connect and complete the upgrade
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with(addr, &[]).await
    }

    /// Connect, sending `extra` in the same write as the upgrade request
    pub async fn connect_with(addr: SocketAddr, extra: &[u8]) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = UPGRADE.as_bytes().to_vec();
        request.extend_from_slice(extra);
        stream.write_all(&request).await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(
            head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "unexpected reply: {}",
            head
        );
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        Self { stream }
    }

    pub async fn send(&mut self, opcode: OpCode, payload: &[u8]) {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, true, Some(MASK));
        self.send_raw(&buf).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Read one server frame as (first header byte, payload)
    pub async fn recv(&mut self) -> (u8, Vec<u8>) {
        tokio::time::timeout(TIMEOUT, async {
            let b0 = self.stream.read_u8().await?;
            let b1 = self.stream.read_u8().await?;
            assert_eq!(b1 & 0x80, 0, "server frames must not be masked");
            let len = match b1 & 0x7F {
                126 => self.stream.read_u16().await? as usize,
                127 => self.stream.read_u64().await? as usize,
                n => n as usize,
            };
            let mut payload = vec![0u8; len];
            self.stream.read_exact(&mut payload).await?;
            Ok::<_, std::io::Error>((b0, payload))
        })
        .await
        .expect("timed out waiting for a frame")
        .expect("read failed")
    }

    /// Read until the server closes the stream, returning what arrived
    pub async fn read_to_close(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        tokio::time::timeout(TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .expect("server did not close the stream")
            .ok();
        rest
    }
}

/// Read an HTTP response head byte by byte so no frame bytes are consumed
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
    })
    .await
    .expect("timed out reading the response head");
    String::from_utf8(head).unwrap()
}
