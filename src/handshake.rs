//! HTTP upgrade handshake
//!
//! The engine treats the handshake as a collaborator behind the
//! [`Handshake`] trait: it receives the raw request bytes up to and
//! including the blank line, writes the complete HTTP response into a
//! buffer, and returns a status. Anything other than
//! [`HandshakeStatus::Ok`] rejects the peer, but the response is written
//! back in both cases.
//!
//! [`Rfc6455Handshake`] is the default implementation.

use std::panic::{self, AssertUnwindSafe};

use base64::Engine;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::WS_GUID;
use crate::error::{Error, Result};
use crate::server::panic_message;

/// Terminator of the HTTP request head
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Outcome of a handshake, expressed as an HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Upgrade accepted (101 Switching Protocols)
    Ok,
    /// Malformed or incomplete upgrade request
    BadRequest,
    /// Method other than GET
    MethodNotAllowed,
    /// Unsupported `Sec-WebSocket-Version`
    UpgradeRequired,
    /// Request head larger than the configured limit
    RequestHeaderFieldsTooLarge,
    /// The handshake collaborator panicked
    InternalServerError,
}

impl HandshakeStatus {
    /// HTTP status code
    pub fn code(&self) -> u16 {
        match self {
            HandshakeStatus::Ok => 101,
            HandshakeStatus::BadRequest => 400,
            HandshakeStatus::MethodNotAllowed => 405,
            HandshakeStatus::UpgradeRequired => 426,
            HandshakeStatus::RequestHeaderFieldsTooLarge => 431,
            HandshakeStatus::InternalServerError => 500,
        }
    }

    /// HTTP reason phrase
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeStatus::Ok => "Switching Protocols",
            HandshakeStatus::BadRequest => "Bad Request",
            HandshakeStatus::MethodNotAllowed => "Method Not Allowed",
            HandshakeStatus::UpgradeRequired => "Upgrade Required",
            HandshakeStatus::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            HandshakeStatus::InternalServerError => "Internal Server Error",
        }
    }

    /// Whether the upgrade was accepted
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, HandshakeStatus::Ok)
    }
}

/// Handshake collaborator
///
/// Implementations must write a complete HTTP response into `reply` for
/// every outcome.
pub trait Handshake: Send + Sync + 'static {
    /// Validate `request` and produce the response
    fn handshake(&self, request: &[u8], reply: &mut BytesMut) -> HandshakeStatus;
}

/// WebSocket upgrade request (server-side)
#[derive(Debug)]
pub struct HandshakeRequest<'a> {
    /// The request path
    pub path: &'a str,
    /// The Host header
    pub host: Option<&'a str>,
    /// The Sec-WebSocket-Key header
    pub key: &'a str,
    /// The Sec-WebSocket-Protocol header (optional)
    pub protocol: Option<&'a str>,
    /// The Origin header (optional)
    pub origin: Option<&'a str>,
}

/// Parse a WebSocket upgrade request
///
/// Returns the parsed request and the number of bytes consumed, or
/// `Ok(None)` if the request head is incomplete. Errors carry the status
/// the peer should be answered with.
pub fn parse_request(
    buf: &[u8],
) -> std::result::Result<Option<(HandshakeRequest<'_>, usize)>, HandshakeStatus> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(HandshakeStatus::RequestHeaderFieldsTooLarge);
        }
        Err(_) => return Err(HandshakeStatus::BadRequest),
    };

    if req.method != Some("GET") {
        return Err(HandshakeStatus::MethodNotAllowed);
    }
    if req.version != Some(1) {
        return Err(HandshakeStatus::BadRequest);
    }

    let mut key = None;
    let mut version = None;
    let mut host = None;
    let mut protocol = None;
    let mut origin = None;
    let mut upgrade = false;
    let mut connection_upgrade = false;

    for header in req.headers.iter() {
        let value =
            std::str::from_utf8(header.value).map_err(|_| HandshakeStatus::BadRequest)?;

        if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.trim());
        } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
            version = Some(value.trim());
        } else if header.name.eq_ignore_ascii_case("sec-websocket-protocol") {
            protocol = Some(value);
        } else if header.name.eq_ignore_ascii_case("host") {
            host = Some(value);
        } else if header.name.eq_ignore_ascii_case("origin") {
            origin = Some(value);
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade |= value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("websocket"));
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_upgrade |= value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        }
    }

    if !upgrade || !connection_upgrade {
        return Err(HandshakeStatus::BadRequest);
    }

    let key = key.ok_or(HandshakeStatus::BadRequest)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| HandshakeStatus::BadRequest)?;
    if decoded.len() != 16 {
        return Err(HandshakeStatus::BadRequest);
    }

    match version {
        Some("13") => {}
        Some(_) => return Err(HandshakeStatus::UpgradeRequired),
        None => return Err(HandshakeStatus::BadRequest),
    }

    Ok(Some((
        HandshakeRequest {
            path: req.path.unwrap_or("/"),
            host,
            key,
            protocol,
            origin,
        },
        len,
    )))
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Write a 101 upgrade response
pub fn build_response(reply: &mut BytesMut, accept_key: &str, protocol: Option<&str>) {
    reply.reserve(160);
    reply.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    reply.put_slice(b"Upgrade: websocket\r\n");
    reply.put_slice(b"Connection: Upgrade\r\n");
    reply.put_slice(b"Sec-WebSocket-Accept: ");
    reply.put_slice(accept_key.as_bytes());
    reply.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        reply.put_slice(b"Sec-WebSocket-Protocol: ");
        reply.put_slice(proto.as_bytes());
        reply.put_slice(b"\r\n");
    }

    reply.put_slice(b"\r\n");
}

/// Write an error response for a rejected upgrade
pub fn build_rejection(reply: &mut BytesMut, status: HandshakeStatus) {
    reply.reserve(128);
    reply.put_slice(format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason()).as_bytes());

    match status {
        HandshakeStatus::UpgradeRequired => {
            reply.put_slice(b"Upgrade: websocket\r\n");
            reply.put_slice(b"Sec-WebSocket-Version: 13\r\n");
        }
        HandshakeStatus::MethodNotAllowed => reply.put_slice(b"Allow: GET\r\n"),
        _ => {}
    }

    reply.put_slice(b"Connection: close\r\n");
    reply.put_slice(b"Content-Length: 0\r\n");
    reply.put_slice(b"\r\n");
}

/// RFC 6455 opening handshake
///
/// Optionally negotiates a subprotocol: the first protocol offered by the
/// client that appears in the supported list is echoed back.
#[derive(Debug, Clone, Default)]
pub struct Rfc6455Handshake {
    protocols: Vec<String>,
}

impl Rfc6455Handshake {
    /// Accept upgrades without subprotocol negotiation
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept upgrades and negotiate one of the given subprotocols
    pub fn with_protocols<I, P>(protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
        }
    }

    fn select_protocol<'a>(&self, offered: Option<&'a str>) -> Option<&'a str> {
        offered?
            .split(',')
            .map(str::trim)
            .find(|candidate| self.protocols.iter().any(|p| p == candidate))
    }
}

impl Handshake for Rfc6455Handshake {
    fn handshake(&self, request: &[u8], reply: &mut BytesMut) -> HandshakeStatus {
        let req = match parse_request(request) {
            Ok(Some((req, _))) => req,
            Ok(None) => {
                build_rejection(reply, HandshakeStatus::BadRequest);
                return HandshakeStatus::BadRequest;
            }
            Err(status) => {
                build_rejection(reply, status);
                return status;
            }
        };

        debug!(path = req.path, host = ?req.host, origin = ?req.origin, "upgrade request");

        let accept_key = generate_accept_key(req.key);
        build_response(reply, &accept_key, self.select_protocol(req.protocol));
        HandshakeStatus::Ok
    }
}

/// Locate the end of the request head, returning its length
#[inline]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
}

/// Perform the server side of the handshake on `stream`
///
/// Reads until the blank line, runs the collaborator, writes its response
/// and returns any bytes the client sent past the request head. Those
/// belong to the first frame and must seed the frame decoder.
pub async fn server_handshake<S, H>(
    stream: &mut S,
    handshaker: &H,
    max_request_size: usize,
) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handshake + ?Sized,
{
    let mut buf = BytesMut::with_capacity(1024);

    let head_len = loop {
        if let Some(len) = find_header_end(&buf) {
            break len;
        }

        if buf.len() >= max_request_size {
            let status = HandshakeStatus::RequestHeaderFieldsTooLarge;
            let mut reply = BytesMut::new();
            build_rejection(&mut reply, status);
            stream.write_all(&reply).await?;
            stream.flush().await?;
            return Err(Error::HandshakeFailed(status));
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    };

    let request = buf.split_to(head_len);
    let mut reply = BytesMut::with_capacity(256);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handshaker.handshake(&request, &mut reply)
    }));
    let status = match outcome {
        Ok(status) => status,
        Err(payload) => {
            error!(panic = panic_message(payload.as_ref()), "handshake handler panicked");
            let status = HandshakeStatus::InternalServerError;
            reply.clear();
            build_rejection(&mut reply, status);
            status
        }
    };

    stream.write_all(&reply).await?;
    stream.flush().await?;

    if !status.is_ok() {
        return Err(Error::HandshakeFailed(status));
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn run(handshake: &Rfc6455Handshake, request: &[u8]) -> (HandshakeStatus, String) {
        let mut reply = BytesMut::new();
        let status = handshake.handshake(request, &mut reply);
        (status, String::from_utf8(reply.to_vec()).unwrap())
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let accept = generate_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_request() {
        let (req, len) = parse_request(UPGRADE).unwrap().unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.host, Some("server.example.com"));
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(req.protocol, Some("chat, superchat"));
        assert_eq!(len, UPGRADE.len());
    }

    #[test]
    fn test_parse_request_partial() {
        let request = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\n";
        assert!(parse_request(request).unwrap().is_none());
    }

    #[test]
    fn test_accepts_upgrade() {
        let (status, reply) = run(&Rfc6455Handshake::new(), UPGRADE);
        assert!(status.is_ok());
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(reply.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!reply.contains("Sec-WebSocket-Protocol"));
        assert!(reply.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_negotiates_protocol() {
        let handshake = Rfc6455Handshake::with_protocols(["superchat"]);
        let (status, reply) = run(&handshake, UPGRADE);
        assert!(status.is_ok());
        assert!(reply.contains("Sec-WebSocket-Protocol: superchat\r\n"));
    }

    #[test]
    fn test_rejects_wrong_method() {
        let request = b"POST /chat HTTP/1.1\r\nHost: a\r\n\r\n";
        let (status, reply) = run(&Rfc6455Handshake::new(), request);
        assert_eq!(status, HandshakeStatus::MethodNotAllowed);
        assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(reply.contains("Allow: GET\r\n"));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let request = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 8\r\n\
            \r\n";
        let (status, reply) = run(&Rfc6455Handshake::new(), request);
        assert_eq!(status, HandshakeStatus::UpgradeRequired);
        assert!(reply.contains("Sec-WebSocket-Version: 13\r\n"));
    }

    #[test]
    fn test_rejects_missing_upgrade_and_bad_key() {
        let request = b"GET / HTTP/1.1\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        assert_eq!(run(&Rfc6455Handshake::new(), request).0, HandshakeStatus::BadRequest);

        let request = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: c2hvcnQ=\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        assert_eq!(run(&Rfc6455Handshake::new(), request).0, HandshakeStatus::BadRequest);
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[tokio::test]
    async fn test_server_handshake_keeps_leftover() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut request = UPGRADE.to_vec();
        request.extend_from_slice(&[0x81, 0x80, 1, 2, 3, 4]);
        client.write_all(&request).await.unwrap();

        let leftover = server_handshake(&mut server, &Rfc6455Handshake::new(), 8192)
            .await
            .unwrap();
        assert_eq!(leftover.as_ref(), &[0x81, 0x80, 1, 2, 3, 4]);

        let mut reply = vec![0u8; 512];
        let n = client.read(&mut reply).await.unwrap();
        assert!(reply[..n].starts_with(b"HTTP/1.1 101"));
    }

    #[tokio::test]
    async fn test_server_handshake_rejects_oversized_head() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&[b'a'; 300]).await.unwrap();

        let err = server_handshake(&mut server, &Rfc6455Handshake::new(), 256)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::HandshakeFailed(HandshakeStatus::RequestHeaderFieldsTooLarge)
        ));

        let mut reply = vec![0u8; 512];
        let n = client.read(&mut reply).await.unwrap();
        assert!(reply[..n].starts_with(b"HTTP/1.1 431"));
    }

    struct Exploding;

    impl Handshake for Exploding {
        fn handshake(&self, _request: &[u8], reply: &mut BytesMut) -> HandshakeStatus {
            reply.put_slice(b"HTTP/1.1 1");
            panic!("handshake blew up");
        }
    }

    #[tokio::test]
    async fn test_server_handshake_survives_panicking_handshaker() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(UPGRADE).await.unwrap();

        let err = server_handshake(&mut server, &Exploding, 8192)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::HandshakeFailed(HandshakeStatus::InternalServerError)
        ));

        // The partial reply is discarded in favour of a complete 500
        let mut reply = vec![0u8; 512];
        let n = client.read(&mut reply).await.unwrap();
        let reply = std::str::from_utf8(&reply[..n]).unwrap();
        assert!(reply.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(reply.ends_with("\r\n\r\n"));
    }
}
