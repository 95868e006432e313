//! Error types for the WebSocket engine

use std::io;

use thiserror::Error;

use crate::frame::FrameError;
use crate::handshake::HandshakeStatus;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
///
/// Per-connection failures never reach the embedding application through
/// this type; they are resolved into a disconnect. `Error` surfaces from
/// server startup and from the handshake and frame helpers.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid WebSocket frame
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    /// Handshake rejected with the given status
    #[error("handshake failed: {} {}", .0.code(), .0.reason())]
    HandshakeFailed(HandshakeStatus),
    /// Handshake did not finish within the configured timeout
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// Peer closed the stream
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether this error is a peer going away rather than a fault
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Close frame status codes (RFC 6455 section 7.4.1)
pub struct CloseCode;

impl CloseCode {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// No status received
    pub const NO_STATUS: u16 = 1005;

    /// Check if the close code may appear on the wire
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::ConnectionClosed.is_disconnect());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_disconnect());
        assert!(!Error::InvalidFrame(FrameError::Unmasked).is_disconnect());
        assert!(!Error::HandshakeTimeout.is_disconnect());
    }

    #[test]
    fn test_display() {
        let e = Error::HandshakeFailed(HandshakeStatus::UpgradeRequired);
        assert_eq!(e.to_string(), "handshake failed: 426 Upgrade Required");

        let e = Error::InvalidFrame(FrameError::Unmasked);
        assert_eq!(e.to_string(), "invalid frame: client frames must be masked");
    }

    #[test]
    fn test_close_codes() {
        assert!(CloseCode::is_valid(CloseCode::NORMAL));
        assert!(CloseCode::is_valid(4000));
        assert!(!CloseCode::is_valid(CloseCode::NO_STATUS));
        assert!(!CloseCode::is_valid(999));
    }
}
