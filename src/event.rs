//! Events delivered to the embedding application

use std::fmt;
use std::io;

use bytes::Bytes;

use crate::frame::FrameError;
use crate::registry::ConnectionId;
use crate::server::ServerHandle;

/// Discriminant of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewConnection,
    Message,
    Disconnect,
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer completed the close handshake
    PeerClosed {
        /// Status code from the peer's Close frame
        code: Option<u16>,
    },
    /// The peer closed the TCP stream without a Close frame
    Eof,
    /// The peer sent a frame that violates the protocol
    Protocol(FrameError),
    /// The socket failed
    Transport(io::ErrorKind),
    /// The application asked for the connection to be dropped
    Dropped,
    /// Too many outbound bytes were queued
    Backpressure,
    /// The server is stopping
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed { code: Some(code) } => {
                write!(f, "closed by peer ({})", code)
            }
            DisconnectReason::PeerClosed { code: None } => write!(f, "closed by peer"),
            DisconnectReason::Eof => write!(f, "peer went away"),
            DisconnectReason::Protocol(e) => write!(f, "protocol error: {}", e),
            DisconnectReason::Transport(kind) => write!(f, "transport error: {}", kind),
            DisconnectReason::Dropped => write!(f, "dropped by application"),
            DisconnectReason::Backpressure => write!(f, "send queue over limit"),
            DisconnectReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Something that happened on a connection
///
/// For every connection the application sees exactly one `NewConnection`,
/// then any number of `Message`s, then exactly one `Disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Handshake completed and the connection is registered
    NewConnection { id: ConnectionId },
    /// A Text or Binary frame arrived
    Message {
        id: ConnectionId,
        payload: Bytes,
        binary: bool,
    },
    /// The connection is closed; its id will not appear again
    Disconnect {
        id: ConnectionId,
        reason: DisconnectReason,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewConnection { .. } => EventKind::NewConnection,
            Event::Message { .. } => EventKind::Message,
            Event::Disconnect { .. } => EventKind::Disconnect,
        }
    }

    pub fn id(&self) -> ConnectionId {
        match self {
            Event::NewConnection { id }
            | Event::Message { id, .. }
            | Event::Disconnect { id, .. } => *id,
        }
    }

    /// Message payload; empty for the other kinds
    pub fn payload(&self) -> &[u8] {
        match self {
            Event::Message { payload, .. } => payload,
            _ => &[],
        }
    }

    /// Payload of a Text message as a string, if it is valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Event::Message {
                payload,
                binary: false,
                ..
            } => std::str::from_utf8(payload).ok(),
            _ => None,
        }
    }
}

/// Receives events on the I/O thread
///
/// Handlers run inline on the I/O thread, so they should return quickly.
/// The [`ServerHandle`] lets a handler reply or drop connections; those
/// calls are queued and take effect after the handler returns.
///
/// Any `FnMut(&ServerHandle, Event)` closure is a handler.
pub trait EventHandler: Send + 'static {
    fn on_event(&mut self, server: &ServerHandle, event: Event);
}

impl<F> EventHandler for F
where
    F: FnMut(&ServerHandle, Event) + Send + 'static,
{
    fn on_event(&mut self, server: &ServerHandle, event: Event) {
        self(server, event)
    }
}
