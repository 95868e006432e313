//! Per-connection state and I/O
//!
//! A [`Connection`] owns one upgraded stream, split into a read half and a
//! write half. While the connection is open exactly one read is in flight;
//! at most one write is in flight and further frames wait in a FIFO queue.
//!
//! Reads and writes run as local tasks on the I/O thread. Each task takes
//! ownership of its half (and, for reads, of the frame decoder) together
//! with an [`IoLease`] that marks the operation as outstanding. When the
//! operation ends the task posts an [`IoCompletion`] back to the
//! orchestrator, which hands it to [`Connection::on_io_complete`]. The lease
//! is released there, before any state transition, so a connection is
//! reclaimable exactly when it is closed and no lease is alive.
//!
//! Closing cancels both tasks through a [`CancellationToken`]. The tasks
//! still report back; only then may the registry release the connection.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::rc::Rc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::CloseCode;
use crate::event::DisconnectReason;
use crate::frame::{Frame, FrameError, FrameReceiver, OpCode, ServerFrame};
use crate::registry::ConnectionId;
use crate::{Config, MAX_READ_CHUNK};

/// Work finished on the I/O thread, reported to the orchestrator
pub(crate) enum Completion<S> {
    /// A socket passed the upgrade and can be registered
    Handshake { stream: S, leftover: BytesMut },
    /// A connection's read or write finished
    Io {
        id: ConnectionId,
        io: IoCompletion<S>,
    },
}

pub(crate) type CompletionSender<S> = UnboundedSender<Completion<S>>;

/// A finished read or write, returning the resources the task borrowed
pub(crate) enum IoCompletion<S> {
    Read {
        lease: IoLease,
        reader: ReadHalf<S>,
        receiver: FrameReceiver,
        outcome: ReadOutcome,
    },
    Write {
        lease: IoLease,
        writer: WriteHalf<S>,
        outcome: WriteOutcome,
    },
}

#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Frame(Frame),
    Eof,
    Cancelled,
    Invalid(FrameError),
    Failed(io::Error),
}

#[derive(Debug)]
pub(crate) enum WriteOutcome {
    Done,
    Cancelled,
    Failed(io::Error),
}

/// What the orchestrator must do after a connection changed state
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// A data or control frame to dispatch
    Frame(Frame),
    /// The connection must be closed and, once idle, released
    NeedsTeardown(DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoKind {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct Outstanding {
    reading: Cell<bool>,
    sending: Cell<bool>,
}

impl Outstanding {
    fn flag(&self, kind: IoKind) -> &Cell<bool> {
        match kind {
            IoKind::Read => &self.reading,
            IoKind::Write => &self.sending,
        }
    }
}

/// Marks one read or write as outstanding until dropped
///
/// The lease travels with the task, so it is released whether the task
/// reports back or is torn down with the runtime.
pub(crate) struct IoLease {
    kind: IoKind,
    outstanding: Rc<Outstanding>,
}

impl IoLease {
    fn acquire(outstanding: &Rc<Outstanding>, kind: IoKind) -> Self {
        let flag = outstanding.flag(kind);
        debug_assert!(!flag.get(), "{:?} already outstanding", kind);
        flag.set(true);
        Self {
            kind,
            outstanding: Rc::clone(outstanding),
        }
    }
}

impl Drop for IoLease {
    fn drop(&mut self) {
        self.outstanding.flag(self.kind).set(false);
    }
}

/// One upgraded WebSocket connection
pub struct Connection<S> {
    id: ConnectionId,
    reader: Option<(ReadHalf<S>, FrameReceiver)>,
    writer: Option<WriteHalf<S>>,
    send_queue: VecDeque<ServerFrame>,
    queued_bytes: usize,
    max_backpressure: usize,
    closed: bool,
    /// Set once the peer's Close was answered; teardown follows the flush
    closing: Option<DisconnectReason>,
    outstanding: Rc<Outstanding>,
    cancel: CancellationToken,
    completions: CompletionSender<S>,
}

impl<S> Connection<S> {
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a read is in flight
    #[inline]
    pub fn is_reading(&self) -> bool {
        self.outstanding.reading.get()
    }

    /// Whether a write is in flight
    #[inline]
    pub fn is_sending(&self) -> bool {
        self.outstanding.sending.get()
    }

    /// Closed with no operation in flight; safe to release
    #[inline]
    pub fn is_reclaimable(&self) -> bool {
        self.closed && !self.is_reading() && !self.is_sending()
    }

    /// Frames waiting to be written, including the one in flight
    #[inline]
    pub fn queued_frames(&self) -> usize {
        self.send_queue.len()
    }

    /// Bytes waiting to be written, including the frame in flight
    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Close the connection
    ///
    /// Cancels in-flight operations, releases the stream halves that are
    /// not lent to a task and discards queued frames. Returns `true` only
    /// the first time.
    pub(crate) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.cancel.cancel();
        self.reader = None;
        self.writer = None;
        self.send_queue.clear();
        self.queued_bytes = 0;
        trace!(conn = %self.id, "connection closed");
        true
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    /// Wrap an upgraded stream and start reading
    ///
    /// `leftover` holds bytes received past the handshake. Must be called
    /// from within a `LocalSet`.
    pub(crate) fn open(
        id: ConnectionId,
        stream: S,
        mut leftover: BytesMut,
        config: &Config,
        completions: CompletionSender<S>,
    ) -> Self {
        leftover.reserve(config.read_buffer_size);
        let (reader, writer) = tokio::io::split(stream);

        let mut conn = Self {
            id,
            reader: Some((reader, FrameReceiver::with_leftover(config.max_frame_size, leftover))),
            writer: Some(writer),
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            max_backpressure: config.max_backpressure,
            closed: false,
            closing: None,
            outstanding: Rc::new(Outstanding::default()),
            cancel: CancellationToken::new(),
            completions,
        };
        conn.begin_read();
        conn
    }

    /// Queue a frame for sending
    ///
    /// Frames are written in the order they are queued. Sending to a closed
    /// or closing connection is a no-op. Returns a teardown request when the
    /// queue would exceed the configured backpressure limit.
    pub(crate) fn send_frame(&mut self, frame: ServerFrame) -> Option<ConnectionEvent> {
        if self.closed || self.closing.is_some() {
            trace!(conn = %self.id, "discarding frame for closed connection");
            return None;
        }

        if self.max_backpressure > 0
            && self.queued_bytes + frame.wire_len() > self.max_backpressure
        {
            warn!(
                conn = %self.id,
                queued = self.queued_bytes,
                limit = self.max_backpressure,
                "send queue over limit"
            );
            return Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Backpressure));
        }

        self.enqueue(frame);
        None
    }

    /// Apply the result of a finished read or write
    pub(crate) fn on_io_complete(&mut self, io: IoCompletion<S>) -> Option<ConnectionEvent> {
        match io {
            IoCompletion::Read {
                lease,
                reader,
                receiver,
                outcome,
            } => {
                drop(lease);
                self.on_read_complete(reader, receiver, outcome)
            }
            IoCompletion::Write {
                lease,
                writer,
                outcome,
            } => {
                drop(lease);
                self.on_write_complete(writer, outcome)
            }
        }
    }

    fn on_read_complete(
        &mut self,
        reader: ReadHalf<S>,
        receiver: FrameReceiver,
        outcome: ReadOutcome,
    ) -> Option<ConnectionEvent> {
        if self.closed {
            return Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Dropped));
        }

        match outcome {
            ReadOutcome::Frame(frame) if frame.opcode == OpCode::Close => {
                let code = frame.close_code();
                debug!(conn = %self.id, code = ?code, "close frame received");
                drop(reader);
                self.closing = Some(DisconnectReason::PeerClosed { code });
                self.enqueue(ServerFrame::close(code.filter(|c| CloseCode::is_valid(*c))));
                None
            }
            ReadOutcome::Frame(frame) => {
                self.reader = Some((reader, receiver));
                self.begin_read();
                Some(ConnectionEvent::Frame(frame))
            }
            ReadOutcome::Eof => {
                debug!(conn = %self.id, "peer closed the stream");
                Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Eof))
            }
            ReadOutcome::Cancelled => {
                Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Dropped))
            }
            ReadOutcome::Invalid(e) => {
                warn!(conn = %self.id, error = %e, "invalid frame");
                Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Protocol(e)))
            }
            ReadOutcome::Failed(e) => {
                warn!(conn = %self.id, error = %e, "recv error");
                Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Transport(e.kind())))
            }
        }
    }

    fn on_write_complete(
        &mut self,
        writer: WriteHalf<S>,
        outcome: WriteOutcome,
    ) -> Option<ConnectionEvent> {
        if self.closed {
            return Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Dropped));
        }

        match outcome {
            WriteOutcome::Done => {
                if let Some(frame) = self.send_queue.pop_front() {
                    self.queued_bytes -= frame.wire_len();
                }

                if !self.send_queue.is_empty() {
                    self.begin_write(writer);
                    None
                } else if let Some(reason) = self.closing.clone() {
                    Some(ConnectionEvent::NeedsTeardown(reason))
                } else {
                    self.writer = Some(writer);
                    None
                }
            }
            WriteOutcome::Cancelled => {
                Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Dropped))
            }
            WriteOutcome::Failed(e) => {
                warn!(conn = %self.id, error = %e, "send error");
                Some(ConnectionEvent::NeedsTeardown(DisconnectReason::Transport(e.kind())))
            }
        }
    }

    fn enqueue(&mut self, frame: ServerFrame) {
        self.queued_bytes += frame.wire_len();
        self.send_queue.push_back(frame);

        if self.send_queue.len() == 1 {
            if let Some(writer) = self.writer.take() {
                self.begin_write(writer);
            }
        }
    }

    fn begin_read(&mut self) {
        let Some((mut reader, mut receiver)) = self.reader.take() else {
            return;
        };

        let lease = IoLease::acquire(&self.outstanding, IoKind::Read);
        let cancel = self.cancel.clone();
        let completions = self.completions.clone();
        let id = self.id;

        tokio::task::spawn_local(async move {
            let outcome = read_frame(&mut reader, &mut receiver, &cancel).await;
            let io = IoCompletion::Read {
                lease,
                reader,
                receiver,
                outcome,
            };
            // A closed channel means the loop is gone; the lease drops here
            let _ = completions.send(Completion::Io { id, io });
        });
    }

    fn begin_write(&mut self, mut writer: WriteHalf<S>) {
        let Some(frame) = self.send_queue.front().cloned() else {
            self.writer = Some(writer);
            return;
        };

        let lease = IoLease::acquire(&self.outstanding, IoKind::Write);
        let cancel = self.cancel.clone();
        let completions = self.completions.clone();
        let id = self.id;

        tokio::task::spawn_local(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => WriteOutcome::Cancelled,
                result = write_frame(&mut writer, &frame) => match result {
                    Ok(()) => WriteOutcome::Done,
                    Err(e) => WriteOutcome::Failed(e),
                },
            };
            let io = IoCompletion::Write {
                lease,
                writer,
                outcome,
            };
            let _ = completions.send(Completion::Io { id, io });
        });
    }
}

/// Read until one complete frame is decoded
async fn read_frame<R>(
    reader: &mut R,
    receiver: &mut FrameReceiver,
    cancel: &CancellationToken,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    loop {
        let needed = match receiver.take_frame() {
            Ok(Some(frame)) => return ReadOutcome::Frame(frame),
            Ok(None) => receiver.needed(),
            Err(e) => Err(e),
        };
        let needed = match needed {
            Ok(needed) => needed,
            Err(e) => return ReadOutcome::Invalid(e),
        };

        receiver.buffer_mut().reserve(needed.min(MAX_READ_CHUNK));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            result = reader.read_buf(receiver.buffer_mut()) => match result {
                Ok(0) => return ReadOutcome::Eof,
                Ok(_) => {}
                Err(e) => return ReadOutcome::Failed(e),
            },
        }
    }
}

/// Write one frame; a Close frame also shuts the write side down
async fn write_frame<W>(writer: &mut W, frame: &ServerFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = frame.as_buf();
    writer.write_all_buf(&mut buf).await?;
    if frame.opcode() == OpCode::Close {
        writer.shutdown().await
    } else {
        writer.flush().await
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .field("closing", &self.closing)
            .field("reading", &self.is_reading())
            .field("sending", &self.is_sending())
            .field("queued_frames", &self.send_queue.len())
            .field("queued_bytes", &self.queued_bytes)
            .finish()
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || self.is_reclaimable(),
            "connection {} released while open or with I/O in flight",
            self.id
        );
    }
}
