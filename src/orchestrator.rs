//! Server logic running on the I/O thread
//!
//! The [`Orchestrator`] owns the connection registry and the application's
//! event handler. It reacts to two inputs: commands posted through a
//! [`ServerHandle`] and completions posted by I/O tasks. Every connection
//! state change happens here, on a single thread, so the handler observes
//! events in a consistent order.
//!
//! The [`Acceptor`] runs the upgrade for each accepted socket in its own
//! task and reports successful handshakes back as completions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::Config;
use crate::connection::{Completion, CompletionSender, ConnectionEvent};
use crate::error::Error;
use crate::event::{DisconnectReason, Event, EventHandler};
use crate::frame::{Frame, OpCode, ServerFrame};
use crate::handshake::{Handshake, server_handshake};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::server::ServerHandle;

/// Requests posted to the I/O thread
#[derive(Debug)]
pub(crate) enum Command {
    Send { id: ConnectionId, frame: ServerFrame },
    Drop { id: ConnectionId },
    Stop,
}

/// Runs the upgrade for accepted sockets
pub(crate) struct Acceptor<S> {
    completions: CompletionSender<S>,
    handshaker: Arc<dyn Handshake>,
    max_request_size: usize,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl<S> Clone for Acceptor<S> {
    fn clone(&self) -> Self {
        Self {
            completions: self.completions.clone(),
            handshaker: Arc::clone(&self.handshaker),
            max_request_size: self.max_request_size,
            timeout: self.timeout,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    /// Token cancelled when the server starts stopping
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Start the upgrade for a freshly accepted socket
    ///
    /// Must be called from within a `LocalSet`. Rejected or failed
    /// handshakes close the socket and produce no event.
    pub(crate) fn on_accept(&self, stream: S) {
        let acceptor = self.clone();
        tokio::task::spawn_local(acceptor.handshake(stream));
    }

    async fn handshake(self, mut stream: S) {
        let upgrade = server_handshake(&mut stream, &*self.handshaker, self.max_request_size);
        let timeout = self.timeout;

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                trace!("handshake abandoned at shutdown");
                return;
            }
            result = async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, upgrade)
                        .await
                        .unwrap_or(Err(Error::HandshakeTimeout)),
                    None => upgrade.await,
                }
            } => result,
        };

        match result {
            Ok(leftover) => {
                let _ = self.completions.send(Completion::Handshake { stream, leftover });
            }
            Err(e) if e.is_disconnect() => debug!(error = %e, "peer left during handshake"),
            Err(e) => warn!(error = %e, "handshake failed"),
        }
    }
}

/// Event loop state for one server
pub(crate) struct Orchestrator<S, H> {
    registry: ConnectionRegistry<S>,
    handler: H,
    server: ServerHandle,
    completions: UnboundedReceiver<Completion<S>>,
    acceptor: Acceptor<S>,
    /// Disconnects decided by `begin_stop` and not yet delivered
    pending: VecDeque<Event>,
    commands_open: bool,
    stopping: bool,
}

impl<S, H> Orchestrator<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
    H: EventHandler,
{
    pub(crate) fn new(
        config: &Config,
        handshaker: Arc<dyn Handshake>,
        handler: H,
        server: ServerHandle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let acceptor = Acceptor {
            completions: tx.clone(),
            handshaker,
            max_request_size: config.max_handshake_size,
            timeout: config.handshake_timeout(),
            shutdown: CancellationToken::new(),
        };

        Self {
            registry: ConnectionRegistry::new(config.clone(), tx),
            handler,
            server,
            completions: rx,
            acceptor,
            pending: VecDeque::new(),
            commands_open: true,
            stopping: false,
        }
    }

    /// Handle used by the accept loop to hand over sockets
    pub(crate) fn acceptor(&self) -> Acceptor<S> {
        self.acceptor.clone()
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &ConnectionRegistry<S> {
        &self.registry
    }

    /// Process commands and completions until stopped and drained
    ///
    /// Must run inside a `LocalSet`. Re-entering after a panic unwound out
    /// of the event handler resumes with the state left behind.
    pub(crate) async fn run(&mut self, commands: &mut UnboundedReceiver<Command>) {
        loop {
            self.flush_pending();
            if self.stopping && self.registry.is_empty() {
                break;
            }

            tokio::select! {
                command = commands.recv(), if self.commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        self.commands_open = false;
                        self.begin_stop();
                    }
                },
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                else => break,
            }
        }
        debug!("event loop finished");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { id, frame } => match self.registry.find(id) {
                Some(conn) => {
                    if let Some(event) = conn.send_frame(frame) {
                        self.on_connection_event(id, event);
                    }
                }
                None => trace!(conn = %id, "send to unknown connection ignored"),
            },
            Command::Drop { id } => self.drop_connection(id, DisconnectReason::Dropped),
            Command::Stop => self.begin_stop(),
        }
    }

    fn on_completion(&mut self, completion: Completion<S>) {
        match completion {
            Completion::Handshake { stream, leftover } => self.register(stream, leftover),
            Completion::Io { id, io } => {
                let Some(conn) = self.registry.find(id) else {
                    return;
                };
                if let Some(event) = conn.on_io_complete(io) {
                    self.on_connection_event(id, event);
                }
            }
        }
    }

    fn on_connection_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame(frame) => self.dispatch(id, frame),
            ConnectionEvent::NeedsTeardown(reason) => self.drop_connection(id, reason),
        }
    }

    fn register(&mut self, stream: S, leftover: BytesMut) {
        if self.stopping {
            debug!("discarding connection upgraded during shutdown");
            return;
        }

        let id = self.registry.create(stream, leftover);
        info!(conn = %id, live = self.registry.len(), "connection established");
        self.emit(Event::NewConnection { id });
    }

    fn dispatch(&mut self, id: ConnectionId, frame: Frame) {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                let binary = frame.opcode == OpCode::Binary;
                self.emit(Event::Message {
                    id,
                    payload: frame.payload,
                    binary,
                });
            }
            opcode => warn!(conn = %id, ?opcode, "ignoring unhandled frame"),
        }
    }

    /// Close a connection, report it once and release it when idle
    fn drop_connection(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(conn) = self.registry.find(id) else {
            return;
        };

        let newly_closed = conn.close();
        if conn.is_reclaimable() {
            self.registry.erase(id);
        }

        if newly_closed {
            info!(conn = %id, %reason, live = self.registry.len(), "connection closed");
            self.emit(Event::Disconnect { id, reason });
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.acceptor.shutdown.cancel();

        let closed = self.registry.close_all();
        info!(connections = closed.len(), "stopping server");

        let idle: Vec<_> = closed
            .iter()
            .copied()
            .filter(|id| self.registry.get(*id).is_some_and(|c| c.is_reclaimable()))
            .collect();
        for id in idle {
            self.registry.erase(id);
        }

        self.pending.extend(closed.into_iter().map(|id| Event::Disconnect {
            id,
            reason: DisconnectReason::Shutdown,
        }));
        self.flush_pending();
    }

    /// Deliver queued events
    ///
    /// Each event leaves the queue before the handler sees it, so a panic
    /// loses only that one and the rest go out when the loop is re-entered.
    fn flush_pending(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            self.emit(event);
        }
    }

    fn emit(&mut self, event: Event) {
        self.handler.on_event(&self.server, event);
    }
}
