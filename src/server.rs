//! Server lifecycle
//!
//! [`Server::bind`] binds the listener, then starts the I/O thread: a
//! current-thread tokio runtime running a `LocalSet` with the accept loop
//! and the [`Orchestrator`] event loop. All connection state lives on that
//! thread.
//!
//! Other threads interact through [`ServerHandle`], which only posts
//! commands. A panic escaping the event handler unwinds out of the event
//! loop; the I/O thread logs it and re-enters the loop with its state
//! intact.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::LocalSet;
use tracing::{debug, error, info, trace};

use crate::Config;
use crate::error::Result;
use crate::event::EventHandler;
use crate::frame::{OpCode, ServerFrame};
use crate::handshake::{Handshake, Rfc6455Handshake};
use crate::orchestrator::{Acceptor, Command, Orchestrator};
use crate::registry::ConnectionId;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Thread-safe handle to a running server
///
/// Cloneable and usable from any thread, including from inside the event
/// handler. Every method only queues a command for the I/O thread; calls
/// made after the server stopped are ignored.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
}

impl ServerHandle {
    pub(crate) fn new(commands: UnboundedSender<Command>, stopped: Arc<AtomicBool>) -> Self {
        Self { commands, stopped }
    }

    /// Send a Text (`binary == false`) or Binary frame to a connection
    ///
    /// Frames to the same connection go out in call order. Unknown or
    /// closed connections are ignored.
    pub fn send(&self, id: ConnectionId, payload: impl Into<Bytes>, binary: bool) {
        let opcode = if binary { OpCode::Binary } else { OpCode::Text };
        self.post(Command::Send {
            id,
            frame: ServerFrame::new(opcode, payload),
        });
    }

    /// Close a connection
    ///
    /// Produces a `Disconnect` event unless the connection is already
    /// closed. Dropping an unknown connection is a no-op.
    pub fn drop(&self, id: ConnectionId) {
        self.post(Command::Drop { id });
    }

    /// Ask the server to stop without waiting for it
    ///
    /// Safe to call from the event handler. [`Server::stop`] still joins
    /// the I/O thread.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.post(Command::Stop);
    }

    /// Whether a stop has been requested
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!("I/O thread gone, command discarded");
        }
    }
}

/// A running WebSocket server
///
/// Dropping the server stops it.
#[derive(Debug)]
pub struct Server {
    handle: ServerHandle,
    local_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `addr` and start serving with the default RFC 6455 handshake
    pub fn bind<H>(addr: SocketAddr, config: Config, handler: H) -> Result<Self>
    where
        H: EventHandler,
    {
        Self::bind_with(addr, config, Rfc6455Handshake::new(), handler)
    }

    /// Bind `addr` and start serving with a custom handshake
    ///
    /// Binding and runtime setup happen on the calling thread, so their
    /// errors are returned here.
    pub fn bind_with<K, H>(
        addr: SocketAddr,
        config: Config,
        handshaker: K,
        handler: H,
    ) -> Result<Self>
    where
        K: Handshake,
        H: EventHandler,
    {
        let listener = bind_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = ServerHandle::new(commands_tx, Arc::new(AtomicBool::new(false)));

        let worker = IoWorker {
            runtime,
            listener,
            config: config.clone(),
            handshaker: Arc::new(handshaker),
            handler,
            handle: handle.clone(),
            commands: commands_rx,
        };
        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || worker.run())?;

        info!(addr = %local_addr, thread = %config.thread_name, "WebSocket server listening");

        Ok(Self {
            handle,
            local_addr,
            worker: Some(worker),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for sending and dropping from other threads
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }

    /// Stop the server and wait for the I/O thread to exit
    ///
    /// Closes the listener, abandons pending handshakes and closes every
    /// connection; each one gets its `Disconnect` event before this
    /// returns. Must not be called from the event handler. Calling it
    /// again is a no-op.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.handle.request_stop();
        if worker.join().is_err() {
            error!("I/O thread panicked");
        }
        info!(addr = %self.local_addr, "WebSocket server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the I/O thread owns
struct IoWorker<H> {
    runtime: Runtime,
    listener: std::net::TcpListener,
    config: Config,
    handshaker: Arc<dyn Handshake>,
    handler: H,
    handle: ServerHandle,
    commands: UnboundedReceiver<Command>,
}

impl<H: EventHandler> IoWorker<H> {
    fn run(self) {
        let IoWorker {
            runtime,
            listener,
            config,
            handshaker,
            handler,
            handle,
            mut commands,
        } = self;

        let local = LocalSet::new();
        let mut orchestrator: Orchestrator<TcpStream, H> =
            Orchestrator::new(&config, handshaker, handler, handle);
        local.spawn_local(accept_loop(listener, orchestrator.acceptor(), config.nodelay));

        loop {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                runtime.block_on(local.run_until(orchestrator.run(&mut commands)))
            }));

            match result {
                Ok(()) => break,
                Err(payload) => error!(
                    panic = panic_message(payload.as_ref()),
                    "event loop panicked, restarting"
                ),
            }
        }

        debug!("I/O thread exiting");
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    acceptor: Acceptor<TcpStream>,
    nodelay: bool,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to register listener");
            return;
        }
    };
    let shutdown = acceptor.shutdown_token().clone();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        if nodelay {
            stream.set_nodelay(true).ok();
        }
        debug!(%peer, "accepted");
        acceptor.on_accept(stream);
    }

    debug!("listener closed");
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
