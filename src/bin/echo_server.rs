//! Echo server
//!
//! Echoes every Text and Binary message back to its sender. Suitable for
//! running the Autobahn fuzzing client against (fragmentation and ping
//! cases are expected to fail).
//!
//! Usage: `echo-server [ADDR]` (default `127.0.0.1:9001`).
//! Logging follows `RUST_LOG`, e.g. `RUST_LOG=ws_engine=debug`.
//! Close stdin (Ctrl-D) to stop.

use std::io::{self, Read};
use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;
use ws_engine::{Config, Event, Server, ServerHandle};

fn main() -> ws_engine::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("127.0.0.1:9001")
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let config = Config::builder()
        .max_backpressure(64 * 1024 * 1024)
        .build();

    let mut server = Server::bind(addr, config, |server: &ServerHandle, event: Event| {
        match event {
            Event::NewConnection { id } => info!(conn = %id, "client connected"),
            Event::Message {
                id,
                payload,
                binary,
            } => server.send(id, payload, binary),
            Event::Disconnect { id, reason } => info!(conn = %id, %reason, "client disconnected"),
        }
    })?;

    info!(addr = %server.local_addr(), "echo server ready, close stdin to stop");

    let mut discard = Vec::new();
    io::stdin().read_to_end(&mut discard)?;

    server.stop();
    Ok(())
}
