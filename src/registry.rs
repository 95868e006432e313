//! Connection table
//!
//! Owns every live [`Connection`] and hands out monotonically increasing
//! ids. The registry only mutates from the I/O thread.

use std::collections::HashMap;
use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::Config;
use crate::connection::{CompletionSender, Connection};

/// Identifier of a connection, unique for the lifetime of a server
///
/// Ids start at 1 and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<ConnectionId> for u64 {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// Table of live connections keyed by id
pub struct ConnectionRegistry<S> {
    last_id: u64,
    connections: HashMap<ConnectionId, Connection<S>>,
    config: Config,
    completions: CompletionSender<S>,
}

impl<S> ConnectionRegistry<S> {
    pub(crate) fn new(config: Config, completions: CompletionSender<S>) -> Self {
        Self {
            last_id: 0,
            connections: HashMap::new(),
            config,
            completions,
        }
    }

    /// Look up a live connection
    #[inline]
    pub fn find(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    #[inline]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection<S>> {
        self.connections.get(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all registered connections, in no particular order
    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    /// Remove a connection
    ///
    /// The connection must be closed with no operation in flight.
    pub(crate) fn erase(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(conn) => {
                debug_assert!(conn.is_reclaimable(), "erasing busy connection {}", id);
                trace!(conn = %id, remaining = self.connections.len(), "connection released");
                true
            }
            None => false,
        }
    }

    /// Close every connection without removing any
    ///
    /// Returns the ids that were open until now. Each stays registered
    /// until its in-flight operations report back.
    pub(crate) fn close_all(&mut self) -> Vec<ConnectionId> {
        self.connections
            .iter_mut()
            .filter_map(|(id, conn)| conn.close().then_some(*id))
            .collect()
    }
}

impl<S> ConnectionRegistry<S>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    /// Register an upgraded stream under a fresh id and start reading
    pub(crate) fn create(&mut self, stream: S, leftover: BytesMut) -> ConnectionId {
        self.last_id += 1;
        let id = ConnectionId(self.last_id);
        let conn = Connection::open(id, stream, leftover, &self.config, self.completions.clone());
        self.connections.insert(id, conn);
        trace!(conn = %id, live = self.connections.len(), "connection registered");
        id
    }
}

impl<S> fmt::Debug for ConnectionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("last_id", &self.last_id)
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::task::LocalSet;

    use crate::connection::Completion;

    type Completions = UnboundedReceiver<Completion<DuplexStream>>;

    fn registry() -> (ConnectionRegistry<DuplexStream>, Completions) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionRegistry::new(Config::default(), tx), rx)
    }

    /// Deliver completions until every closed connection is reclaimable
    async fn settle(registry: &mut ConnectionRegistry<DuplexStream>, rx: &mut Completions) {
        let busy = |r: &ConnectionRegistry<DuplexStream>| {
            r.ids()
                .filter_map(|id| r.get(id))
                .any(|c| c.is_closed() && !c.is_reclaimable())
        };
        while busy(registry) {
            if let Some(Completion::Io { id, io }) = rx.recv().await {
                if let Some(conn) = registry.find(id) {
                    conn.on_io_complete(io);
                }
            }
        }
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "#42");
        assert_eq!(u64::from(ConnectionId::new(7)), 7);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_not_reused() {
        LocalSet::new()
            .run_until(async {
                let (mut registry, mut rx) = registry();
                let mut clients = Vec::new();

                let mut ids = Vec::new();
                for _ in 0..3 {
                    let (client, server) = tokio::io::duplex(1024);
                    clients.push(client);
                    ids.push(registry.create(server, BytesMut::new()));
                }
                assert_eq!(ids, [ConnectionId::new(1), ConnectionId::new(2), ConnectionId::new(3)]);
                assert_eq!(registry.len(), 3);

                assert!(registry.find(ids[1]).is_some_and(|c| c.close()));
                settle(&mut registry, &mut rx).await;
                assert!(registry.erase(ids[1]));
                assert!(!registry.erase(ids[1]));
                assert!(registry.find(ids[1]).is_none());

                let (client, server) = tokio::io::duplex(1024);
                clients.push(client);
                assert_eq!(registry.create(server, BytesMut::new()), ConnectionId::new(4));

                registry.close_all();
                settle(&mut registry, &mut rx).await;
                let remaining: Vec<_> = registry.ids().collect();
                for id in remaining {
                    registry.erase(id);
                }
                assert!(registry.is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_close_all_reports_only_newly_closed() {
        LocalSet::new()
            .run_until(async {
                let (mut registry, mut rx) = registry();
                let (_a, server_a) = tokio::io::duplex(1024);
                let (_b, server_b) = tokio::io::duplex(1024);
                let a = registry.create(server_a, BytesMut::new());
                let b = registry.create(server_b, BytesMut::new());

                if let Some(conn) = registry.find(a) {
                    conn.close();
                }
                let closed = registry.close_all();
                assert_eq!(closed, [b]);

                // Still registered until their reads report back
                assert_eq!(registry.len(), 2);
                assert!(registry.close_all().is_empty());

                settle(&mut registry, &mut rx).await;
                assert!(registry.erase(a));
                assert!(registry.erase(b));
            })
            .await;
    }
}
