use std::sync::Arc;

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use p2pmux_core::{
    BoxTransport, ConnHandler, Error, Multiaddr, P2pConn, PeerId, Result, Transport,
};

use crate::ConnTable;

/// `ConnectionManager` maintains the live connections of one node,
/// and provides the entry to listen on local addresses or connect to peers.
///
/// You should use [`ConnectionManagerBuilder`] to configure and build the `ConnectionManager` instance.
#[derive(Clone)]
pub struct ConnectionManager {
    immutable_manager: Arc<ImmutableManager>,
}

struct ImmutableManager {
    /// Registered transports.
    transports: Vec<BoxTransport>,
    /// The application's handler of established connections.
    handler: Option<ConnHandler>,
    /// Live connections, inbound and outbound.
    conn_table: ConnTable,
}

impl ImmutableManager {
    /// Select the first transport that can handle the `addr`.
    fn transport_of_multiaddr(&self, addr: &Multiaddr) -> Option<&BoxTransport> {
        self.transports
            .iter()
            .find(|transport| transport.handles(addr))
    }
}

impl ConnectionManager {
    /// Returns a snapshot of live connections.
    pub fn connections(&self) -> Arc<Vec<P2pConn>> {
        self.immutable_manager.conn_table.snapshot()
    }

    /// Returns the connection table.
    pub fn conn_table(&self) -> &ConnTable {
        &self.immutable_manager.conn_table
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.immutable_manager.conn_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.immutable_manager.conn_table.is_empty()
    }

    /// Test if any registered transport handles the `addr`.
    pub fn supports(&self, addr: &Multiaddr) -> bool {
        self.immutable_manager
            .transport_of_multiaddr(addr)
            .is_some()
    }

    /// Create a new connection to `peer_id`, or return the existing one.
    ///
    /// Each of `raddrs` is dialed by the first transport that handles it, addresses without
    /// a transport are skipped. All dials run concurrently, the first established connection
    /// wins and the remaining dials are dropped.
    ///
    /// Returns [`Error::NoRoute`] if no transport handles any address, or
    /// [`Error::DialFailed`] with every dial error if all dials failed.
    pub async fn connect(&self, peer_id: &PeerId, raddrs: &[Multiaddr]) -> Result<P2pConn> {
        // we already have a connection for this peer, short circuit.
        if let Some(conn) = self.immutable_manager.conn_table.find(peer_id) {
            log::trace!("{:?}, reuse connection to {}", conn, peer_id);
            return Ok(conn);
        }

        let handler = self.hooked_handler();

        let mut dials = raddrs
            .iter()
            .filter_map(|raddr| {
                self.immutable_manager
                    .transport_of_multiaddr(raddr)
                    .map(|transport| (raddr, transport))
            })
            .map(|(raddr, transport)| {
                let handler = handler.clone();

                async move { (raddr, transport.dial(raddr, handler).await) }
            })
            .collect::<FuturesUnordered<_>>();

        if dials.is_empty() {
            log::error!("connect to {}, no transport handles {:?}", peer_id, raddrs);
            return Err(Error::NoRoute);
        }

        let mut errors = vec![];

        while let Some((raddr, result)) = dials.next().await {
            match result {
                Ok(conn) => {
                    log::debug!("{:?}, connected to {} via {}", conn, peer_id, raddr);

                    track_connection(&self.immutable_manager.conn_table, &conn);

                    return Ok(conn);
                }
                Err(err) => {
                    log::debug!("dial {} with error: {}", raddr, err);
                    errors.push(err);
                }
            }
        }

        Err(Error::DialFailed(errors))
    }

    /// Start listening on `laddr`, accepted connections are tracked and passed to the
    /// connection handler.
    ///
    /// Returns [`Error::TransportNotSupported`] without invoking any transport,
    /// if no transport handles `laddr`.
    pub async fn listen(&self, laddr: &Multiaddr) -> Result<()> {
        let transport = self.transport_or_err(laddr)?;

        transport.listen(laddr, self.hooked_handler()).await?;

        log::info!("listener {}, started", laddr);

        Ok(())
    }

    /// Stop listening on `laddr`.
    pub async fn unlisten(&self, laddr: &Multiaddr) -> Result<()> {
        let transport = self.transport_or_err(laddr)?;

        transport.unlisten(laddr).await?;

        log::info!("listener {}, stopped", laddr);

        Ok(())
    }

    /// Close one connection. It leaves the connection table once its close signal fires.
    pub async fn disconnect(&self, conn: &P2pConn) -> Result<()> {
        conn.close().await
    }

    /// Close every transport, then every tracked connection.
    ///
    /// Both phases run to completion, the first error is returned afterwards.
    pub async fn close(&self) -> Result<()> {
        let transport_results = join_all(
            self.immutable_manager
                .transports
                .iter()
                .map(|transport| transport.close()),
        )
        .await;

        let conns = self.connections();

        let conn_results = join_all(conns.iter().map(|conn| conn.close())).await;

        for result in transport_results {
            result?;
        }

        for result in conn_results {
            result?;
        }

        Ok(())
    }
}

impl ConnectionManager {
    fn transport_or_err(&self, addr: &Multiaddr) -> Result<&BoxTransport> {
        self.immutable_manager
            .transport_of_multiaddr(addr)
            .ok_or_else(|| Error::TransportNotSupported(addr.clone()))
    }

    /// Wraps the application's handler, tracking every connection it sees.
    fn hooked_handler(&self) -> ConnHandler {
        let conn_table = self.immutable_manager.conn_table.clone();
        let handler = self.immutable_manager.handler.clone();

        Arc::new(move |conn: P2pConn| {
            track_connection(&conn_table, &conn);

            if let Some(handler) = &handler {
                handler(conn);
            }
        })
    }
}

/// Put `conn` into the table and remove it when its close signal fires.
///
/// Returns false if the connection was already tracked.
fn track_connection(conn_table: &ConnTable, conn: &P2pConn) -> bool {
    if !conn_table.insert(conn.clone()) {
        return false;
    }

    log::trace!("{:?}, tracked", conn);

    let conn_table = conn_table.clone();
    let weak = conn.downgrade();

    conn.on_close(move || {
        if let Some(conn) = weak.upgrade() {
            if conn_table.remove(&conn) {
                log::trace!("{:?}, closed and untracked", conn);
            }
        }
    });

    true
}

/// A builder pattern implementation for [`ConnectionManager`] type.
#[derive(Default)]
pub struct ConnectionManagerBuilder {
    transports: Vec<BoxTransport>,
    handler: Option<ConnHandler>,
}

impl ConnectionManagerBuilder {
    /// Create a [`ConnectionManager`] builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new transport provider for the manager.
    ///
    /// Transports are matched in registration order, the first one that handles an address wins.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    /// Set the handler invoked with every established connection, inbound or outbound.
    pub fn connection_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(P2pConn) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Consume the `builder` and generate a new [`ConnectionManager`] instance.
    pub fn create(self) -> ConnectionManager {
        if self.transports.is_empty() {
            log::warn!("ConnectionManager created without any transport.");
        }

        for transport in &self.transports {
            transport.initialize();
        }

        ConnectionManager {
            immutable_manager: Arc::new(ImmutableManager {
                transports: self.transports,
                handler: self.handler,
                conn_table: Default::default(),
            }),
        }
    }
}
