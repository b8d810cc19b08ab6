use std::{
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Weak},
};

use identity::PeerId;
use multiaddr::Multiaddr;

use crate::{BoxConnection, CloseListener, Result};

/// A type alias of the callback receiving every established connection.
pub type ConnHandler = Arc<dyn Fn(P2pConn) + Send + Sync>;

/// Create a [`ConnHandler`] that passes each connection to all `handlers`, in order.
pub fn broadcast_handler<I>(handlers: I) -> ConnHandler
where
    I: IntoIterator<Item = ConnHandler>,
{
    let handlers = handlers.into_iter().collect::<Vec<_>>();

    Arc::new(move |conn: P2pConn| {
        for handler in &handlers {
            handler(conn.clone());
        }
    })
}

/// P2p connection instance is a wraper of underly transport connection.
///
/// Clones share the same connection; equality and hashing use the connection's identity.
#[derive(Clone)]
pub struct P2pConn {
    conn: Arc<BoxConnection>,
}

impl Debug for P2pConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "p2p connection, {:?} => {:?}",
            self.conn.local_addr().unwrap_or(Multiaddr::empty()),
            self.conn.peer_addr().unwrap_or(Multiaddr::empty())
        )
    }
}

impl PartialEq for P2pConn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl Eq for P2pConn {}

impl Hash for P2pConn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.conn).hash(state)
    }
}

impl P2pConn {
    pub fn new(conn: BoxConnection) -> Self {
        Self {
            conn: Arc::new(conn),
        }
    }

    /// Create a non-owning reference to this connection.
    pub fn downgrade(&self) -> WeakP2pConn {
        WeakP2pConn {
            conn: Arc::downgrade(&self.conn),
        }
    }

    /// returns underly connection's local address.
    pub fn local_addr(&self) -> Result<Multiaddr> {
        Ok(self.conn.local_addr()?)
    }

    /// returns underly connection's peer address.
    pub fn peer_addr(&self) -> Result<Multiaddr> {
        Ok(self.conn.peer_addr()?)
    }

    pub fn peer_id(&self) -> Result<PeerId> {
        Ok(self.conn.peer_id()?)
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.conn.close().await?)
    }

    /// See [`Connection::on_close`].
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let listener: CloseListener = Box::new(listener);

        self.conn.on_close(listener)
    }
}

/// A non-owning reference to a [`P2pConn`].
#[derive(Clone)]
pub struct WeakP2pConn {
    conn: Weak<BoxConnection>,
}

impl WeakP2pConn {
    /// Returns the connection, if it's still alive.
    pub fn upgrade(&self) -> Option<P2pConn> {
        self.conn.upgrade().map(|conn| P2pConn { conn })
    }
}
