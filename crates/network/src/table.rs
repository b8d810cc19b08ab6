use std::sync::Arc;

use p2pmux_core::{P2pConn, PeerId};
use parking_lot::Mutex;

/// The connection table, a copy-on-write list of live connections.
///
/// Readers take a [`snapshot`](Self::snapshot) and iterate it without holding the lock,
/// writers copy the list only when a snapshot is still alive.
#[derive(Default, Clone)]
pub struct ConnTable {
    conns: Arc<Mutex<Arc<Vec<P2pConn>>>>,
}

impl ConnTable {
    /// Returns the current connections.
    pub fn snapshot(&self) -> Arc<Vec<P2pConn>> {
        self.conns.lock().clone()
    }

    /// Insert `conn`, returns false if it's already in the table.
    pub fn insert(&self, conn: P2pConn) -> bool {
        let mut conns = self.conns.lock();

        if conns.contains(&conn) {
            return false;
        }

        Arc::make_mut(&mut conns).push(conn);

        true
    }

    /// Remove `conn`, returns false if it's not in the table.
    pub fn remove(&self, conn: &P2pConn) -> bool {
        let mut conns = self.conns.lock();

        if let Some(index) = conns.iter().position(|c| c == conn) {
            Arc::make_mut(&mut conns).remove(index);
            true
        } else {
            false
        }
    }

    /// Find one connection to `peer_id`.
    pub fn find(&self, peer_id: &PeerId) -> Option<P2pConn> {
        self.snapshot()
            .iter()
            .find(|conn| conn.peer_id().ok().as_ref() == Some(peer_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
