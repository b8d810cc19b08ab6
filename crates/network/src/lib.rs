//! The connection manager of one node.
//!
//! [`ConnectionManager`] keeps the table of live connections, races dials over every
//! transport able to reach a peer, and reuses an existing connection when the peer is
//! already connected.

mod table;
pub use table::*;

mod manager;
pub use manager::*;
