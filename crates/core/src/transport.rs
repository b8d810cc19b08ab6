use std::io;

use async_trait::async_trait;
use identity::PeerId;
use multiaddr::Multiaddr;

use crate::{ConnHandler, P2pConn};

/// A type alias of [`Box<dyn Transport>`]
pub type BoxTransport = Box<dyn Transport>;

/// A type alias of [`Box<dyn Connection>`]
pub type BoxConnection = Box<dyn Connection>;

/// A type alias of the callback registered by [`Connection::on_close`].
pub type CloseListener = Box<dyn FnOnce() + Send>;

/// Transport is a facade of one transport layer protocol.
///
/// It provide a entry to create a client-side connection to peer or
/// create a server-side socket to accept incoming connections.
///
/// This type is used as a transport plugin and is usually injected into the `ConnectionManager`,
/// End-users should call ***ConnectionManager-related*** functions to listen or create an outbound connection.
#[async_trait]
pub trait Transport: Sync + Send {
    /// Called once, when the transport is installed.
    fn initialize(&self) {}

    /// Test if this transport support the `addr`.
    fn handles(&self, addr: &Multiaddr) -> bool;

    /// Create a client socket and establish one [`Connection`] to `raddr`.
    ///
    /// The transport must invoke `handler` with the established connection before returning it.
    async fn dial(&self, raddr: &Multiaddr, handler: ConnHandler) -> io::Result<P2pConn>;

    /// Create a server side socket bound on `laddr`, every accepted connection is passed to `handler`.
    async fn listen(&self, laddr: &Multiaddr, handler: ConnHandler) -> io::Result<()>;

    /// Stop the server side socket bound on `laddr`.
    async fn unlisten(&self, laddr: &Multiaddr) -> io::Result<()>;

    /// Stop all listeners and release the transport's resources.
    async fn close(&self) -> io::Result<()>;
}

/// A type that represent a transport layer connection between local and peer.
///
/// You can create the `Connection` by call function [`dial`](Transport::dial) or
/// [`listen`](Transport::listen).
#[async_trait]
pub trait Connection: Sync + Send {
    /// Returns local bind address.
    ///
    /// This can be useful, for example, when binding to port 0 to figure out which port was
    /// actually bound.
    fn local_addr(&self) -> io::Result<Multiaddr>;

    /// Returns the remote address that this connection is connected to.
    fn peer_addr(&self) -> io::Result<Multiaddr>;

    /// Return peer's id obtained from secure layer peer's public key.
    fn peer_id(&self) -> io::Result<PeerId>;

    /// Attempt to close this connection.
    async fn close(&self) -> io::Result<()>;

    /// Register a listener fired once this connection is closed, whichever side closed it.
    ///
    /// If the connection is already closed, `listener` is fired immediately.
    fn on_close(&self, listener: CloseListener);
}
