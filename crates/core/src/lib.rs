mod transport;
pub use transport::*;

mod conn;
pub use conn::*;

mod errors;
pub use errors::*;

pub use identity::PeerId;
pub use multiaddr::Multiaddr;
