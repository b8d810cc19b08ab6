use std::fmt::Display;

use multiaddr::Multiaddr;

/// Identifier of one logical stream.
///
/// The `initiator` flag tells which side opened the stream. Ids generated locally always carry
/// `initiator = true` and ids announced by the peer carry `initiator = false`, so the two id
/// spaces never collide even when both sides count from the same number.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct StreamId {
    num: u64,
    initiator: bool,
}

impl StreamId {
    pub fn new(num: u64, initiator: bool) -> Self {
        Self { num, initiator }
    }

    /// Create an id for a stream opened by the local side.
    pub fn local(num: u64) -> Self {
        Self::new(num, true)
    }

    /// Create an id for a stream opened by the peer.
    pub fn remote(num: u64) -> Self {
        Self::new(num, false)
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    /// Returns true if the local side opened this stream.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Returns the same stream id as seen from the other end of the connection.
    pub fn flip(self) -> Self {
        Self {
            num: self.num,
            initiator: !self.initiator,
        }
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.initiator {
            write!(f, "{}:local", self.num)
        } else {
            write!(f, "{}:remote", self.num)
        }
    }
}

/// Synthetic address of one stream: the parent connection's address plus the stream id.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct MuxAddr {
    parent: Multiaddr,
    stream_id: StreamId,
}

impl MuxAddr {
    pub fn new(parent: Multiaddr, stream_id: StreamId) -> Self {
        Self { parent, stream_id }
    }

    /// Address of the underlying connection.
    pub fn parent(&self) -> &Multiaddr {
        &self.parent
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl Display for MuxAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mux[{}-{}]", self.parent, self.stream_id)
    }
}
