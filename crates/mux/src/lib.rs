//! Stream multiplexing over one ordered, bidirectional connection.
//!
//! Relying on a single message stream between two peers blocks applications on one another:
//! one protocol exchange has to finish before the next one can use the connection.
//! The [`Multiplexer`] splits one physical connection into many logical [`MuxStream`]s,
//! each with its own open / half-close / reset lifecycle, so that protocols running on top
//! think they're the only ones using the connection.
//!
//! The wire codec is not part of this crate. The connection runtime decodes frames into
//! [`MuxEvent`]s and feeds them to [`Multiplexer::on_event`]; outbound traffic leaves through
//! the [`MuxProtocol`] hooks. [`FrameProtocol`] is a ready-made protocol that emits
//! [`MuxEvent`] frames on a channel, leaving byte encoding to the runtime.
//!
//! All stream table mutations happen on the connection's execution context, which is
//! whoever owns the [`Multiplexer`] value. Application handles ([`MuxControl`], [`MuxStream`])
//! only enqueue commands, executed by [`Multiplexer::run_pending`] or [`Multiplexer::drive`].

use std::io;

mod id;
pub use id::*;

mod frame;
pub use frame::*;

mod stream;
pub use stream::*;

mod mux;
pub use mux::*;

/// The multiplexer error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Channel with id {0} not opened")]
    ChannelNotOpened(StreamId),

    #[error("Illegal state: inbound stream handler is not set up yet")]
    InboundHandlerNotSet,

    #[error("Can't create a new stream: connection was closed")]
    ConnectionClosed,

    #[error("Connection is not active yet, stream({0}) can't be created")]
    ConnectionNotActive(StreamId),

    #[error("The peer opened stream({0}) twice")]
    DuplicateStream(StreamId),

    #[error("The id generator returned stream({0}), which is still open")]
    StreamIdInUse(StreamId),

    #[error("Write to stream({0}) was rejected by the protocol")]
    WriteRejected(StreamId),

    #[error("The write half of stream({0}) has already been closed")]
    WriteClosed(StreamId),

    #[error("The stream({0}) has already been closed")]
    StreamClosed(StreamId),

    #[error("Multiplexing protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns true if this error was caused by the peer breaking the multiplexing protocol.
    ///
    /// Lifecycle errors like [`Error::ConnectionClosed`] are not protocol violations.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ChannelNotOpened(_) | Error::DuplicateStream(_) | Error::Protocol(_)
        )
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::ConnectionClosed => io::Error::new(io::ErrorKind::NotConnected, value),
            Error::StreamClosed(_) | Error::WriteClosed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, value)
            }
            _ => io::Error::new(io::ErrorKind::Other, value),
        }
    }
}

/// Type alias of [`std::result::Result<T,Error>`]
pub type Result<T> = std::result::Result<T, Error>;
