use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bitmask_enum::bitmask;
use futures::{
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    StreamExt,
};

use crate::{mux::Command, Error, MuxAddr, Result, StreamId};

/// Events delivered to the consumer of one [`MuxStream`].
///
/// The event stream ends once the stream is fully closed.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent<T> {
    /// One data unit received from peer.
    Data(T),
    /// The peer half-closed the stream, no more data will arrive.
    RemoteWriteClosed,
    /// The peer reset the stream. The stream is fully closed after this event.
    Reset,
}

/// Half close status of a stream.
#[bitmask(u8)]
pub(crate) enum HalfClose {
    /// Received the half-close signal from peer.
    ///
    /// The connection delivers events in order, so no data will follow for this stream.
    Read,
    /// Set when the local side called [`MuxStream::disconnect`].
    Write,
}

/// The stream's registration inside the multiplexer's stream table.
///
/// Dropping the state unregisters the stream: the inbound channel closes and the
/// consumer's [`MuxStream`] reaches end of stream.
pub(crate) struct StreamState<T> {
    stream_id: StreamId,
    half_close: HalfClose,
    inbound: UnboundedSender<StreamEvent<T>>,
}

impl<T> StreamState<T> {
    pub(crate) fn new(stream_id: StreamId, inbound: UnboundedSender<StreamEvent<T>>) -> Self {
        Self {
            stream_id,
            half_close: HalfClose::none(),
            inbound,
        }
    }

    /// Fire one event to the stream consumer.
    pub(crate) fn deliver(&self, event: StreamEvent<T>) {
        if self.inbound.unbounded_send(event).is_err() {
            log::trace!(
                "stream({}) consumer dropped, discard inbound event",
                self.stream_id
            );
        }
    }

    /// Mark the local half closed.
    ///
    /// Returns false if it was already closed.
    pub(crate) fn local_disconnect(&mut self) -> bool {
        if self.half_close.contains(HalfClose::Write) {
            return false;
        }

        self.half_close |= HalfClose::Write;

        true
    }

    /// Mark the remote half closed.
    ///
    /// Returns false if it was already closed.
    pub(crate) fn remote_disconnect(&mut self) -> bool {
        if self.half_close.contains(HalfClose::Read) {
            return false;
        }

        self.half_close |= HalfClose::Read;

        true
    }

    /// Returns true if the [`MuxStream`] reading this registration was dropped.
    pub(crate) fn is_consumer_dropped(&self) -> bool {
        self.inbound.is_closed()
    }

    pub(crate) fn is_write_closed(&self) -> bool {
        self.half_close.contains(HalfClose::Write)
    }

    pub(crate) fn is_both_closed(&self) -> bool {
        self.half_close.contains(HalfClose::Read | HalfClose::Write)
    }
}

/// Application handle of one logical stream.
///
/// Every outbound operation is scheduled onto the owning connection's execution context;
/// inbound data and notifications are read by polling this handle as a
/// [`Stream`](futures::Stream) of [`StreamEvent`].
pub struct MuxStream<T> {
    stream_id: StreamId,
    local_addr: MuxAddr,
    peer_addr: MuxAddr,
    commands: UnboundedSender<Command<T>>,
    inbound: UnboundedReceiver<StreamEvent<T>>,
}

impl<T> std::fmt::Debug for MuxStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mux stream, {} => {}", self.local_addr, self.peer_addr)
    }
}

impl<T> MuxStream<T> {
    pub(crate) fn new(
        stream_id: StreamId,
        local_addr: MuxAddr,
        peer_addr: MuxAddr,
        commands: UnboundedSender<Command<T>>,
        inbound: UnboundedReceiver<StreamEvent<T>>,
    ) -> Self {
        Self {
            stream_id,
            local_addr,
            peer_addr,
            commands,
            inbound,
        }
    }

    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    /// Returns true if this stream was opened by the local side.
    pub fn is_initiator(&self) -> bool {
        self.stream_id.is_initiator()
    }

    /// Local connection address plus stream id.
    pub fn local_addr(&self) -> &MuxAddr {
        &self.local_addr
    }

    /// Peer connection address plus stream id.
    pub fn peer_addr(&self) -> &MuxAddr {
        &self.peer_addr
    }

    /// Write one data unit to the peer.
    ///
    /// Writes on one stream reach the protocol in submission order. The returned future
    /// reports the result for this unit only, a failed unit is dropped.
    pub fn write(&self, data: T) -> impl Future<Output = Result<()>> + Send + 'static
    where
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();

        let sent = self
            .commands
            .unbounded_send(Command::Write {
                stream_id: self.stream_id,
                data,
                reply,
            })
            .is_ok();

        async move {
            if !sent {
                return Err(Error::ConnectionClosed);
            }

            receiver.await.unwrap_or(Err(Error::ConnectionClosed))
        }
    }

    /// Half-close the outbound direction. The stream stays readable until the peer half-closes too.
    pub fn disconnect(&self) {
        self.send_command(Command::Disconnect(self.stream_id));
    }

    /// Fully close the stream, regardless of the half-close state.
    pub fn close(&self) {
        self.send_command(Command::Close(self.stream_id));
    }

    fn send_command(&self, command: Command<T>) {
        if self.commands.unbounded_send(command).is_err() {
            log::trace!("{:?}, connection context is gone", self);
        }
    }
}

impl<T> Drop for MuxStream<T> {
    fn drop(&mut self) {
        // nothing to release once the connection context is gone.
        _ = self.commands.unbounded_send(Command::Release(self.stream_id));
    }
}

impl<T> Unpin for MuxStream<T> {}

impl<T> futures::Stream for MuxStream<T> {
    type Item = StreamEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inbound.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;

    use super::*;

    #[test]
    fn test_half_close_flags() {
        let (sender, _receiver) = mpsc::unbounded::<StreamEvent<()>>();

        let mut state = StreamState::new(StreamId::local(1), sender);

        assert!(!state.is_write_closed());
        assert!(!state.is_both_closed());

        assert!(state.local_disconnect());
        assert!(!state.local_disconnect());
        assert!(state.is_write_closed());
        assert!(!state.is_both_closed());

        assert!(state.remote_disconnect());
        assert!(!state.remote_disconnect());
        assert!(state.is_both_closed());
    }

    #[test]
    fn test_consumer_dropped() {
        let (sender, receiver) = mpsc::unbounded::<StreamEvent<()>>();

        let state = StreamState::new(StreamId::local(1), sender);

        assert!(!state.is_consumer_dropped());

        drop(receiver);

        assert!(state.is_consumer_dropped());
    }

    #[test]
    fn test_drop_state_ends_consumer() {
        let (sender, mut receiver) = mpsc::unbounded();

        let state = StreamState::new(StreamId::remote(1), sender);

        state.deliver(StreamEvent::Data(1u32));

        drop(state);

        assert_eq!(receiver.try_next().unwrap(), Some(StreamEvent::Data(1)));
        assert_eq!(receiver.try_next().unwrap(), None);
    }
}
