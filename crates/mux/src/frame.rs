use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{Error, MuxProtocol, Result, StreamId};

/// A decoded multiplexing frame.
///
/// Used in both directions: the connection runtime feeds inbound frames to
/// [`Multiplexer::on_event`](crate::Multiplexer::on_event), and [`FrameProtocol`] emits
/// outbound frames with the same shape.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MuxEvent<T> {
    /// Signals the start of a new stream.
    Open(StreamId),
    /// One data unit for the stream.
    Data(StreamId, T),
    /// Performs a half-close of a stream, the sender will not write anymore.
    HalfClose(StreamId),
    /// Reset a stream immediately.
    Reset(StreamId),
}

impl<T> MuxEvent<T> {
    /// Returns the stream id this frame is addressing.
    pub fn stream_id(&self) -> StreamId {
        match self {
            MuxEvent::Open(id)
            | MuxEvent::Data(id, _)
            | MuxEvent::HalfClose(id)
            | MuxEvent::Reset(id) => *id,
        }
    }

    /// Rewrite this frame the way the other end of the connection sees it.
    ///
    /// A frame sent for a locally initiated stream addresses a remotely initiated stream on the
    /// receiving side, see [`StreamId::flip`].
    pub fn flip(self) -> Self {
        match self {
            MuxEvent::Open(id) => MuxEvent::Open(id.flip()),
            MuxEvent::Data(id, data) => MuxEvent::Data(id.flip(), data),
            MuxEvent::HalfClose(id) => MuxEvent::HalfClose(id.flip()),
            MuxEvent::Reset(id) => MuxEvent::Reset(id.flip()),
        }
    }
}

/// A [`MuxProtocol`] that turns stream activity into outbound [`MuxEvent`] frames.
///
/// Stream ids are generated by an incrementing counter and always carry the initiator flag.
/// A local full close is sent to the peer as [`MuxEvent::Reset`].
pub struct FrameProtocol<T> {
    next_outbound_stream_num: u64,
    frames: UnboundedSender<MuxEvent<T>>,
}

impl<T> FrameProtocol<T> {
    /// Create a protocol instance and the receiver of the frames it emits.
    pub fn new() -> (Self, UnboundedReceiver<MuxEvent<T>>) {
        let (frames, receiver) = mpsc::unbounded();

        (
            Self {
                next_outbound_stream_num: 0,
                frames,
            },
            receiver,
        )
    }

    fn send(&self, frame: MuxEvent<T>) -> Result<()> {
        self.frames
            .unbounded_send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn send_control(&self, frame: MuxEvent<T>) {
        let stream_id = frame.stream_id();

        if self.send(frame).is_err() {
            log::trace!("drop control frame of stream({}), frame sink closed", stream_id);
        }
    }
}

impl<T> MuxProtocol for FrameProtocol<T>
where
    T: Send + 'static,
{
    type Data = T;

    fn next_id(&mut self) -> StreamId {
        let stream_id = StreamId::local(self.next_outbound_stream_num);

        self.next_outbound_stream_num += 1;

        stream_id
    }

    fn on_write(&mut self, stream_id: StreamId, data: T) -> Result<bool> {
        self.send(MuxEvent::Data(stream_id, data))?;

        Ok(true)
    }

    fn on_local_open(&mut self, stream_id: StreamId) {
        self.send_control(MuxEvent::Open(stream_id));
    }

    fn on_local_disconnect(&mut self, stream_id: StreamId) {
        self.send_control(MuxEvent::HalfClose(stream_id));
    }

    fn on_local_close(&mut self, stream_id: StreamId) {
        self.send_control(MuxEvent::Reset(stream_id));
    }
}
