use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{select, Either},
    StreamExt,
};
use multiaddr::Multiaddr;

use crate::{
    stream::StreamState, Error, MuxAddr, MuxEvent, MuxStream, Result, StreamEvent, StreamId,
};

/// The number of locally reset stream ids remembered to absorb late frames from the peer.
const RESET_BACKLOG: usize = 256;

/// Callback invoked with every stream the peer opens.
pub type InboundInitializer<T> = Box<dyn FnMut(MuxStream<T>) + Send>;

/// Callback invoked with a locally opened stream, before [`MuxControl::open_stream`] resolves.
pub type OutboundInitializer<T> = Box<dyn FnOnce(&mut MuxStream<T>) + Send>;

/// The concrete multiplexing protocol plugged into a [`Multiplexer`].
///
/// The multiplexer keeps the stream table and the state machines; the protocol decides how
/// ids are generated and how stream activity is put on the wire.
/// Every method is called on the connection's execution context.
pub trait MuxProtocol: Send {
    /// Data unit carried by streams.
    type Data: Send + 'static;

    /// Generate the id of the next locally initiated stream.
    ///
    /// Generated ids must carry the initiator flag and must not repeat an id that is still open.
    fn next_id(&mut self) -> StreamId;

    /// Called once per outbound data unit, in submission order per stream.
    ///
    /// Returns whether the unit was accepted.
    fn on_write(&mut self, stream_id: StreamId, data: Self::Data) -> Result<bool>;

    /// A locally initiated stream was created.
    fn on_local_open(&mut self, stream_id: StreamId);

    /// The local side half-closed the stream.
    fn on_local_disconnect(&mut self, stream_id: StreamId);

    /// The local side fully closed the stream.
    fn on_local_close(&mut self, stream_id: StreamId);

    /// A remotely initiated stream was created and handed to the inbound initializer.
    fn on_remote_created(&mut self, _stream_id: StreamId) {}
}

/// Requests scheduled onto the connection's execution context by application handles.
pub(crate) enum Command<T> {
    Open {
        initializer: OutboundInitializer<T>,
        reply: oneshot::Sender<Result<MuxStream<T>>>,
    },
    Write {
        stream_id: StreamId,
        data: T,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect(StreamId),
    Close(StreamId),
    /// The stream handle was dropped.
    Release(StreamId),
}

/// Connection lifecycle as seen by the multiplexer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ConnState {
    /// No streams allowed, open requests are queued.
    Pending,
    Active,
    /// Terminal.
    Closed,
}

/// A cloneable handle to open outbound streams from any task.
pub struct MuxControl<T> {
    commands: UnboundedSender<Command<T>>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for MuxControl<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> MuxControl<T>
where
    T: Send + 'static,
{
    /// Open a new outbound stream.
    ///
    /// The stream is created once the connection is active. `initializer` is called with the
    /// registered stream before the returned future resolves.
    ///
    /// Fails with [`Error::ConnectionClosed`] if the connection is closed now, or closes before
    /// the request is served.
    pub fn open_stream<F>(&self, initializer: F) -> impl Future<Output = Result<MuxStream<T>>>
    where
        F: FnOnce(&mut MuxStream<T>) + Send + 'static,
    {
        let request = self.request_open(Box::new(initializer));

        async move { request?.await.unwrap_or(Err(Error::ConnectionClosed)) }
    }

    /// Open a new outbound stream without initializer.
    pub fn open(&self) -> impl Future<Output = Result<MuxStream<T>>> {
        self.open_stream(|_| {})
    }

    /// Returns true once the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn request_open(
        &self,
        initializer: OutboundInitializer<T>,
    ) -> Result<oneshot::Receiver<Result<MuxStream<T>>>> {
        // if already closed the execution context may never run the request.
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, receiver) = oneshot::channel();

        self.commands
            .unbounded_send(Command::Open { initializer, reply })
            .map_err(|_| Error::ConnectionClosed)?;

        Ok(receiver)
    }
}

/// The stream multiplexer of one physical connection.
///
/// This value is the connection's execution context: the runtime that owns it delivers
/// lifecycle signals and decoded frames through `&mut self` methods, and executes the
/// commands queued by [`MuxControl`] and [`MuxStream`] handles with
/// [`run_pending`](Self::run_pending) or [`drive`](Self::drive).
///
/// You should use [`MultiplexerBuilder`] to configure and build the `Multiplexer` instance.
pub struct Multiplexer<P: MuxProtocol> {
    protocol: P,
    local_addr: Multiaddr,
    peer_addr: Multiaddr,
    state: ConnState,
    /// Shared with [`MuxControl`] for the enqueue-time check.
    closed: Arc<AtomicBool>,
    /// Opened streams table.
    streams: HashMap<StreamId, StreamState<P::Data>>,
    /// Ids closed locally, the peer may not have seen the reset yet.
    reset_ids: VecDeque<StreamId>,
    /// Open requests received before the connection became active.
    pending_opens: VecDeque<(
        OutboundInitializer<P::Data>,
        oneshot::Sender<Result<MuxStream<P::Data>>>,
    )>,
    inbound_initializer: Option<InboundInitializer<P::Data>>,
    commands_sender: UnboundedSender<Command<P::Data>>,
    commands: UnboundedReceiver<Command<P::Data>>,
}

impl<P: MuxProtocol> std::fmt::Debug for Multiplexer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "multiplexer, {} => {}, state={:?}, streams={}",
            self.local_addr,
            self.peer_addr,
            self.state,
            self.streams.len()
        )
    }
}

impl<P: MuxProtocol> Multiplexer<P> {
    /// Returns a handle to open outbound streams.
    pub fn control(&self) -> MuxControl<P::Data> {
        MuxControl {
            commands: self.commands_sender.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Set or replace the callback receiving streams opened by the peer.
    pub fn set_inbound_initializer<F>(&mut self, initializer: F)
    where
        F: FnMut(MuxStream<P::Data>) + Send + 'static,
    {
        self.inbound_initializer = Some(Box::new(initializer));
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &Multiaddr {
        &self.peer_addr
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Returns true if the stream is registered in the stream table.
    pub fn contains(&self, stream_id: &StreamId) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Returns the ids of all open streams, in arbitrary order.
    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.keys().copied()
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl<P: MuxProtocol> Multiplexer<P> {
    /// The connection became active. Queued open requests are served now.
    ///
    /// Calling it more than once, or after close, has no effect.
    pub fn on_connection_active(&mut self) {
        if self.state != ConnState::Pending {
            log::warn!("{:?}, ignore active signal", self);
            return;
        }

        self.state = ConnState::Active;

        log::debug!("{:?}, active", self);

        while let Some((initializer, reply)) = self.pending_opens.pop_front() {
            let result = self.open_local(initializer);
            self.reply_open(reply, result);
        }
    }

    /// The connection was closed. This state is permanent.
    ///
    /// Pending and future open requests fail with [`Error::ConnectionClosed`],
    /// all remaining streams are unregistered.
    pub fn on_connection_closed(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }

        self.state = ConnState::Closed;
        self.closed.store(true, Ordering::Release);

        log::debug!("{:?}, closed", self);

        for (_, reply) in self.pending_opens.drain(..) {
            _ = reply.send(Err(Error::ConnectionClosed));
        }

        // unregister children, their consumers see end of stream.
        self.streams.clear();
        self.reset_ids.clear();

        // refuse new commands and answer the buffered ones.
        self.commands.close();
        self.run_pending();
    }

    /// Dispatch one decoded frame received from peer.
    pub fn on_event(&mut self, event: MuxEvent<P::Data>) -> Result<()> {
        match event {
            MuxEvent::Open(stream_id) => self.on_remote_open(stream_id),
            MuxEvent::Data(stream_id, data) => self.on_remote_data(stream_id, data),
            MuxEvent::HalfClose(stream_id) => {
                self.on_remote_half_close(stream_id);
                Ok(())
            }
            MuxEvent::Reset(stream_id) => {
                self.on_remote_reset(stream_id);
                Ok(())
            }
        }
    }

    /// The peer opened a new stream.
    pub fn on_remote_open(&mut self, stream_id: StreamId) -> Result<()> {
        if self.inbound_initializer.is_none() {
            return Err(Error::InboundHandlerNotSet);
        }

        match self.state {
            ConnState::Pending => return Err(Error::ConnectionNotActive(stream_id)),
            ConnState::Closed => return Err(Error::ConnectionClosed),
            ConnState::Active => {}
        }

        if self.streams.contains_key(&stream_id) {
            return Err(Error::DuplicateStream(stream_id));
        }

        let stream = self.create_stream(stream_id);

        if let Some(initializer) = self.inbound_initializer.as_mut() {
            initializer(stream);
        }

        self.protocol.on_remote_created(stream_id);

        Ok(())
    }

    /// The peer sent one data unit.
    ///
    /// Returns [`Error::ChannelNotOpened`] if the stream was never opened. Data for a stream
    /// reset locally is discarded: the peer sent it before seeing the reset.
    pub fn on_remote_data(&mut self, stream_id: StreamId, data: P::Data) -> Result<()> {
        if let Some(stream) = self.streams.get(&stream_id) {
            stream.deliver(StreamEvent::Data(data));
            return Ok(());
        }

        if self.reset_ids.contains(&stream_id) {
            log::trace!("discard data of locally reset stream({})", stream_id);
            return Ok(());
        }

        Err(Error::ChannelNotOpened(stream_id))
    }

    /// The peer half-closed a stream.
    pub fn on_remote_half_close(&mut self, stream_id: StreamId) {
        // the stream could be RESET locally, so ignore remote half-close.
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            log::trace!("ignore half-close of closed stream({})", stream_id);
            return;
        };

        if !stream.remote_disconnect() {
            log::warn!("peer half-closed stream({}) twice", stream_id);
            return;
        }

        stream.deliver(StreamEvent::RemoteWriteClosed);

        self.close_if_both_disconnected(stream_id);
    }

    /// The peer reset a stream.
    pub fn on_remote_reset(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.streams.get(&stream_id) {
            stream.deliver(StreamEvent::Reset);
            self.on_stream_closed(stream_id);
            return;
        }

        // the stream could be RESET locally, so ignore remote RESET.
        if self.forget_reset(&stream_id) {
            log::trace!("peer acknowledged reset of stream({})", stream_id);
        }
    }

    /// Execute every command queued by application handles.
    ///
    /// Returns the number of executed commands.
    pub fn run_pending(&mut self) -> usize {
        let mut executed = 0;

        while let Ok(Some(command)) = self.commands.try_next() {
            self.execute(command);
            executed += 1;
        }

        executed
    }

    /// Drive the multiplexer with the decoded frames of the connection.
    ///
    /// Frames and queued commands are handled as they arrive until `events` ends,
    /// which closes the connection. If a frame is rejected, the connection is closed and
    /// the error is returned.
    pub async fn drive<S>(&mut self, mut events: S) -> Result<()>
    where
        S: futures::Stream<Item = MuxEvent<P::Data>> + Unpin,
    {
        loop {
            let next = match select(events.next(), self.commands.next()).await {
                Either::Left((event, _)) => Either::Left(event),
                Either::Right((command, _)) => Either::Right(command),
            };

            match next {
                Either::Left(Some(event)) => {
                    if let Err(err) = self.on_event(event) {
                        log::error!("{:?}, stopped with error: {}", self, err);
                        self.on_connection_closed();
                        return Err(err);
                    }
                }
                Either::Left(None) => {
                    log::trace!("{:?}, inbound frames end", self);
                    self.on_connection_closed();
                    return Ok(());
                }
                Either::Right(Some(command)) => self.execute(command),
                Either::Right(None) => {
                    // the command queue is only closed after connection close.
                    return Ok(());
                }
            }
        }
    }
}

impl<P: MuxProtocol> Multiplexer<P> {
    fn execute(&mut self, command: Command<P::Data>) {
        match command {
            Command::Open { initializer, reply } => self.on_open_request(initializer, reply),
            Command::Write {
                stream_id,
                data,
                reply,
            } => {
                let result = self.on_stream_write(stream_id, data);

                if let Err(err) = &result {
                    log::debug!("write to stream({}) failed: {}", stream_id, err);
                }

                _ = reply.send(result);
            }
            Command::Disconnect(stream_id) => self.on_local_disconnect(stream_id),
            Command::Close(stream_id) => self.on_local_close(stream_id),
            Command::Release(stream_id) => self.on_stream_released(stream_id),
        }
    }

    fn on_open_request(
        &mut self,
        initializer: OutboundInitializer<P::Data>,
        reply: oneshot::Sender<Result<MuxStream<P::Data>>>,
    ) {
        match self.state {
            ConnState::Pending => self.pending_opens.push_back((initializer, reply)),
            _ => {
                let result = self.open_local(initializer);
                self.reply_open(reply, result);
            }
        }
    }

    fn open_local(
        &mut self,
        initializer: OutboundInitializer<P::Data>,
    ) -> Result<MuxStream<P::Data>> {
        // close may happen after the enqueue-time check and before this point.
        if self.state == ConnState::Closed {
            return Err(Error::ConnectionClosed);
        }

        let stream_id = self.protocol.next_id();

        if self.streams.contains_key(&stream_id) {
            log::error!("{:?}, id generator repeated stream({})", self, stream_id);
            return Err(Error::StreamIdInUse(stream_id));
        }

        let mut stream = self.create_stream(stream_id);

        self.protocol.on_local_open(stream_id);

        initializer(&mut stream);

        Ok(stream)
    }

    fn reply_open(
        &mut self,
        reply: oneshot::Sender<Result<MuxStream<P::Data>>>,
        result: Result<MuxStream<P::Data>>,
    ) {
        if let Err(Ok(stream)) = reply.send(result) {
            // the requester gave up, nobody will ever close this stream.
            log::trace!("{:?}, open request cancelled", stream);
            self.on_local_close(stream.id());
        }
    }

    fn create_stream(&mut self, stream_id: StreamId) -> MuxStream<P::Data> {
        let (sender, receiver) = mpsc::unbounded();

        // a reused id is no longer waiting for the peer's reset.
        self.forget_reset(&stream_id);

        self.streams
            .insert(stream_id, StreamState::new(stream_id, sender));

        log::trace!("{:?}, register stream({})", self, stream_id);

        MuxStream::new(
            stream_id,
            MuxAddr::new(self.local_addr.clone(), stream_id),
            MuxAddr::new(self.peer_addr.clone(), stream_id),
            self.commands_sender.clone(),
            receiver,
        )
    }

    fn on_stream_write(&mut self, stream_id: StreamId, data: P::Data) -> Result<()> {
        match self.streams.get(&stream_id) {
            None if self.state == ConnState::Closed => return Err(Error::ConnectionClosed),
            None => return Err(Error::StreamClosed(stream_id)),
            Some(stream) if stream.is_write_closed() => {
                return Err(Error::WriteClosed(stream_id))
            }
            Some(_) => {}
        }

        if self.protocol.on_write(stream_id, data)? {
            Ok(())
        } else {
            Err(Error::WriteRejected(stream_id))
        }
    }

    fn on_local_disconnect(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        if !stream.local_disconnect() {
            return;
        }

        self.protocol.on_local_disconnect(stream_id);

        self.close_if_both_disconnected(stream_id);
    }

    fn on_local_close(&mut self, stream_id: StreamId) {
        if !self.streams.contains_key(&stream_id) {
            return;
        }

        self.protocol.on_local_close(stream_id);

        self.on_stream_closed(stream_id);

        if self.reset_ids.len() == RESET_BACKLOG {
            self.reset_ids.pop_front();
        }

        self.reset_ids.push_back(stream_id);
    }

    /// Close a stream whose handle is gone.
    ///
    /// The id may have been reused since the handle was dropped, only the registration
    /// without consumer is closed.
    fn on_stream_released(&mut self, stream_id: StreamId) {
        let released = self
            .streams
            .get(&stream_id)
            .map(|stream| stream.is_consumer_dropped())
            .unwrap_or(false);

        if released {
            log::trace!("{:?}, stream({}) handle dropped", self, stream_id);
            self.on_local_close(stream_id);
        }
    }

    fn close_if_both_disconnected(&mut self, stream_id: StreamId) {
        let both_closed = self
            .streams
            .get(&stream_id)
            .map(|stream| stream.is_both_closed())
            .unwrap_or(false);

        if both_closed {
            self.on_stream_closed(stream_id);
        }
    }

    /// The fully-closed transition, removing the stream from the table. Idempotent.
    fn on_stream_closed(&mut self, stream_id: StreamId) {
        if self.streams.remove(&stream_id).is_some() {
            log::trace!("{:?}, unregister stream({})", self, stream_id);
        }
    }

    fn forget_reset(&mut self, stream_id: &StreamId) -> bool {
        if let Some(index) = self.reset_ids.iter().position(|id| id == stream_id) {
            self.reset_ids.remove(index);
            true
        } else {
            false
        }
    }
}

/// A builder pattern implementation for [`Multiplexer`] type.
pub struct MultiplexerBuilder<P: MuxProtocol> {
    protocol: P,
    local_addr: Multiaddr,
    peer_addr: Multiaddr,
    inbound_initializer: Option<InboundInitializer<P::Data>>,
}

impl<P: MuxProtocol> MultiplexerBuilder<P> {
    /// Create a [`Multiplexer`] builder running `protocol`, with empty connection addresses
    /// and no inbound initializer.
    pub fn new(protocol: P) -> Self {
        Self {
            protocol,
            local_addr: Multiaddr::empty(),
            peer_addr: Multiaddr::empty(),
            inbound_initializer: None,
        }
    }

    /// Set the local address of the underlying connection.
    pub fn local_addr(mut self, addr: Multiaddr) -> Self {
        self.local_addr = addr;
        self
    }

    /// Set the peer address of the underlying connection.
    pub fn peer_addr(mut self, addr: Multiaddr) -> Self {
        self.peer_addr = addr;
        self
    }

    /// Set the callback receiving streams opened by the peer.
    ///
    /// Without it, every stream the peer opens is rejected with [`Error::InboundHandlerNotSet`].
    pub fn inbound_initializer<F>(mut self, initializer: F) -> Self
    where
        F: FnMut(MuxStream<P::Data>) + Send + 'static,
    {
        self.inbound_initializer = Some(Box::new(initializer));
        self
    }

    /// Consume the `builder` and generate a new [`Multiplexer`] in pending state.
    pub fn create(self) -> Multiplexer<P> {
        let (commands_sender, commands) = mpsc::unbounded();

        Multiplexer {
            protocol: self.protocol,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            state: ConnState::Pending,
            closed: Default::default(),
            streams: Default::default(),
            reset_ids: Default::default(),
            pending_opens: Default::default(),
            inbound_initializer: self.inbound_initializer,
            commands_sender,
            commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures::{future::join, pin_mut, FutureExt};
    use quickcheck::{quickcheck, Arbitrary, Gen};

    use super::*;
    use crate::FrameProtocol;

    type FrameMux = Multiplexer<FrameProtocol<Vec<u8>>>;

    fn frame_mux() -> (
        FrameMux,
        UnboundedReceiver<MuxEvent<Vec<u8>>>,
        UnboundedReceiver<MuxStream<Vec<u8>>>,
    ) {
        let (protocol, frames) = FrameProtocol::new();

        let (accept_sender, accept) = mpsc::unbounded();

        let mux = MultiplexerBuilder::new(protocol)
            .local_addr("/ip4/127.0.0.1/tcp/4001".parse().unwrap())
            .peer_addr("/ip4/127.0.0.1/tcp/4002".parse().unwrap())
            .inbound_initializer(move |stream| {
                _ = accept_sender.unbounded_send(stream);
            })
            .create();

        (mux, frames, accept)
    }

    fn open_now(mux: &mut FrameMux) -> MuxStream<Vec<u8>> {
        let open = mux.control().open();

        mux.run_pending();

        open.now_or_never()
            .expect("open request served")
            .expect("stream opened")
    }

    fn next_event<T>(stream: &mut MuxStream<T>) -> Option<Option<StreamEvent<T>>> {
        stream.next().now_or_never()
    }

    /// Writes are accepted and recorded unless the data is empty (rejected) or `b"error"`.
    #[derive(Default)]
    struct RecordingProtocol {
        next_outbound_stream_num: u64,
        repeat_ids: bool,
        written: Vec<(StreamId, Vec<u8>)>,
    }

    impl MuxProtocol for RecordingProtocol {
        type Data = Vec<u8>;

        fn next_id(&mut self) -> StreamId {
            let stream_id = StreamId::local(self.next_outbound_stream_num);

            if !self.repeat_ids {
                self.next_outbound_stream_num += 1;
            }

            stream_id
        }

        fn on_write(&mut self, stream_id: StreamId, data: Vec<u8>) -> Result<bool> {
            if data.is_empty() {
                return Ok(false);
            }

            if data == b"error" {
                return Err(Error::Protocol("encode failed".to_string()));
            }

            self.written.push((stream_id, data));

            Ok(true)
        }

        fn on_local_open(&mut self, _stream_id: StreamId) {}

        fn on_local_disconnect(&mut self, _stream_id: StreamId) {}

        fn on_local_close(&mut self, _stream_id: StreamId) {}
    }

    #[test]
    fn test_open_waits_for_active() {
        let (mut mux, mut frames, _) = frame_mux();

        let mut open = Box::pin(mux.control().open());

        assert_eq!(mux.run_pending(), 1);

        assert!(mux.is_empty());
        assert!(frames.try_next().is_err());
        assert!((&mut open).now_or_never().is_none());

        mux.on_connection_active();

        let stream_id = StreamId::local(0);

        assert_eq!(mux.len(), 1);
        assert!(mux.contains(&stream_id));
        assert_eq!(frames.try_next().unwrap(), Some(MuxEvent::Open(stream_id)));

        let stream = open.now_or_never().unwrap().unwrap();

        assert_eq!(stream.id(), stream_id);
        assert!(stream.is_initiator());
    }

    #[test]
    fn test_open_after_close_fails_fast() {
        let (mut mux, _frames, _) = frame_mux();

        mux.on_connection_active();
        mux.on_connection_closed();

        let control = mux.control();

        assert!(control.is_closed());

        // fails without running the execution context.
        let result = control.open().now_or_never().expect("fail fast");

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(mux.is_empty());
    }

    #[test]
    fn test_close_fails_pending_open() {
        let (mut mux, _frames, _) = frame_mux();

        let control = mux.control();

        // the first request reaches the pending queue, the second stays in the command queue.
        let queued = control.open();

        mux.run_pending();

        let buffered = control.open();

        mux.on_connection_closed();

        assert!(matches!(
            queued.now_or_never(),
            Some(Err(Error::ConnectionClosed))
        ));

        assert!(matches!(
            buffered.now_or_never(),
            Some(Err(Error::ConnectionClosed))
        ));

        // a late active signal can't reopen the connection.
        mux.on_connection_active();

        assert!(mux.is_closed());
        assert!(!mux.is_active());
    }

    #[test]
    fn test_open_many_distinct_ids() {
        let (mut mux, _frames, mut accept) = frame_mux();

        mux.on_connection_active();

        let control = mux.control();

        let opens = (0..16).map(|_| control.open()).collect::<Vec<_>>();

        // the peer picks an id with the same number as a local one.
        mux.on_remote_open(StreamId::remote(0)).unwrap();

        assert_eq!(mux.run_pending(), 16);

        let ids = opens
            .into_iter()
            .map(|open| open.now_or_never().unwrap().unwrap().id())
            .collect::<HashSet<_>>();

        assert_eq!(ids.len(), 16);
        assert!(ids.iter().all(|id| id.is_initiator()));
        assert!(!ids.contains(&StreamId::remote(0)));

        assert_eq!(mux.len(), 17);

        let inbound = accept.try_next().unwrap().unwrap();

        assert_eq!(inbound.id(), StreamId::remote(0));
        assert!(!inbound.is_initiator());
        assert!(mux.contains(&StreamId::local(0)));
        assert!(mux.contains(&StreamId::remote(0)));
    }

    #[test]
    fn test_repeated_id_is_rejected() {
        let mut mux = MultiplexerBuilder::new(RecordingProtocol {
            repeat_ids: true,
            ..Default::default()
        })
        .create();

        mux.on_connection_active();

        let control = mux.control();

        let first = control.open();
        let second = control.open();

        mux.run_pending();

        assert!(first.now_or_never().unwrap().is_ok());

        assert!(matches!(
            second.now_or_never().unwrap(),
            Err(Error::StreamIdInUse(id)) if id == StreamId::local(0)
        ));

        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn test_initializer_sees_registered_stream() {
        let (mut mux, mut frames, _) = frame_mux();

        mux.on_connection_active();

        let (id_sender, mut ids) = mpsc::unbounded();

        let open = mux.control().open_stream(move |stream| {
            _ = id_sender.unbounded_send(stream.id());
            // queued behind the open request, served by the same run.
            _ = stream.write(b"hello".to_vec());
        });

        mux.run_pending();

        let stream = open.now_or_never().unwrap().unwrap();

        assert_eq!(ids.try_next().unwrap(), Some(stream.id()));
        assert_eq!(
            frames.try_next().unwrap(),
            Some(MuxEvent::Open(stream.id()))
        );
        assert_eq!(
            frames.try_next().unwrap(),
            Some(MuxEvent::Data(stream.id(), b"hello".to_vec()))
        );

        assert_eq!(
            stream.local_addr().to_string(),
            "Mux[/ip4/127.0.0.1/tcp/4001-0:local]"
        );
        assert_eq!(
            stream.peer_addr().to_string(),
            "Mux[/ip4/127.0.0.1/tcp/4002-0:local]"
        );
    }

    #[test]
    fn test_cancelled_open_closes_stream() {
        let (mut mux, mut frames, _) = frame_mux();

        mux.on_connection_active();

        drop(mux.control().open());

        mux.run_pending();

        assert!(mux.is_empty());

        assert_eq!(
            frames.try_next().unwrap(),
            Some(MuxEvent::Open(StreamId::local(0)))
        );
        assert_eq!(
            frames.try_next().unwrap(),
            Some(MuxEvent::Reset(StreamId::local(0)))
        );
    }

    #[test]
    fn test_remote_open_requires_initializer() {
        let (protocol, _frames) = FrameProtocol::<Vec<u8>>::new();

        let mut mux = MultiplexerBuilder::new(protocol).create();

        mux.on_connection_active();

        assert!(matches!(
            mux.on_event(MuxEvent::Open(StreamId::remote(1))),
            Err(Error::InboundHandlerNotSet)
        ));

        assert!(mux.is_empty());

        let (accept_sender, mut accept) = mpsc::unbounded();

        mux.set_inbound_initializer(move |stream| {
            _ = accept_sender.unbounded_send(stream);
        });

        mux.on_event(MuxEvent::Open(StreamId::remote(1))).unwrap();

        assert_eq!(accept.try_next().unwrap().unwrap().id(), StreamId::remote(1));
    }

    #[test]
    fn test_remote_open_lifecycle_checks() {
        let (mut mux, _frames, _) = frame_mux();

        assert!(matches!(
            mux.on_remote_open(StreamId::remote(1)),
            Err(Error::ConnectionNotActive(_))
        ));

        mux.on_connection_active();

        mux.on_remote_open(StreamId::remote(1)).unwrap();

        let err = mux.on_remote_open(StreamId::remote(1)).unwrap_err();

        assert!(matches!(err, Error::DuplicateStream(_)));
        assert!(err.is_protocol_violation());

        mux.on_connection_closed();

        let err = mux.on_remote_open(StreamId::remote(2)).unwrap_err();

        assert!(matches!(err, Error::ConnectionClosed));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_inbound_data_dispatch() {
        let (mut mux, _frames, mut accept) = frame_mux();

        mux.on_connection_active();

        mux.on_event(MuxEvent::Open(StreamId::remote(1))).unwrap();
        mux.on_event(MuxEvent::Data(StreamId::remote(1), b"a".to_vec()))
            .unwrap();
        mux.on_event(MuxEvent::Data(StreamId::remote(1), b"b".to_vec()))
            .unwrap();

        let mut stream = accept.try_next().unwrap().unwrap();

        assert_eq!(
            next_event(&mut stream),
            Some(Some(StreamEvent::Data(b"a".to_vec())))
        );
        assert_eq!(
            next_event(&mut stream),
            Some(Some(StreamEvent::Data(b"b".to_vec())))
        );
        assert_eq!(next_event(&mut stream), None);
    }

    #[test]
    fn test_data_for_unknown_stream() {
        let (mut mux, _frames, _) = frame_mux();

        mux.on_connection_active();

        let err = mux
            .on_remote_data(StreamId::remote(9), b"a".to_vec())
            .unwrap_err();

        assert!(matches!(err, Error::ChannelNotOpened(_)));
        assert!(err.is_protocol_violation());

        // the local side reset this stream, the peer may still be sending.
        let stream = open_now(&mut mux);

        stream.close();
        mux.run_pending();

        assert!(!mux.contains(&stream.id()));

        mux.on_remote_data(stream.id(), b"late".to_vec()).unwrap();
        mux.on_remote_half_close(stream.id());
        mux.on_remote_reset(stream.id());

        assert!(mux.is_empty());
    }

    #[test]
    fn test_control_frames_for_removed_stream_are_ignored() {
        let (mut mux, _frames, _) = frame_mux();

        mux.on_connection_active();

        mux.on_event(MuxEvent::HalfClose(StreamId::remote(5))).unwrap();
        mux.on_event(MuxEvent::Reset(StreamId::remote(5))).unwrap();

        assert!(mux.is_empty());
    }

    #[test]
    fn test_graceful_close() {
        let (mut mux, mut frames, _) = frame_mux();

        mux.on_connection_active();

        let mut stream = open_now(&mut mux);

        let stream_id = stream.id();

        assert_eq!(frames.try_next().unwrap(), Some(MuxEvent::Open(stream_id)));

        stream.disconnect();
        // disconnecting twice is a no-op.
        stream.disconnect();
        mux.run_pending();

        assert_eq!(
            frames.try_next().unwrap(),
            Some(MuxEvent::HalfClose(stream_id))
        );
        assert!(frames.try_next().is_err());

        assert!(mux.contains(&stream_id));

        assert!(matches!(
            stream.write(b"a".to_vec()).now_or_never(),
            None
        ));
        mux.run_pending();

        mux.on_remote_data(stream_id, b"b".to_vec()).unwrap();
        mux.on_remote_half_close(stream_id);

        assert!(!mux.contains(&stream_id));

        assert_eq!(
            next_event(&mut stream),
            Some(Some(StreamEvent::Data(b"b".to_vec())))
        );
        assert_eq!(
            next_event(&mut stream),
            Some(Some(StreamEvent::RemoteWriteClosed))
        );
        assert_eq!(next_event(&mut stream), Some(None));
    }

    #[test]
    fn test_remote_reset() {
        let (mut mux, mut frames, _) = frame_mux();

        mux.on_connection_active();

        let mut stream = open_now(&mut mux);

        mux.on_remote_reset(stream.id());

        assert!(mux.is_empty());

        assert_eq!(next_event(&mut stream), Some(Some(StreamEvent::Reset)));
        assert_eq!(next_event(&mut stream), Some(None));

        // closing after the reset is a no-op.
        stream.close();
        mux.run_pending();

        assert_eq!(
            frames.try_next().unwrap(),
            Some(MuxEvent::Open(stream.id()))
        );
        assert!(frames.try_next().is_err());
    }

    #[test]
    fn test_local_close_preempts_half_close() {
        let (mut mux, mut frames, _) = frame_mux();

        mux.on_connection_active();

        let mut stream = open_now(&mut mux);

        let stream_id = stream.id();

        mux.on_remote_half_close(stream_id);

        assert!(mux.contains(&stream_id));

        stream.close();
        mux.run_pending();

        assert!(!mux.contains(&stream_id));

        assert_eq!(frames.try_next().unwrap(), Some(MuxEvent::Open(stream_id)));
        assert_eq!(frames.try_next().unwrap(), Some(MuxEvent::Reset(stream_id)));

        assert_eq!(
            next_event(&mut stream),
            Some(Some(StreamEvent::RemoteWriteClosed))
        );
        assert_eq!(next_event(&mut stream), Some(None));
    }

    #[test]
    fn test_write_failures_are_scoped_to_unit() {
        let mut mux = MultiplexerBuilder::new(RecordingProtocol::default()).create();

        mux.on_connection_active();

        let control = mux.control();

        let first = control.open();
        let second = control.open();

        mux.run_pending();

        let first = first.now_or_never().unwrap().unwrap();
        let second = second.now_or_never().unwrap().unwrap();

        let writes = vec![
            first.write(b"1".to_vec()),
            first.write(vec![]),
            second.write(b"x".to_vec()),
            first.write(b"error".to_vec()),
            first.write(b"2".to_vec()),
        ];

        mux.run_pending();

        let results = writes
            .into_iter()
            .map(|write| write.now_or_never().unwrap())
            .collect::<Vec<_>>();

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::WriteRejected(id)) if id == first.id()));
        assert!(results[2].is_ok());
        assert!(matches!(results[3], Err(Error::Protocol(_))));
        assert!(results[4].is_ok());

        assert_eq!(
            mux.protocol().written,
            vec![
                (first.id(), b"1".to_vec()),
                (second.id(), b"x".to_vec()),
                (first.id(), b"2".to_vec()),
            ]
        );

        assert_eq!(mux.len(), 2);
    }

    #[test]
    fn test_write_after_close() {
        let mut mux = MultiplexerBuilder::new(RecordingProtocol::default()).create();

        mux.on_connection_active();

        let control = mux.control();

        let open = control.open();
        mux.run_pending();
        let stream = open.now_or_never().unwrap().unwrap();

        stream.disconnect();
        let write = stream.write(b"a".to_vec());
        mux.run_pending();

        assert!(matches!(
            write.now_or_never().unwrap(),
            Err(Error::WriteClosed(_))
        ));

        stream.close();
        let write = stream.write(b"a".to_vec());
        mux.run_pending();

        assert!(matches!(
            write.now_or_never().unwrap(),
            Err(Error::StreamClosed(_))
        ));

        let open = control.open();
        mux.run_pending();
        let stream = open.now_or_never().unwrap().unwrap();

        mux.on_connection_closed();

        assert!(matches!(
            stream.write(b"a".to_vec()).now_or_never().unwrap(),
            Err(Error::ConnectionClosed)
        ));

        assert!(mux.protocol().written.is_empty());
    }

    #[test]
    fn test_remote_reset_of_reused_id() {
        let mut mux = MultiplexerBuilder::new(RecordingProtocol {
            repeat_ids: true,
            ..Default::default()
        })
        .create();

        mux.on_connection_active();

        let control = mux.control();

        let open = control.open();
        mux.run_pending();
        let first = open.now_or_never().unwrap().unwrap();

        first.close();
        mux.run_pending();

        assert!(mux.is_empty());

        // the id generator hands out the id of the reset stream again.
        let open = control.open();
        mux.run_pending();
        let mut second = open.now_or_never().unwrap().unwrap();

        assert_eq!(second.id(), first.id());

        mux.on_remote_reset(second.id());

        assert!(!mux.contains(&second.id()));
        assert_eq!(next_event(&mut second), Some(Some(StreamEvent::Reset)));
        assert_eq!(next_event(&mut second), Some(None));
    }

    #[test]
    fn test_dropped_handles_close_streams() {
        let (protocol, mut frames) = FrameProtocol::<Vec<u8>>::new();

        let mut mux = MultiplexerBuilder::new(protocol)
            .inbound_initializer(|stream| log::trace!("{:?}, not interested", stream))
            .create();

        mux.on_connection_active();

        let control = mux.control();

        let opens = (0..8).map(|_| control.open()).collect::<Vec<_>>();
        let kept = control.open();

        for num in 0..8 {
            mux.on_remote_open(StreamId::remote(num)).unwrap();
        }

        assert_eq!(mux.len(), 8);

        mux.run_pending();

        // inbound streams were released by the initializer.
        assert_eq!(mux.len(), 9);

        for open in opens {
            drop(open.now_or_never().unwrap().unwrap());
        }

        let kept = kept.now_or_never().unwrap().unwrap();

        assert_eq!(mux.len(), 9);

        mux.run_pending();

        assert_eq!(mux.len(), 1);
        assert!(mux.contains(&kept.id()));

        let resets = std::iter::from_fn(|| frames.try_next().ok().flatten())
            .filter(|frame| matches!(frame, MuxEvent::Reset(_)))
            .count();

        assert_eq!(resets, 16);

        // the peer's late frames for released streams are absorbed.
        mux.on_remote_data(StreamId::remote(3), b"late".to_vec())
            .unwrap();
    }

    #[test]
    fn test_dropped_handle_spares_reused_id() {
        let mut mux = MultiplexerBuilder::new(RecordingProtocol {
            repeat_ids: true,
            ..Default::default()
        })
        .create();

        mux.on_connection_active();

        let control = mux.control();

        let open = control.open();
        mux.run_pending();
        let first = open.now_or_never().unwrap().unwrap();

        first.close();
        mux.run_pending();

        let open = control.open();
        mux.run_pending();
        let second = open.now_or_never().unwrap().unwrap();

        drop(first);
        mux.run_pending();

        assert!(mux.contains(&second.id()));

        drop(second);
        mux.run_pending();

        assert!(mux.is_empty());
    }

    #[test]
    fn test_connection_close_unregisters_streams() {
        let (mut mux, _frames, mut accept) = frame_mux();

        mux.on_connection_active();

        let mut outbound = open_now(&mut mux);

        mux.on_remote_open(StreamId::remote(0)).unwrap();

        let mut inbound = accept.try_next().unwrap().unwrap();

        mux.on_connection_closed();

        assert!(mux.is_empty());
        assert_eq!(next_event(&mut outbound), Some(None));
        assert_eq!(next_event(&mut inbound), Some(None));
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        LocalDisconnect,
        LocalClose,
        RemoteHalfClose,
        RemoteReset,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            *g.choose(&[
                Op::LocalDisconnect,
                Op::LocalClose,
                Op::RemoteHalfClose,
                Op::RemoteReset,
            ])
            .unwrap()
        }
    }

    fn fully_closed_iff_both_halves_or_reset(ops: Vec<Op>) -> bool {
        let (mut mux, _frames, _) = frame_mux();

        mux.on_connection_active();

        let stream = open_now(&mut mux);
        let stream_id = stream.id();

        let (mut local, mut remote, mut reset) = (false, false, false);

        for op in ops {
            match op {
                Op::LocalDisconnect => {
                    stream.disconnect();
                    mux.run_pending();
                    local = true;
                }
                Op::LocalClose => {
                    stream.close();
                    mux.run_pending();
                    reset = true;
                }
                Op::RemoteHalfClose => {
                    mux.on_remote_half_close(stream_id);
                    remote = true;
                }
                Op::RemoteReset => {
                    mux.on_remote_reset(stream_id);
                    reset = true;
                }
            }

            let fully_closed = reset || (local && remote);

            if mux.contains(&stream_id) == fully_closed {
                return false;
            }
        }

        true
    }

    #[test]
    fn test_half_close_and_reset_interleavings() {
        quickcheck(fully_closed_iff_both_halves_or_reset as fn(Vec<Op>) -> bool);
    }

    #[futures_test::test]
    async fn test_loopback() {
        _ = pretty_env_logger::try_init();

        let (mut client, client_frames, _) = frame_mux();
        let (mut server, server_frames, mut accept) = frame_mux();

        // streams and writes issued before the connection is up must wait.
        let control = client.control();
        let open = control.open();

        client.on_connection_active();
        server.on_connection_active();

        let drivers = join(
            client.drive(server_frames.map(MuxEvent::flip)),
            server.drive(client_frames.map(MuxEvent::flip)),
        );

        let scenario = async move {
            let mut outbound = open.await.unwrap();
            let mut inbound = accept.next().await.unwrap();

            assert_eq!(inbound.id(), outbound.id().flip());

            outbound.write(b"hello".to_vec()).await.unwrap();

            assert_eq!(
                inbound.next().await,
                Some(StreamEvent::Data(b"hello".to_vec()))
            );

            inbound.write(b"world".to_vec()).await.unwrap();

            assert_eq!(
                outbound.next().await,
                Some(StreamEvent::Data(b"world".to_vec()))
            );

            outbound.disconnect();

            assert_eq!(inbound.next().await, Some(StreamEvent::RemoteWriteClosed));

            inbound.disconnect();

            assert_eq!(outbound.next().await, Some(StreamEvent::RemoteWriteClosed));
            assert_eq!(outbound.next().await, None);
            assert_eq!(inbound.next().await, None);

            // a reset travels to the peer and closes both ends.
            let outbound = control.open().await.unwrap();
            let mut inbound = accept.next().await.unwrap();

            outbound.close();

            assert_eq!(inbound.next().await, Some(StreamEvent::Reset));
            assert_eq!(inbound.next().await, None);
        };

        pin_mut!(drivers);
        pin_mut!(scenario);

        match select(scenario, drivers).await {
            Either::Left(_) => {}
            Either::Right(_) => panic!("drivers stopped before the scenario finished"),
        }
    }
}
