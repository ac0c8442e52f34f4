//! Client connection to a game server.
//!
//! A [`Connection`] drives one TCP session through its lifecycle:
//!
//! ```text
//!   Init ──connect──▶ Connecting ──ok──▶ Connected ──fail/close──▶ Closed
//!    │                 │   │   └──deadline──▶ TimedOut
//!    │                 │   └──refused──▶ Closed
//!    └──unresolvable───┴─────────────────▶ Error
//! ```
//!
//! Connect runs on a short-lived connector thread. Once connected, a sender
//! thread drains the send ring into the socket and a receiver thread fills
//! the receive ring from it. The caller only touches the rings, so
//! [`send`](Connection::send) and [`poll_inbound`](Connection::poll_inbound)
//! never block on the network.
//!
//! Closed, TimedOut and Error are terminal. Reconnecting means building a
//! new `Connection`.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tickwire_config::TransportConfig;

use crate::error::TransportError;
use crate::framing::{
    COMMAND_BATCH, FrameDecoder, FrameEncoder, FrameError, HEADER_SIZE, batch_body_len,
    decode_sub_messages,
};
use crate::pool::{BlockPool, PooledBuffer};
use crate::ring::{Consumer, Producer, ring_buffer};
use crate::socket::{ConnectFailure, SocketOptions, open_stream};
use crate::stats::TransportCounters;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, connect not yet requested.
    Init = 0,
    /// Connector thread is resolving and connecting.
    Connecting = 1,
    /// Socket established, workers running.
    Connected = 2,
    /// Refused, lost, or closed on request.
    Closed = 3,
    /// Connect did not finish before its deadline.
    TimedOut = 4,
    /// Connect could not be issued (address resolution failed).
    Error = 5,
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The caller asked to connect.
    ConnectRequested,
    /// The connector thread produced a stream.
    ConnectSucceeded,
    /// Every address refused or failed.
    ConnectFailed,
    /// The connect deadline passed while still connecting.
    DeadlineElapsed,
    /// The host did not resolve.
    ResolveFailed,
    /// The peer closed the stream or a read failed.
    TransportFailed,
    /// Inbound bytes broke the framing rules.
    ProtocolViolation,
    /// The caller asked to disconnect.
    CloseRequested,
}

impl ConnectionState {
    /// The state reached by applying `event`, or `None` if the event does not
    /// apply in this state.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Init, E::ConnectRequested) => Some(S::Connecting),
            (S::Init, E::ResolveFailed) => Some(S::Error),
            (S::Init, E::CloseRequested) => Some(S::Closed),
            (S::Connecting, E::ConnectSucceeded) => Some(S::Connected),
            (S::Connecting, E::ConnectFailed) => Some(S::Closed),
            (S::Connecting, E::DeadlineElapsed) => Some(S::TimedOut),
            (S::Connecting, E::ResolveFailed) => Some(S::Error),
            (S::Connecting, E::CloseRequested) => Some(S::Closed),
            (S::Connected, E::TransportFailed | E::ProtocolViolation | E::CloseRequested) => {
                Some(S::Closed)
            }
            _ => None,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::TimedOut | Self::Error)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closed,
            4 => Self::TimedOut,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Atomic state shared with the worker threads.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply `event`, retrying if another thread moved the state first.
    fn apply(&self, event: ConnectionEvent) -> Option<(ConnectionState, ConnectionState)> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from_u8(current);
            let to = from.on(event)?;
            match self
                .0
                .compare_exchange_weak(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((from, to)),
                Err(actual) => current = actual,
            }
        }
    }
}

/// State reachable from the caller and both workers.
struct Shared {
    state: StateCell,
    socket: Mutex<Option<Arc<TcpStream>>>,
    pool: Arc<BlockPool>,
    counters: Arc<TransportCounters>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.state.load()
    }

    fn apply(&self, event: ConnectionEvent) -> bool {
        match self.state.apply(event) {
            Some((from, to)) => {
                tracing::debug!(?event, %from, %to, "connection state changed");
                true
            }
            None => false,
        }
    }

    fn stream(&self) -> Option<Arc<TcpStream>> {
        self.socket.lock().clone()
    }

    fn install(&self, stream: TcpStream) {
        *self.socket.lock() = Some(Arc::new(stream));
    }

    /// Shut the socket down and drop our handle. Errors are ignored.
    fn close_socket(&self) {
        let stream = self.socket.lock().take();
        if let Some(stream) = stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Per-worker knobs copied out of [`TransportConfig`].
#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    idle_backoff: Duration,
    max_send_chunk: usize,
    recv_scratch_size: usize,
}

/// Worker ring halves waiting to be handed over, and the running threads.
struct Workers {
    send_drain: Option<Consumer>,
    recv_fill: Option<Producer>,
    handles: Vec<JoinHandle<()>>,
}

type InboundHandler = Box<dyn FnMut(&[u8]) + Send>;
type CommandHandler = Box<dyn FnMut(u16, &[u8]) + Send>;
type ConnectedCallback = Box<dyn FnOnce() + Send>;

/// A single client session with a game server.
///
/// Owned and driven by one caller thread: call [`tick`](Self::tick) once per
/// update, [`send`](Self::send) or [`send_frame`](Self::send_frame) to queue
/// outbound frames, and [`poll_inbound`](Self::poll_inbound) to dispatch
/// what arrived.
pub struct Connection {
    shared: Arc<Shared>,
    settings: WorkerSettings,
    socket_options: SocketOptions,
    max_frames_per_poll: usize,

    encoder: FrameEncoder,
    decoder: FrameDecoder,
    outbound: Producer,
    inbound: Consumer,
    workers: Mutex<Workers>,

    connect_rx: Option<Receiver<Result<TcpStream, ConnectFailure>>>,
    deadline: Option<Instant>,
    observed: ConnectionState,
    poisoned: bool,

    on_connected: Option<ConnectedCallback>,
    inbound_handler: Option<InboundHandler>,
    command_handler: Option<CommandHandler>,
}

impl Connection {
    /// Create an idle connection with rings sized from `config`.
    pub fn new(config: &TransportConfig, pool: Arc<BlockPool>) -> Self {
        let (outbound, send_drain) = ring_buffer(config.send_buffer_capacity);
        let (recv_fill, inbound) = ring_buffer(config.recv_buffer_capacity);

        Self {
            shared: Arc::new(Shared {
                state: StateCell::new(ConnectionState::Init),
                socket: Mutex::new(None),
                pool: Arc::clone(&pool),
                counters: Arc::new(TransportCounters::new()),
            }),
            settings: WorkerSettings {
                idle_backoff: config.idle_backoff(),
                max_send_chunk: config.max_send_chunk,
                recv_scratch_size: config.recv_scratch_size,
            },
            socket_options: SocketOptions::from(config),
            max_frames_per_poll: config.max_frames_per_poll,
            encoder: FrameEncoder::new(Arc::clone(&pool)),
            decoder: FrameDecoder::new(pool, config.max_inbound_body),
            outbound,
            inbound,
            workers: Mutex::new(Workers {
                send_drain: Some(send_drain),
                recv_fill: Some(recv_fill),
                handles: Vec::new(),
            }),
            connect_rx: None,
            deadline: None,
            observed: ConnectionState::Init,
            poisoned: false,
            on_connected: None,
            inbound_handler: None,
            command_handler: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Traffic counters shared with the worker threads.
    pub fn counters(&self) -> &Arc<TransportCounters> {
        &self.shared.counters
    }

    /// The pool frames and scratch buffers come from.
    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.shared.pool
    }

    /// Bytes waiting in the send ring.
    pub fn pending_send_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Bytes waiting in the receive ring.
    pub fn pending_recv_bytes(&self) -> usize {
        self.inbound.len()
    }

    /// Register the handler invoked once per inbound sub-message.
    pub fn set_inbound_handler(&mut self, handler: impl FnMut(&[u8]) + Send + 'static) {
        self.inbound_handler = Some(Box::new(handler));
    }

    /// Register the handler invoked with the command id and body of each
    /// inbound control frame.
    pub fn set_command_handler(&mut self, handler: impl FnMut(u16, &[u8]) + Send + 'static) {
        self.command_handler = Some(Box::new(handler));
    }

    /// Start connecting to `host:port` in the background.
    ///
    /// Returns immediately; progress is observed through [`tick`](Self::tick)
    /// and [`state`](Self::state). If the connect has not completed within
    /// `timeout`, the connection moves to [`ConnectionState::TimedOut`].
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let result_tx = self.begin_connect(timeout)?;
        let host = host.to_owned();
        let options = self.socket_options;

        let spawned = thread::Builder::new()
            .name("tickwire-connect".into())
            .spawn(move || {
                let outcome = open_stream(&host, port, timeout, options);
                // a send error means the connection was dropped; the stream goes with it
                let _ = result_tx.send(outcome);
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn connector thread");
            self.connect_rx = None;
            self.shared.apply(ConnectionEvent::ConnectFailed);
            self.sync_state();
            return Err(e.into());
        }
        Ok(())
    }

    /// Like [`connect`](Self::connect), firing `on_connected` exactly once
    /// when the connection is established.
    pub fn connect_with_callback(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
        on_connected: impl FnOnce() + Send + 'static,
    ) -> Result<(), TransportError> {
        self.on_connected = Some(Box::new(on_connected));
        self.connect(host, port, timeout)
    }

    /// Move to Connecting and arm the deadline. Returns the channel the
    /// connect outcome must be posted on.
    fn begin_connect(
        &mut self,
        timeout: Duration,
    ) -> Result<Sender<Result<TcpStream, ConnectFailure>>, TransportError> {
        let state = self.state();
        if state != ConnectionState::Init
            || !self.shared.apply(ConnectionEvent::ConnectRequested)
        {
            return Err(TransportError::InvalidState(state));
        }
        self.observed = ConnectionState::Connecting;
        self.deadline = Some(Instant::now() + timeout);

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.connect_rx = Some(rx);
        Ok(tx)
    }

    /// Advance the connection: collect the connect outcome, enforce the
    /// connect deadline, and run enter-actions for any state change.
    pub fn tick(&mut self) {
        self.drain_connect_result();

        if self.state() == ConnectionState::Connecting
            && self.deadline.is_some_and(|d| Instant::now() >= d)
            && self.shared.apply(ConnectionEvent::DeadlineElapsed)
        {
            tracing::warn!("connect timed out");
            self.connect_rx = None;
        }

        self.sync_state();
    }

    fn drain_connect_result(&mut self) {
        let Some(rx) = &self.connect_rx else {
            return;
        };

        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                Err(ConnectFailure::Connect(io::Error::other("connector thread exited")))
            }
        };
        self.connect_rx = None;

        match outcome {
            Ok(stream) if self.state() == ConnectionState::Connecting => {
                let peer = stream.peer_addr().ok();
                self.shared.install(stream);
                if self.shared.apply(ConnectionEvent::ConnectSucceeded) {
                    tracing::info!(?peer, "connected");
                }
            }
            Ok(stream) => {
                tracing::debug!(
                    "discarding connection that completed after {}",
                    self.state()
                );
                let _ = stream.shutdown(Shutdown::Both);
            }
            Err(ConnectFailure::Resolve(e)) => {
                tracing::warn!(error = %e, "address resolution failed");
                self.shared.apply(ConnectionEvent::ResolveFailed);
            }
            // the connector shares our deadline, so its timeout is ours
            Err(ConnectFailure::Connect(e))
                if e.kind() == io::ErrorKind::TimedOut
                    || self.deadline.is_some_and(|d| Instant::now() >= d) =>
            {
                tracing::warn!(error = %e, "connect timed out");
                self.shared.apply(ConnectionEvent::DeadlineElapsed);
            }
            Err(ConnectFailure::Connect(e)) => {
                tracing::warn!(error = %e, "connect failed");
                self.shared.apply(ConnectionEvent::ConnectFailed);
            }
        }
    }

    /// Run enter-actions for the state the connection has moved into since
    /// the last call.
    fn sync_state(&mut self) {
        let current = self.state();
        if current == self.observed {
            return;
        }
        self.observed = current;

        match current {
            ConnectionState::Connected => {
                if let Some(on_connected) = self.on_connected.take() {
                    on_connected();
                }
                if let Err(e) = self.start_workers() {
                    tracing::error!(error = %e, "failed to start connection workers");
                    self.shared.apply(ConnectionEvent::TransportFailed);
                    self.sync_state();
                }
            }
            ConnectionState::Closed | ConnectionState::TimedOut | ConnectionState::Error => {
                tracing::info!(state = %current, "connection ended");
                self.deadline = None;
                self.shared.close_socket();
            }
            ConnectionState::Init | ConnectionState::Connecting => {}
        }
    }

    /// Hand the worker ring halves to freshly spawned threads. Does nothing
    /// if the workers were already started.
    fn start_workers(&self) -> io::Result<()> {
        let mut workers = self.workers.lock();
        let (Some(send_drain), Some(recv_fill)) =
            (workers.send_drain.take(), workers.recv_fill.take())
        else {
            return Ok(());
        };

        let shared = Arc::clone(&self.shared);
        let settings = self.settings;
        let sender = thread::Builder::new()
            .name("tickwire-send".into())
            .spawn(move || send_loop(&shared, send_drain, settings))?;
        workers.handles.push(sender);

        let shared = Arc::clone(&self.shared);
        let receiver = thread::Builder::new()
            .name("tickwire-recv".into())
            .spawn(move || recv_loop(&shared, recv_fill, settings))?;
        workers.handles.push(receiver);

        Ok(())
    }

    /// Queue one frame carrying a single sub-message.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.send_frame(&[payload])
    }

    /// Queue one frame carrying `sub_messages` in order.
    ///
    /// Allowed while Connecting or Connected. While Connected and the send
    /// ring lacks room, waits for the sender thread to drain it; while
    /// Connecting, a full ring is reported as
    /// [`TransportError::SendBufferFull`].
    pub fn send_frame<B: AsRef<[u8]>>(
        &mut self,
        sub_messages: &[B],
    ) -> Result<(), TransportError> {
        let frame_len = HEADER_SIZE + batch_body_len(sub_messages);
        self.reserve(frame_len)?;
        let frame = self.encoder.encode_frame(sub_messages)?;
        self.push_frame(frame, sub_messages.len());
        Ok(())
    }

    /// Queue one control frame with an opaque body.
    ///
    /// Command [`COMMAND_BATCH`] is rejected with
    /// [`TransportError::InvalidCommand`]; batches go through
    /// [`send_frame`](Self::send_frame).
    pub fn send_command(&mut self, command: u16, body: &[u8]) -> Result<(), TransportError> {
        if command == COMMAND_BATCH {
            return Err(TransportError::InvalidCommand(command));
        }
        self.reserve(HEADER_SIZE + body.len())?;
        let frame = self.encoder.encode_command(command, body)?;
        self.push_frame(frame, 0);
        Ok(())
    }

    /// Wait until the send ring can take `frame_len` bytes.
    fn reserve(&self, frame_len: usize) -> Result<(), TransportError> {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(TransportError::NotConnected(state));
        }
        if frame_len > self.outbound.capacity() {
            return Err(TransportError::FrameTooLarge {
                size: frame_len,
                capacity: self.outbound.capacity(),
            });
        }

        while self.outbound.free_space() < frame_len {
            match self.state() {
                ConnectionState::Connected => thread::sleep(self.settings.idle_backoff),
                ConnectionState::Connecting => return Err(TransportError::SendBufferFull),
                other => return Err(TransportError::NotConnected(other)),
            }
        }
        Ok(())
    }

    fn push_frame(&mut self, frame: PooledBuffer, messages: usize) {
        let written = self.outbound.try_write(&frame);
        self.shared.pool.release(frame);
        assert!(
            written,
            "send ring rejected a frame after space was reserved"
        );
        self.shared.counters.record_frame_sent(messages);
    }

    /// Decode and dispatch buffered inbound frames.
    ///
    /// Handles at most `max_frames_per_poll` frames per call. Sub-messages
    /// reach the inbound handler in wire order; a frame is fully validated
    /// before any of it is dispatched. On a framing error the connection is
    /// closed, buffered inbound data is discarded and later calls return 0.
    ///
    /// Returns the number of sub-messages decoded.
    pub fn poll_inbound(&mut self) -> usize {
        if self.poisoned {
            return 0;
        }

        let mut delivered = 0;
        for _ in 0..self.max_frames_per_poll {
            let frame = match self.decoder.next_frame(&mut self.inbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.protocol_violation(e);
                    break;
                }
            };

            if frame.header.is_control() {
                if let Some(handler) = self.command_handler.as_mut() {
                    handler(frame.header.command, frame.body.as_slice());
                }
                self.shared.counters.record_frame_received(0);
                self.shared.pool.release(frame.body);
                continue;
            }

            if let Some(e) = decode_sub_messages(&frame.body).find_map(Result::err) {
                self.shared.pool.release(frame.body);
                self.protocol_violation(e);
                break;
            }

            let mut count = 0;
            for range in decode_sub_messages(&frame.body).flatten() {
                if let Some(handler) = self.inbound_handler.as_mut() {
                    handler(&frame.body[range]);
                }
                count += 1;
            }
            self.shared.counters.record_frame_received(count);
            self.shared.pool.release(frame.body);
            delivered += count;
        }
        delivered
    }

    fn protocol_violation(&mut self, error: FrameError) {
        tracing::error!(%error, "protocol violation, closing connection");
        self.shared.apply(ConnectionEvent::ProtocolViolation);
        self.inbound.clear();
        self.poisoned = true;
        self.shared.close_socket();
        self.sync_state();
    }

    /// Close the connection now. Idempotent.
    pub fn disconnect(&mut self) {
        if self.shared.apply(ConnectionEvent::CloseRequested) {
            tracing::info!("disconnect requested");
        }
        self.connect_rx = None;
        self.sync_state();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
        self.shared.close_socket();

        let handles = std::mem::take(&mut self.workers.lock().handles);
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("connection worker panicked");
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending_send_bytes", &self.outbound.len())
            .field("pending_recv_bytes", &self.inbound.len())
            .field("next_send_sequence", &self.encoder.next_sequence())
            .finish_non_exhaustive()
    }
}

/// Sender thread: move bytes from the send ring to the socket while connected.
fn send_loop(shared: &Shared, mut drain: Consumer, settings: WorkerSettings) {
    while shared.state() == ConnectionState::Connected {
        let pending = drain.len();
        if pending == 0 {
            thread::sleep(settings.idle_backoff);
            continue;
        }

        let mut chunk = shared.pool.acquire(pending.min(settings.max_send_chunk));
        if drain.try_read(&mut chunk) {
            match shared.stream() {
                Some(stream) => match (&*stream).write_all(&chunk) {
                    Ok(()) => shared.counters.record_bytes_sent(chunk.len()),
                    Err(e) => {
                        tracing::warn!(error = %e, bytes = chunk.len(), "socket write failed")
                    }
                },
                None => {
                    tracing::debug!(bytes = chunk.len(), "socket gone, dropping outbound bytes")
                }
            }
        }
        shared.pool.release(chunk);
    }
    tracing::debug!("sender thread exiting");
}

/// Receiver thread: move bytes from the socket to the receive ring while
/// connected.
fn recv_loop(shared: &Shared, mut fill: Producer, settings: WorkerSettings) {
    let mut scratch = shared.pool.acquire(settings.recv_scratch_size);

    while shared.state() == ConnectionState::Connected {
        let room = fill.free_space().min(scratch.len());
        if room == 0 {
            thread::sleep(settings.idle_backoff);
            continue;
        }
        let Some(stream) = shared.stream() else {
            break;
        };

        match (&*stream).read(&mut scratch[..room]) {
            Ok(0) => {
                if shared.apply(ConnectionEvent::TransportFailed) {
                    tracing::info!("server closed the connection");
                }
                break;
            }
            Ok(n) => {
                // only this thread writes, so free space can only have grown
                let written = fill.try_write(&scratch[..n]);
                assert!(written, "receive ring shrank under its only producer");
                shared.counters.record_bytes_received(n);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if shared.apply(ConnectionEvent::TransportFailed) {
                    tracing::warn!(error = %e, "socket read failed");
                }
                break;
            }
        }
    }

    shared.pool.release(scratch);
    tracing::debug!("receiver thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use crate::framing::{FrameHeader, decode_sub_messages};

    const ALL_STATES: [ConnectionState; 6] = [
        ConnectionState::Init,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Closed,
        ConnectionState::TimedOut,
        ConnectionState::Error,
    ];

    const ALL_EVENTS: [ConnectionEvent; 8] = [
        ConnectionEvent::ConnectRequested,
        ConnectionEvent::ConnectSucceeded,
        ConnectionEvent::ConnectFailed,
        ConnectionEvent::DeadlineElapsed,
        ConnectionEvent::ResolveFailed,
        ConnectionEvent::TransportFailed,
        ConnectionEvent::ProtocolViolation,
        ConnectionEvent::CloseRequested,
    ];

    fn small_config() -> TransportConfig {
        TransportConfig {
            send_buffer_capacity: 4096,
            recv_buffer_capacity: 4096,
            idle_backoff_us: 200,
            recv_timeout_ms: 50,
            ..TransportConfig::default()
        }
    }

    fn connection() -> Connection {
        Connection::new(&small_config(), Arc::new(BlockPool::default()))
    }

    /// Tick until `state` is reached or two seconds pass.
    fn tick_until(conn: &mut Connection, state: ConnectionState) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while conn.state() != state && Instant::now() < deadline {
            conn.tick();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(conn.state(), state);
    }

    #[test]
    fn test_terminal_states_ignore_every_event() {
        for state in ALL_STATES.into_iter().filter(|s| s.is_terminal()) {
            for event in ALL_EVENTS {
                assert_eq!(state.on(event), None, "{state:?} + {event:?}");
            }
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionEvent as E;
        use ConnectionState as S;

        assert_eq!(S::Init.on(E::ConnectRequested), Some(S::Connecting));
        assert_eq!(S::Init.on(E::ConnectSucceeded), None);
        assert_eq!(S::Connecting.on(E::ConnectSucceeded), Some(S::Connected));
        assert_eq!(S::Connecting.on(E::ConnectFailed), Some(S::Closed));
        assert_eq!(S::Connecting.on(E::DeadlineElapsed), Some(S::TimedOut));
        assert_eq!(S::Connecting.on(E::ResolveFailed), Some(S::Error));
        assert_eq!(S::Connecting.on(E::TransportFailed), None);
        assert_eq!(S::Connected.on(E::TransportFailed), Some(S::Closed));
        assert_eq!(S::Connected.on(E::ProtocolViolation), Some(S::Closed));
        assert_eq!(S::Connected.on(E::DeadlineElapsed), None);
        assert_eq!(S::Connected.on(E::ConnectRequested), None);
    }

    #[test]
    fn test_state_cell_round_trips_every_state() {
        for state in ALL_STATES {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_state_cell_concurrent_events_apply_once() {
        let cell = Arc::new(StateCell::new(ConnectionState::Connected));
        let applied = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let cell = Arc::clone(&cell);
                let applied = Arc::clone(&applied);
                thread::spawn(move || {
                    let event = if i % 2 == 0 {
                        ConnectionEvent::TransportFailed
                    } else {
                        ConnectionEvent::CloseRequested
                    };
                    if cell.apply(event).is_some() {
                        applied.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(cell.load(), ConnectionState::Closed);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unresponsive_connect_times_out_without_callback() {
        let mut conn = connection();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        conn.on_connected = Some(Box::new(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let timeout = Duration::from_millis(50);
        let started = Instant::now();
        let _never_answers = conn.begin_connect(timeout).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        tick_until(&mut conn, ConnectionState::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout);
        assert!(
            elapsed < timeout + Duration::from_secs(1),
            "took {elapsed:?}"
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_success_after_timeout_is_discarded() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = connection();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        conn.on_connected = Some(Box::new(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let result_tx = conn.begin_connect(Duration::ZERO).unwrap();
        conn.tick();
        assert_eq!(conn.state(), ConnectionState::TimedOut);

        let stream = TcpStream::connect(addr).unwrap();
        // the receiver was dropped on timeout
        assert!(result_tx.send(Ok(stream)).is_err());
        conn.tick();

        assert_eq!(conn.state(), ConnectionState::TimedOut);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refused_connect_closes() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let mut conn = connection();
        conn.connect("127.0.0.1", port, Duration::from_secs(2))
            .unwrap();
        tick_until(&mut conn, ConnectionState::Closed);
    }

    #[test]
    fn test_connector_timeout_reports_timed_out() {
        let mut conn = connection();
        let result_tx = conn.begin_connect(Duration::from_secs(5)).unwrap();
        result_tx
            .send(Err(ConnectFailure::Connect(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection timed out",
            ))))
            .unwrap();
        conn.tick();
        assert_eq!(conn.state(), ConnectionState::TimedOut);
    }

    #[test]
    fn test_connect_failure_after_deadline_reports_timed_out() {
        let mut conn = connection();
        let result_tx = conn.begin_connect(Duration::ZERO).unwrap();
        result_tx
            .send(Err(ConnectFailure::Connect(io::Error::other("gave up"))))
            .unwrap();
        conn.tick();
        assert_eq!(conn.state(), ConnectionState::TimedOut);
    }

    #[test]
    fn test_batch_command_id_is_rejected_for_control_frames() {
        let mut conn = connection();
        let _tx = conn.begin_connect(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            conn.send_command(0, b"x"),
            Err(TransportError::InvalidCommand(0))
        ));
        assert_eq!(conn.pending_send_bytes(), 0);

        conn.send_command(1, b"x").unwrap();
        assert_eq!(conn.pending_send_bytes(), HEADER_SIZE + 1);
    }

    #[test]
    fn test_unresolvable_host_enters_error() {
        let mut conn = connection();
        let result_tx = conn.begin_connect(Duration::from_secs(5)).unwrap();
        result_tx
            .send(Err(ConnectFailure::Resolve(io::Error::new(
                io::ErrorKind::NotFound,
                "unknown host",
            ))))
            .unwrap();
        conn.tick();
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(matches!(
            conn.send(b"late"),
            Err(TransportError::NotConnected(ConnectionState::Error))
        ));
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let mut conn = connection();
        let _tx = conn.begin_connect(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            conn.connect("127.0.0.1", 1, Duration::from_secs(5)),
            Err(TransportError::InvalidState(ConnectionState::Connecting))
        ));
    }

    #[test]
    fn test_send_before_connect_is_rejected() {
        let mut conn = connection();
        assert!(matches!(
            conn.send(b"hello"),
            Err(TransportError::NotConnected(ConnectionState::Init))
        ));
    }

    #[test]
    fn test_send_while_connecting_buffers_until_full() {
        let mut conn = connection();
        let _tx = conn.begin_connect(Duration::from_secs(5)).unwrap();

        let payload = [7u8; 1000];
        let frame_len = HEADER_SIZE + 2 + payload.len();
        let fits = 4096 / frame_len;
        for _ in 0..fits {
            conn.send(&payload).unwrap();
        }
        assert_eq!(conn.pending_send_bytes(), fits * frame_len);
        assert!(matches!(conn.send(&payload), Err(TransportError::SendBufferFull)));
    }

    #[test]
    fn test_frame_larger_than_ring_is_rejected() {
        let mut conn = connection();
        let _tx = conn.begin_connect(Duration::from_secs(5)).unwrap();
        let payload = vec![0u8; 5000];
        assert!(matches!(
            conn.send(&payload),
            Err(TransportError::FrameTooLarge {
                capacity: 4096,
                ..
            })
        ));
        assert_eq!(conn.pending_send_bytes(), 0);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut conn = connection();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_connected_session_exchanges_frames() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (header_tx, header_rx) = mpsc::channel();

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut raw = [0u8; HEADER_SIZE];
            peer.read_exact(&mut raw).unwrap();
            let header = FrameHeader::decode(&raw).unwrap();
            let mut body = vec![0u8; header.body_len as usize];
            peer.read_exact(&mut body).unwrap();
            header_tx.send((header, body)).unwrap();

            let reply = FrameHeader {
                body_len: 4,
                command: 0,
                sequence: 1,
            };
            peer.write_all(&reply.encode()).unwrap();
            peer.write_all(&[0, 2, b'o', b'k']).unwrap();
            peer
        });

        let mut conn = connection();
        let connected = Arc::new(AtomicUsize::new(0));
        let connected_cb = Arc::clone(&connected);
        conn.connect_with_callback("127.0.0.1", port, Duration::from_secs(2), move || {
            connected_cb.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tick_until(&mut conn, ConnectionState::Connected);
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        conn.send(b"hi").unwrap();
        let (header, body) = header_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(header.sequence, 1);
        let subs: Vec<_> = decode_sub_messages(&body)
            .map(|r| body[r.unwrap()].to_vec())
            .collect();
        assert_eq!(subs, vec![b"hi".to_vec()]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        conn.set_inbound_handler(move |msg| sink.lock().push(msg.to_vec()));

        let deadline = Instant::now() + Duration::from_secs(2);
        while received.lock().is_empty() && Instant::now() < deadline {
            conn.tick();
            conn.poll_inbound();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*received.lock(), vec![b"ok".to_vec()]);

        let _peer = server.join().unwrap();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }
}
