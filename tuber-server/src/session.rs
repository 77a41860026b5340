//! Per-connection sessions
//!
//! A session owns one accepted transport and drives it with two tasks: the
//! read task turns frames into decoded messages on the manager's event
//! queue, and the write task drains the session's bounded send queue onto
//! the wire. A supervisor waits for both, releases the transport and emits
//! the single `Close` event.
//!
//! State only moves forward:
//!
//! ```text
//! Open ──close()──────────▶ ClosingLocal ──┐
//!   │                                      ├──▶ Closed
//!   └──read/write failure──▶ ClosingRemote ┘
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tuber_protocol::{read_frame, write_frame, Codec, CodecError, FrameError};

use crate::listener::{IncomingConnection, Transport};

/// How long queued frames may take to flush after a local close when no
/// idle timeout is configured
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Unique session identifier, assigned at accept time and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    /// `close()` was called by the owner
    ClosingLocal = 1,
    /// The peer went away or an I/O, framing or decode error occurred
    ClosingRemote = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::ClosingLocal,
            2 => SessionState::ClosingRemote,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended; the first recorded cause wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the application
    Local,
    /// The peer closed the stream on a frame boundary
    PeerClosed,
    /// A read or write missed its idle deadline
    Timeout,
    /// Malformed frame or undecodable payload
    Protocol(String),
    /// Any other transport failure
    Io(String),
}

impl CloseReason {
    fn from_frame_error(err: &FrameError) -> Self {
        match err {
            e if e.is_clean_eof() => CloseReason::PeerClosed,
            e if e.is_timeout() => CloseReason::Timeout,
            FrameError::ShortHeader { .. } | FrameError::Oversized { .. } => {
                CloseReason::Protocol(err.to_string())
            }
            FrameError::Io(e) => CloseReason::Io(e.to_string()),
        }
    }
}

/// Session errors surfaced to the application
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Send queue is full")]
    QueueFull,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Payload too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Event produced by sessions for the manager's dispatch task
pub enum SessionEvent<C: Codec> {
    Open(Arc<Session<C>>),
    Close(Arc<Session<C>>),
    Msg(Arc<Session<C>>, C::Message),
}

impl<C: Codec> SessionEvent<C> {
    pub fn session(&self) -> &Arc<Session<C>> {
        match self {
            SessionEvent::Open(s) | SessionEvent::Close(s) | SessionEvent::Msg(s, _) => s,
        }
    }
}

impl<C: Codec> fmt::Debug for SessionEvent<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            SessionEvent::Open(_) => "Open",
            SessionEvent::Close(_) => "Close",
            SessionEvent::Msg(..) => "Msg",
        };
        f.debug_struct("SessionEvent")
            .field("kind", &kind)
            .field("session_id", &self.session().id())
            .finish()
    }
}

/// Settings shared by every session of one manager
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSettings {
    pub idle_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub send_queue_capacity: usize,
}

type TransportReader = ReadHalf<Box<dyn Transport>>;
type TransportWriter = WriteHalf<Box<dyn Transport>>;

/// One managed connection
pub struct Session<C: Codec> {
    id: SessionId,
    peer_addr: String,
    state: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    /// Raised by `close()` or by either task failing; stops both tasks
    shutdown: CancellationToken,
    send_tx: mpsc::Sender<Bytes>,
    /// Taken by `start()`
    send_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    codec: Arc<C>,
    events: mpsc::Sender<SessionEvent<C>>,
    settings: SessionSettings,
}

impl<C: Codec> Session<C> {
    pub(crate) fn new(
        id: SessionId,
        conn: IncomingConnection,
        codec: Arc<C>,
        events: mpsc::Sender<SessionEvent<C>>,
        settings: SessionSettings,
    ) -> Self {
        let (transport, peer_addr) = conn.into_parts();
        let (send_tx, send_rx) = mpsc::channel(settings.send_queue_capacity.max(1));
        Self {
            id,
            peer_addr,
            state: AtomicU8::new(SessionState::Open as u8),
            close_reason: Mutex::new(None),
            shutdown: CancellationToken::new(),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            transport: Mutex::new(Some(transport)),
            codec,
            events,
            settings,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once the session has left `Open`
    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Encode `message` and queue it for the write task
    ///
    /// Waits while the send queue is full. Fails with [`SessionError::Closed`]
    /// once the session is closing; nothing is queued in that case.
    pub async fn send(&self, message: &C::Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let payload = self.codec.encode(message)?;
        self.enqueue(payload).await
    }

    /// Like [`Session::send`] but fails with [`SessionError::QueueFull`]
    /// instead of waiting
    pub fn try_send(&self, message: &C::Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let payload = self.codec.encode(message)?;
        self.check_size(&payload)?;
        self.send_tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Queue an already-encoded payload
    pub async fn send_raw(&self, payload: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.enqueue(payload).await
    }

    /// Begin closing the session; later calls are no-ops
    ///
    /// Frames queued before the call are still flushed, then the transport
    /// is shut down and a single `Close` event follows.
    pub fn close(&self) {
        if self.transition(SessionState::ClosingLocal) {
            self.record_reason(CloseReason::Local);
            debug!(session_id = %self.id, "Session closing locally");
            self.shutdown.cancel();
        }
    }

    /// Emit `Open`, then launch the read, write and supervisor tasks
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let transport = self
            .transport
            .lock()
            .take()
            .ok_or(SessionError::AlreadyStarted)?;
        let send_rx = self
            .send_rx
            .lock()
            .take()
            .ok_or(SessionError::AlreadyStarted)?;

        // Open must be queued before any Msg from the read task
        self.events
            .send(SessionEvent::Open(Arc::clone(self)))
            .await
            .map_err(|_| SessionError::Closed)?;

        let (reader, writer) = tokio::io::split(transport);
        let read_task = tokio::spawn(Arc::clone(self).read_loop(reader));
        let write_task = tokio::spawn(Arc::clone(self).write_loop(writer, send_rx));
        tokio::spawn(Arc::clone(self).supervise(read_task, write_task));
        Ok(())
    }

    async fn enqueue(&self, payload: Bytes) -> Result<(), SessionError> {
        self.check_size(&payload)?;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SessionError::Closed),
            result = self.send_tx.send(payload) => result.map_err(|_| SessionError::Closed),
        }
    }

    fn check_size(&self, payload: &Bytes) -> Result<(), SessionError> {
        if payload.len() > self.settings.max_frame_size {
            return Err(SessionError::Oversized {
                size: payload.len(),
                max: self.settings.max_frame_size,
            });
        }
        Ok(())
    }

    /// CAS `Open -> to`; false if the session already left `Open`
    fn transition(&self, to: SessionState) -> bool {
        self.state
            .compare_exchange(
                SessionState::Open as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn record_reason(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Mark the session as failed and stop both tasks
    fn fail(&self, reason: CloseReason) {
        if self.transition(SessionState::ClosingRemote) {
            self.record_reason(reason);
        }
        self.shutdown.cancel();
    }

    fn log_io_failure(&self, direction: &str, err: &FrameError) {
        if self.state() == SessionState::ClosingLocal || err.is_clean_eof() {
            debug!(session_id = %self.id, peer = %self.peer_addr, "session {} ended: {}", direction, err);
        } else {
            warn!(session_id = %self.id, peer = %self.peer_addr, "session {} err: {}", direction, err);
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: TransportReader) -> TransportReader {
        while !self.is_closed() {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = with_deadline(
                    self.settings.idle_timeout,
                    "read",
                    read_frame(&mut reader, self.settings.max_frame_size),
                ) => result,
            };

            let payload = match result {
                Ok(payload) => payload,
                Err(e) => {
                    self.log_io_failure("read", &e);
                    self.fail(CloseReason::from_frame_error(&e));
                    break;
                }
            };

            let message = match self.codec.decode(&payload) {
                Ok(message) => message,
                Err(e) => {
                    error!(session_id = %self.id, peer = %self.peer_addr, "decode msg error: {}", e);
                    self.fail(CloseReason::Protocol(e.to_string()));
                    break;
                }
            };

            if self
                .events
                .send(SessionEvent::Msg(Arc::clone(&self), message))
                .await
                .is_err()
            {
                debug!(session_id = %self.id, "Event queue closed, stopping read loop");
                self.fail(CloseReason::Io("event queue closed".to_string()));
                break;
            }
        }

        // Unblock the write task whichever way we got here
        self.shutdown.cancel();
        reader
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: TransportWriter,
        mut queue: mpsc::Receiver<Bytes>,
    ) -> TransportWriter {
        let linger = self.settings.idle_timeout.unwrap_or(CLOSE_LINGER);
        let mut healthy = true;

        loop {
            let payload = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                payload = queue.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let write = self.write_one(&mut writer, &payload, self.settings.idle_timeout);
            tokio::pin!(write);
            let result = tokio::select! {
                result = &mut write => result,
                _ = self.shutdown.cancelled() => {
                    // A local close lets the frame in flight finish
                    if self.state() != SessionState::ClosingLocal {
                        healthy = false;
                        break;
                    }
                    match tokio::time::timeout(linger, &mut write).await {
                        Ok(result) => result,
                        Err(_) => {
                            healthy = false;
                            break;
                        }
                    }
                }
            };

            if let Err(e) = result {
                self.log_io_failure("write", &e);
                self.fail(CloseReason::from_frame_error(&e));
                healthy = false;
                break;
            }
        }

        // Frames queued before a local close still go out
        if healthy && self.state() == SessionState::ClosingLocal {
            while let Ok(payload) = queue.try_recv() {
                if let Err(e) = self.write_one(&mut writer, &payload, Some(linger)).await {
                    self.log_io_failure("write", &e);
                    break;
                }
            }
        }

        self.shutdown.cancel();
        if let Err(e) = writer.shutdown().await {
            debug!(session_id = %self.id, "transport shutdown: {}", e);
        }
        writer
    }

    async fn write_one(
        &self,
        writer: &mut TransportWriter,
        payload: &[u8],
        deadline: Option<Duration>,
    ) -> Result<(), FrameError> {
        with_deadline(
            deadline,
            "write",
            write_frame(writer, payload, self.settings.max_frame_size),
        )
        .await
    }

    /// Wait for both tasks, release the transport, emit exactly one `Close`
    async fn supervise(
        self: Arc<Self>,
        read_task: JoinHandle<TransportReader>,
        write_task: JoinHandle<TransportWriter>,
    ) {
        let (reader, writer) = tokio::join!(read_task, write_task);
        match (reader, writer) {
            (Ok(reader), Ok(writer)) => drop(reader.unsplit(writer)),
            (reader, writer) => {
                error!(
                    session_id = %self.id,
                    read_ok = reader.is_ok(),
                    write_ok = writer.is_ok(),
                    "session task ended abnormally"
                );
            }
        }

        self.record_reason(CloseReason::PeerClosed);
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        info!(
            session_id = %self.id,
            peer = %self.peer_addr,
            reason = ?self.close_reason(),
            "session transport released"
        );

        if self
            .events
            .send(SessionEvent::Close(Arc::clone(&self)))
            .await
            .is_err()
        {
            debug!(session_id = %self.id, "Event queue closed before Close could be delivered");
        }
    }
}

impl<C: Codec> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Run one I/O operation under an optional per-operation deadline
async fn with_deadline<T, F>(limit: Option<Duration>, op: &str, fut: F) -> Result<T, FrameError>
where
    F: Future<Output = Result<T, FrameError>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} deadline of {:?} exceeded", op, limit),
            ))),
        },
        None => fut.await,
    }
}
