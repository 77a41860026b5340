//! Connection client for tuber servers

use std::future::Future;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use url::Url;

use tuber_protocol::{Codec, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use tuber_utils::{socket_path, Result, TuberError};

use super::handler::MessageSender;

/// Queue depth for both directions
const CHANNEL_CAPACITY: usize = 100;

/// Longest pause between reconnect attempts
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Default limit on a single dial
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait alias for streams that can be used with Framed
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTrait for T {}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Client connection to a tuber server
pub struct Connection<C: Codec> {
    /// Connection address URL (unix://path or tcp://host:port)
    connect_addr: String,
    /// Shared with the I/O task of the current stream, which marks it
    /// disconnected on exit. Each stream gets a fresh cell.
    state: Arc<AtomicU8>,
    codec: Arc<C>,
    max_frame_size: usize,
    connect_timeout: Duration,
    /// Encoded outgoing payloads
    tx: mpsc::Sender<Bytes>,
    /// Decoded incoming messages
    rx: mpsc::Receiver<C::Message>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl<C: Codec> Connection<C> {
    /// Create a connection to the default Unix socket (not yet connected)
    pub fn new(codec: C) -> Self {
        let addr = format!("unix://{}", socket_path().to_string_lossy());
        Self::with_addr(addr, codec)
    }

    /// Create with custom connection address
    pub fn with_addr(addr: impl Into<String>, codec: C) -> Self {
        let (tx, _) = mpsc::channel(1);
        let (_, rx) = mpsc::channel(1);

        Self {
            connect_addr: addr.into(),
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
            codec: Arc::new(codec),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tx,
            rx,
            task_handle: None,
        }
    }

    /// Must match the server's frame ceiling
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.connect_addr
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self
                .task_handle
                .as_ref()
                .map_or(false, |handle| !handle.is_finished())
    }

    /// Connect to the server; a no-op while the current stream is live
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_live() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.attach(stream);
        Ok(())
    }

    /// Connect, retrying retryable failures with doubling backoff
    ///
    /// Makes at most `attempts` tries (at least one) and returns the last
    /// error. Errors that will not go away on their own, such as a malformed
    /// address, return at once.
    pub async fn connect_with_retry(&mut self, attempts: u32, backoff: Duration) -> Result<()> {
        let attempts = attempts.max(1);
        let mut delay = backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    tracing::warn!(
                        attempt,
                        addr = %self.connect_addr,
                        "connect failed: {}, retrying in {:?}",
                        e,
                        delay
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Disconnect from server
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Send a message to the server
    pub async fn send(&self, msg: &C::Message) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(TuberError::connection("Not connected"));
        }
        self.sender().send(msg).await
    }

    /// Receive next message from server; `None` once the connection ends
    pub async fn recv(&mut self) -> Option<C::Message> {
        self.rx.recv().await
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Option<C::Message> {
        self.rx.try_recv().ok()
    }

    /// Get a message sender that can be cloned
    pub fn sender(&self) -> MessageSender<C> {
        MessageSender::new(self.tx.clone(), Arc::clone(&self.codec))
    }

    async fn open_stream(&self) -> Result<Box<dyn StreamTrait>> {
        if self.connect_addr.starts_with("tcp://") {
            let url = Url::parse(&self.connect_addr).map_err(|e| {
                TuberError::config(format!("Invalid TCP URL '{}': {}", self.connect_addr, e))
            })?;
            let host = url
                .host_str()
                .ok_or_else(|| TuberError::config("Missing host in TCP URL"))?;
            let port = url
                .port()
                .ok_or_else(|| TuberError::config("Missing port in TCP URL"))?;

            let addr = format!("{}:{}", host, port);
            let stream = dial_within(self.connect_timeout, TcpStream::connect(&addr))
                .await?
                .map_err(|e| {
                    TuberError::Connection(format!("Failed to connect to {}: {}", addr, e))
                })?;
            stream.set_nodelay(true)?;
            return Ok(Box::new(stream));
        }

        self.open_unix_stream().await
    }

    #[cfg(unix)]
    async fn open_unix_stream(&self) -> Result<Box<dyn StreamTrait>> {
        // Either unix:// prefix or raw path
        let path_str = if self.connect_addr.starts_with("unix://") {
            let url = Url::parse(&self.connect_addr)
                .map_err(|e| TuberError::config(format!("Invalid Unix URL: {}", e)))?;
            url.path().to_string()
        } else {
            self.connect_addr.clone()
        };
        let path = PathBuf::from(path_str);

        let stream = dial_within(self.connect_timeout, UnixStream::connect(&path))
            .await?
            .map_err(|e| {
                TuberError::Connection(format!("Failed to connect to {}: {}", path.display(), e))
            })?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    async fn open_unix_stream(&self) -> Result<Box<dyn StreamTrait>> {
        Err(TuberError::config(format!(
            "Unsupported address '{}'",
            self.connect_addr
        )))
    }

    fn attach(&mut self, stream: Box<dyn StreamTrait>) {
        let framed = Framed::new(stream, FrameCodec::with_max_frame_size(self.max_frame_size));

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<C::Message>(CHANNEL_CAPACITY);
        self.tx = outgoing_tx;
        self.rx = incoming_rx;

        let state = Arc::new(AtomicU8::new(ConnectionState::Connected as u8));
        let handle = tokio::spawn(Self::connection_task(
            framed,
            Arc::clone(&self.codec),
            outgoing_rx,
            incoming_tx,
            Arc::clone(&state),
        ));
        if let Some(old) = self.task_handle.replace(handle) {
            old.abort();
        }

        self.state = state;
        tracing::debug!(addr = %self.connect_addr, "connected");
    }

    /// Background task that handles the actual socket I/O
    async fn connection_task(
        mut framed: Framed<Box<dyn StreamTrait>, FrameCodec>,
        codec: Arc<C>,
        mut outgoing: mpsc::Receiver<Bytes>,
        incoming: mpsc::Sender<C::Message>,
        state: Arc<AtomicU8>,
    ) {
        loop {
            tokio::select! {
                // Handle outgoing messages
                Some(payload) = outgoing.recv() => {
                    if let Err(e) = framed.send(payload).await {
                        tracing::error!("Failed to send message: {}", e);
                        break;
                    }
                }

                // Handle incoming messages
                result = framed.next() => {
                    match result {
                        Some(Ok(payload)) => {
                            let msg = match codec.decode(&payload) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::error!("Failed to decode message: {}", e);
                                    break;
                                }
                            };
                            if incoming.send(msg).await.is_err() {
                                tracing::debug!("Incoming channel closed, receiver dropped");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("Failed to receive message: {}", e);
                            break;
                        }
                        None => {
                            tracing::info!("Server closed connection");
                            break;
                        }
                    }
                }
            }
        }

        // Before `incoming` drops, so a caller woken by `recv() == None`
        // already sees the new state
        state.store(ConnectionState::Disconnected as u8, Ordering::Release);
    }
}

/// Bound a dial by `limit`
async fn dial_within<T>(limit: Duration, dial: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(limit, dial)
        .await
        .map_err(|_| TuberError::ConnectionTimeout {
            seconds: limit.as_secs_f64().ceil() as u64,
        })
}

impl<C: Codec> Drop for Connection<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tokio::net::{TcpListener, UnixListener};
    use tokio::time::timeout;
    use tuber_protocol::{read_frame, write_frame, BincodeCodec, JsonCodec};
    use tuber_server::{bind, Handler, Listener, Manager, ManagerConfig, Session};

    const WAIT: Duration = Duration::from_secs(5);

    struct Echo;

    #[async_trait]
    impl Handler<JsonCodec> for Echo {
        async fn on_msg(&mut self, session: &Arc<Session<JsonCodec>>, message: Value) {
            let _ = session.send(&message).await;
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Chat {
        Say(String),
        Bye,
    }

    #[test]
    fn test_connection_state_initial() {
        let conn = Connection::with_addr("tcp://127.0.0.1:1", JsonCodec::<Value>::new());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.addr(), "tcp://127.0.0.1:1");
    }

    #[test]
    fn test_default_addr_is_unix_socket() {
        let conn = Connection::new(JsonCodec::<Value>::new());
        assert!(conn.addr().starts_with("unix://"));
        assert!(conn.addr().ends_with("tuber.sock"));
    }

    #[tokio::test]
    async fn test_connect_no_server() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let mut conn = Connection::with_addr(
            format!("unix://{}", path.display()),
            JsonCodec::<Value>::new(),
        );
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_tcp_url() {
        let mut conn = Connection::with_addr("tcp://127.0.0.1", JsonCodec::<Value>::new());
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, TuberError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let conn = Connection::with_addr("tcp://127.0.0.1:1", JsonCodec::<Value>::new());
        assert!(conn.send(&json!("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let mut conn = Connection::with_addr("tcp://127.0.0.1:1", JsonCodec::<Value>::new());
        assert!(conn.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let mut conn = Connection::with_addr("tcp://127.0.0.1:1", JsonCodec::<Value>::new());
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unix_frames_on_the_wire() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
            write_frame(&mut stream, &frame, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            frame
        });

        let mut conn = Connection::with_addr(
            format!("unix://{}", socket_path.display()),
            JsonCodec::<Value>::new(),
        );
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        // Connect again is a no-op
        conn.connect().await.unwrap();

        conn.send(&json!("hello")).await.unwrap();
        let echoed = timeout(WAIT, conn.recv()).await.unwrap().unwrap();
        assert_eq!(echoed, json!("hello"));

        let raw = peer.await.unwrap();
        assert_eq!(raw.as_ref(), b"\"hello\"");

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_recv_ends_when_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut conn = Connection::with_addr(format!("tcp://{}", addr), JsonCodec::<Value>::new());
        conn.connect().await.unwrap();
        assert!(timeout(WAIT, conn.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_through_manager() {
        let manager = Manager::new(ManagerConfig::default(), JsonCodec::new(), Echo);
        let listener = bind("tcp", "127.0.0.1:0").await.unwrap();
        let addr = format!("tcp://{}", listener.local_addr());
        manager.add_listener(listener).unwrap();
        manager.start().unwrap();

        let mut conn = Connection::with_addr(addr, JsonCodec::<Value>::new());
        conn.connect().await.unwrap();

        let sender = conn.sender();
        sender.send(&json!({"seq": 1})).await.unwrap();
        conn.send(&json!({"seq": 2})).await.unwrap();

        assert_eq!(timeout(WAIT, conn.recv()).await.unwrap().unwrap(), json!({"seq": 1}));
        assert_eq!(timeout(WAIT, conn.recv()).await.unwrap().unwrap(), json!({"seq": 2}));
    }

    #[tokio::test]
    async fn test_typed_messages_with_bincode() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_codec = BincodeCodec::<Chat>::new();

        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
            let reply = server_codec.encode(&Chat::Bye).unwrap();
            write_frame(&mut stream, &reply, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            server_codec.decode(&frame).unwrap()
        });

        let mut conn = Connection::with_addr(format!("tcp://{}", addr), BincodeCodec::<Chat>::new());
        conn.connect().await.unwrap();
        conn.send(&Chat::Say("hi".into())).await.unwrap();

        assert_eq!(timeout(WAIT, conn.recv()).await.unwrap(), Some(Chat::Bye));
        assert_eq!(peer.await.unwrap(), Chat::Say("hi".into()));
    }

    #[tokio::test]
    async fn test_connect_with_retry_waits_for_server() {
        // Reserve a port, free it, then bring a server up on it late
        let addr = {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap()
        };

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });

        let mut conn = Connection::with_addr(format!("tcp://{}", addr), JsonCodec::<Value>::new());
        conn.connect_with_retry(20, Duration::from_millis(25))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        let _stream = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let addr = {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap()
        };

        let mut conn = Connection::with_addr(format!("tcp://{}", addr), JsonCodec::<Value>::new());
        let err = conn
            .connect_with_retry(3, Duration::from_millis(1))
            .await
            .unwrap_err();
        // The last dial error comes back, not a generic one
        match err {
            TuberError::Connection(msg) => assert!(msg.contains(&addr.to_string())),
            other => panic!("expected Connection error, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));

        let server = {
            let accepts = Arc::clone(&accepts);
            tokio::spawn(async move {
                let (first, _) = listener.accept().await.unwrap();
                accepts.fetch_add(1, Ordering::SeqCst);
                drop(first);

                let (mut second, _) = listener.accept().await.unwrap();
                accepts.fetch_add(1, Ordering::SeqCst);
                read_frame(&mut second, DEFAULT_MAX_FRAME_SIZE).await.unwrap()
            })
        };

        let mut conn = Connection::with_addr(format!("tcp://{}", addr), JsonCodec::<Value>::new());
        conn.connect().await.unwrap();
        assert!(timeout(WAIT, conn.recv()).await.unwrap().is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.send(&json!("lost")).await.is_err());

        conn.connect_with_retry(3, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.send(&json!("again")).await.unwrap();

        let frame = timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"\"again\"");
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dial_timeout_is_retryable() {
        let err = dial_within(Duration::from_millis(20), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(err, TuberError::ConnectionTimeout { seconds: 1 }));
        assert!(err.is_retryable());
    }
}
