//! Session manager
//!
//! The manager owns the listeners, admits connections against the
//! connection ceiling, assigns session ids and runs the single dispatch task
//! that feeds every session event to the [`Handler`] in arrival order.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tuber_protocol::{Codec, DEFAULT_MAX_FRAME_SIZE};

use crate::handler::Handler;
use crate::listener::{IncomingConnection, Listener, ListenerError};
use crate::session::{Session, SessionError, SessionEvent, SessionId, SessionSettings};

/// Connection ceiling used when none (or zero) is configured
pub const DEFAULT_CONNECT_LIMIT: usize = 50_000;

/// Idle deadline used by [`ManagerConfig::default`]
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Manager already started")]
    AlreadyStarted,

    #[error("Connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
}

/// Manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// The first session gets `session_start_id + 1`
    pub session_start_id: u64,
    /// Maximum concurrent sessions; 0 means the default
    pub connect_limit: usize,
    /// Per read/write deadline in seconds; 0 disables it
    pub idle_timeout_secs: u64,
    pub max_frame_size: usize,
    pub event_queue_capacity: usize,
    pub send_queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_start_id: 0,
            connect_limit: DEFAULT_CONNECT_LIMIT,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_queue_capacity: 1024,
            send_queue_capacity: 32,
        }
    }
}

impl ManagerConfig {
    /// Replace zero limits and capacities with usable values
    pub fn normalised(mut self) -> Self {
        if self.connect_limit == 0 {
            self.connect_limit = DEFAULT_CONNECT_LIMIT;
        }
        if self.max_frame_size == 0 {
            self.max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        }
        self.event_queue_capacity = self.event_queue_capacity.max(1);
        self.send_queue_capacity = self.send_queue_capacity.max(1);
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: self.idle_timeout(),
            max_frame_size: self.max_frame_size,
            send_queue_capacity: self.send_queue_capacity,
        }
    }
}

/// State reachable from listener callbacks and the dispatch task
struct Shared<C: Codec> {
    config: ManagerConfig,
    codec: Arc<C>,
    next_id: AtomicU64,
    /// Admitted sessions that have not yet been dispatched as closed
    live: AtomicUsize,
    sessions: DashMap<SessionId, Arc<Session<C>>>,
    events: mpsc::Sender<SessionEvent<C>>,
}

impl<C: Codec> Shared<C> {
    async fn accept(&self, conn: IncomingConnection) -> Result<SessionId, ManagerError> {
        let limit = self.config.connect_limit;
        if self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .is_err()
        {
            // Dropping the connection closes it; no session is created
            warn!("connection limit {} reached, rejecting {}", limit, conn.peer_addr());
            return Err(ManagerError::ConnectionLimit(limit));
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1));
        let session = Arc::new(Session::new(
            id,
            conn,
            Arc::clone(&self.codec),
            self.events.clone(),
            self.config.session_settings(),
        ));

        if let Err(e) = session.start().await {
            self.live.fetch_sub(1, Ordering::AcqRel);
            warn!(session_id = %id, "session start failed: {}", e);
            return Err(e.into());
        }
        Ok(id)
    }
}

type Pending<C> = (mpsc::Receiver<SessionEvent<C>>, Box<dyn Handler<C>>);

/// Owns listeners, sessions and the dispatch task
pub struct Manager<C: Codec> {
    shared: Arc<Shared<C>>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    /// Handed to the dispatch task by `start()`
    pending: Mutex<Option<Pending<C>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<C: Codec> Manager<C> {
    pub fn new(config: ManagerConfig, codec: C, handler: impl Handler<C>) -> Self {
        let config = config.normalised();
        let (events, rx) = mpsc::channel(config.event_queue_capacity);
        let handler: Box<dyn Handler<C>> = Box::new(handler);
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(config.session_start_id),
            config,
            codec: Arc::new(codec),
            live: AtomicUsize::new(0),
            sessions: DashMap::new(),
            events,
        });

        Self {
            shared,
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(Some((rx, handler))),
            dispatch: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Attach a listener; it starts with the manager, or immediately if
    /// the manager is already running
    pub fn add_listener(&self, listener: impl Listener + 'static) -> Result<(), ManagerError> {
        let weak: Weak<Shared<C>> = Arc::downgrade(&self.shared);
        listener.on_new_connection(Arc::new(move |conn: IncomingConnection| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => {
                        let _ = shared.accept(conn).await;
                    }
                    None => debug!("manager gone, dropping {}", conn.peer_addr()),
                }
            }
            .boxed()
        }));

        let listener: Arc<dyn Listener> = Arc::new(listener);
        if self.started.load(Ordering::Acquire) {
            listener.start()?;
        }
        self.listeners.lock().push(listener);
        Ok(())
    }

    /// Spawn the dispatch task, then start every listener
    ///
    /// A listener that fails to start does not hold back the others; the
    /// first failure is returned once all have been tried.
    pub fn start(&self) -> Result<(), ManagerError> {
        let (events, handler) = self
            .pending
            .lock()
            .take()
            .ok_or(ManagerError::AlreadyStarted)?;
        *self.dispatch.lock() = Some(tokio::spawn(dispatch(
            Arc::clone(&self.shared),
            events,
            handler,
        )));
        self.started.store(true, Ordering::Release);

        let listeners = self.listeners.lock();
        let mut first_err = None;
        for listener in listeners.iter() {
            if let Err(e) = listener.start() {
                error!(addr = %listener.local_addr(), "listener failed to start: {}", e);
                first_err.get_or_insert(e);
            }
        }
        info!(
            listeners = listeners.len(),
            connect_limit = self.shared.config.connect_limit,
            "manager started"
        );
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Admit a connection accepted outside the attached listeners
    pub async fn accept_connection(
        &self,
        conn: IncomingConnection,
    ) -> Result<SessionId, ManagerError> {
        self.shared.accept(conn).await
    }

    /// Stop accepting; existing sessions keep running
    pub fn shutdown(&self) {
        for listener in self.listeners.lock().iter() {
            listener.stop();
        }
        info!("manager shutdown, {} sessions still live", self.session_count());
    }

    /// Close every registered session
    pub fn close_all(&self) {
        for entry in self.shared.sessions.iter() {
            entry.value().close();
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        self.shared.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Snapshot of the registered sessions
    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        self.shared
            .sessions
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    /// Sessions whose Open has been dispatched and Close has not
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Admitted sessions, including ones whose Open is still queued
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }
}

impl<C: Codec> Drop for Manager<C> {
    fn drop(&mut self) {
        for listener in self.listeners.get_mut().iter() {
            listener.stop();
        }
        if let Some(task) = self.dispatch.get_mut().take() {
            task.abort();
        }
    }
}

async fn dispatch<C: Codec>(
    shared: Arc<Shared<C>>,
    mut events: mpsc::Receiver<SessionEvent<C>>,
    mut handler: Box<dyn Handler<C>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Open(session) => {
                shared.sessions.insert(session.id(), Arc::clone(&session));
                info!(session_id = %session.id(), peer = %session.peer_addr(), "session open");
                guarded("on_session_open", session.id(), handler.on_session_open(&session)).await;
            }
            SessionEvent::Close(session) => {
                shared.sessions.remove(&session.id());
                shared.live.fetch_sub(1, Ordering::AcqRel);
                info!(
                    session_id = %session.id(),
                    reason = ?session.close_reason(),
                    "session close"
                );
                guarded("on_session_close", session.id(), handler.on_session_close(&session)).await;
            }
            SessionEvent::Msg(session, message) => {
                guarded("on_msg", session.id(), handler.on_msg(&session, message)).await;
            }
        }
    }
    debug!("dispatch loop finished");
}

/// Run one handler callback, logging instead of propagating a panic
async fn guarded<F: Future<Output = ()>>(callback: &str, id: SessionId, fut: F) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        error!(
            session_id = %id,
            "handler {} panicked: {}",
            callback,
            panic_message(&*panic)
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::bind;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;
    use tuber_protocol::{read_frame, write_frame, JsonCodec};

    use serde_json::{json, Value};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Open(u64),
        Msg(u64, Value),
        Close(u64),
    }

    struct Recorder {
        seen: mpsc::UnboundedSender<Seen>,
    }

    #[async_trait]
    impl Handler<JsonCodec> for Recorder {
        async fn on_session_open(&mut self, session: &Arc<Session<JsonCodec>>) {
            let _ = self.seen.send(Seen::Open(session.id().value()));
        }

        async fn on_session_close(&mut self, session: &Arc<Session<JsonCodec>>) {
            let _ = self.seen.send(Seen::Close(session.id().value()));
        }

        async fn on_msg(&mut self, session: &Arc<Session<JsonCodec>>, message: Value) {
            if message == json!("boom") {
                panic!("handler exploded");
            }
            let _ = self.seen.send(Seen::Msg(session.id().value(), message));
        }
    }

    fn manager(config: ManagerConfig) -> (Manager<JsonCodec>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Manager::new(config, JsonCodec::new(), Recorder { seen: tx });
        manager.start().unwrap();
        (manager, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for handler")
            .expect("handler channel closed")
    }

    async fn connect(manager: &Manager<JsonCodec>) -> (Result<SessionId, ManagerError>, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let result = manager
            .accept_connection(IncomingConnection::new(server, "duplex"))
            .await;
        (result, client)
    }

    #[test]
    fn test_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.connect_limit, 50_000);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert_eq!(config.event_queue_capacity, 1024);
        assert_eq!(config.send_queue_capacity, 32);
    }

    #[test]
    fn test_config_normalised() {
        let config = ManagerConfig {
            connect_limit: 0,
            idle_timeout_secs: 0,
            event_queue_capacity: 0,
            send_queue_capacity: 0,
            ..Default::default()
        }
        .normalised();
        assert_eq!(config.connect_limit, DEFAULT_CONNECT_LIMIT);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.event_queue_capacity, 1);
        assert_eq!(config.send_queue_capacity, 1);
    }

    #[tokio::test]
    async fn test_ids_are_pre_incremented() {
        let (manager, _rx) = manager(ManagerConfig {
            session_start_id: 100,
            ..Default::default()
        });

        let (first, _a) = connect(&manager).await;
        let (second, _b) = connect(&manager).await;
        assert_eq!(first.unwrap().value(), 101);
        assert_eq!(second.unwrap().value(), 102);
    }

    #[tokio::test]
    async fn test_events_reach_handler_in_order() {
        let (manager, mut rx) = manager(ManagerConfig::default());
        let (id, mut client) = connect(&manager).await;
        let id = id.unwrap().value();

        write_frame(&mut client, b"{\"n\":1}", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        write_frame(&mut client, b"{\"n\":2}", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        drop(client);

        assert_eq!(next(&mut rx).await, Seen::Open(id));
        assert_eq!(next(&mut rx).await, Seen::Msg(id, json!({"n": 1})));
        assert_eq!(next(&mut rx).await, Seen::Msg(id, json!({"n": 2})));
        assert_eq!(next(&mut rx).await, Seen::Close(id));
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_without_open() {
        let (manager, mut rx) = manager(ManagerConfig {
            connect_limit: 1,
            ..Default::default()
        });

        let (first, _held) = connect(&manager).await;
        assert!(first.is_ok());
        let (second, mut rejected) = connect(&manager).await;
        assert!(matches!(second, Err(ManagerError::ConnectionLimit(1))));

        // Rejected peer sees EOF
        let mut buf = [0u8; 4];
        let n = timeout(Duration::from_secs(3), rejected.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(matches!(next(&mut rx).await, Seen::Open(_)));
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_slot_released_after_close() {
        let (manager, mut rx) = manager(ManagerConfig {
            connect_limit: 1,
            ..Default::default()
        });

        let (first, client) = connect(&manager).await;
        let first = first.unwrap();
        assert_eq!(next(&mut rx).await, Seen::Open(first.value()));
        drop(client);
        assert_eq!(next(&mut rx).await, Seen::Close(first.value()));

        let (second, _client) = connect(&manager).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_dispatch() {
        let (manager, mut rx) = manager(ManagerConfig::default());
        let (id, mut client) = connect(&manager).await;
        let id = id.unwrap().value();

        write_frame(&mut client, b"\"boom\"", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        write_frame(&mut client, b"\"after\"", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await, Seen::Open(id));
        assert_eq!(next(&mut rx).await, Seen::Msg(id, json!("after")));
    }

    #[tokio::test]
    async fn test_registry_and_close_all() {
        let (manager, mut rx) = manager(ManagerConfig::default());
        let (a, mut client_a) = connect(&manager).await;
        let (b, mut client_b) = connect(&manager).await;
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(matches!(next(&mut rx).await, Seen::Open(_)));
        assert!(matches!(next(&mut rx).await, Seen::Open(_)));
        assert_eq!(manager.session_count(), 2);
        assert_eq!(manager.session(a).unwrap().id(), a);
        assert_eq!(manager.sessions().len(), 2);

        manager.session(b).unwrap().send(&json!("hi")).await.unwrap();
        let frame = read_frame(&mut client_b, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(frame.as_ref(), b"\"hi\"");

        manager.close_all();
        assert!(matches!(next(&mut rx).await, Seen::Close(_)));
        assert!(matches!(next(&mut rx).await, Seen::Close(_)));
        assert_eq!(manager.session_count(), 0);
        assert!(manager.session(a).is_none());

        assert!(read_frame(&mut client_a, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err()
            .is_clean_eof());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (manager, _rx) = manager(ManagerConfig::default());
        assert!(matches!(manager.start(), Err(ManagerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_failed_listener_does_not_block_the_rest() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = Manager::new(ManagerConfig::default(), JsonCodec::new(), Recorder { seen: tx });

        // A stopped listener can no longer start
        let broken = bind("tcp", "127.0.0.1:0").await.unwrap();
        broken.stop();
        let healthy = bind("tcp", "127.0.0.1:0").await.unwrap();
        let addr = healthy.local_addr().to_string();
        manager.add_listener(broken).unwrap();
        manager.add_listener(healthy).unwrap();

        assert!(matches!(
            manager.start(),
            Err(ManagerError::Listener(ListenerError::AlreadyStarted(_)))
        ));

        let _client = tokio::net::TcpStream::connect(&addr).await.unwrap();
        assert_eq!(next(&mut rx).await, Seen::Open(1));
        assert!(matches!(manager.start(), Err(ManagerError::AlreadyStarted)));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "non-string panic payload");
    }
}
