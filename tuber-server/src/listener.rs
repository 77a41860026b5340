//! Transport listeners
//!
//! A listener binds one address for one stream transport and hands every
//! accepted connection to a registered callback on its own task. Several
//! listeners (one per transport or port) can feed the same manager.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause before retrying after a transient accept failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Any reliable byte stream a session can own
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// A freshly accepted connection, not yet wrapped in a session
pub struct IncomingConnection {
    transport: Box<dyn Transport>,
    peer_addr: String,
}

impl IncomingConnection {
    pub fn new(transport: impl Transport, peer_addr: impl Into<String>) -> Self {
        Self {
            transport: Box::new(transport),
            peer_addr: peer_addr.into(),
        }
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub(crate) fn into_parts(self) -> (Box<dyn Transport>, String) {
        (self.transport, self.peer_addr)
    }
}

impl fmt::Debug for IncomingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingConnection")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Callback invoked once per accepted connection
pub type ConnectionCallback =
    Arc<dyn Fn(IncomingConnection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Listener errors
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Failed to bind {network} listener on {addr}: {source}")]
    Bind {
        network: Network,
        addr: String,
        source: io::Error,
    },

    #[error("Listener on {0} already started or stopped")]
    AlreadyStarted(String),
}

/// Accepts connections for one address/transport pair
pub trait Listener: Send + Sync {
    /// Begin accepting in the background
    fn start(&self) -> Result<(), ListenerError>;

    /// End the accept loop and release the bound address
    fn stop(&self);

    /// Register the callback; replaces any previous one
    fn on_new_connection(&self, callback: ConnectionCallback);

    fn network(&self) -> Network;

    fn local_addr(&self) -> &str;
}

/// Supported stream transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    #[cfg(unix)]
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            #[cfg(unix)]
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            #[cfg(unix)]
            "unix" => Ok(Network::Unix),
            other => Err(ListenerError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Bind a listener for `network` ("tcp" or "unix") on `addr`
///
/// The returned listener holds the address but does not accept until
/// [`Listener::start`] is called.
pub async fn bind(network: &str, addr: &str) -> Result<StreamListener, ListenerError> {
    let network: Network = network.parse()?;
    let bind_err = |source: io::Error| ListenerError::Bind {
        network,
        addr: addr.to_string(),
        source,
    };

    let (acceptor, local_addr) = match network {
        Network::Tcp => {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                error!("listen error on {}, because: {}", addr, e);
                bind_err(e)
            })?;
            let local = listener.local_addr().map_err(bind_err)?.to_string();
            (Acceptor::Tcp(listener), local)
        }
        #[cfg(unix)]
        Network::Unix => {
            let listener = tokio::net::UnixListener::bind(addr).map_err(|e| {
                error!("listen error on {}, because: {}", addr, e);
                bind_err(e)
            })?;
            (
                Acceptor::Unix(listener, std::path::PathBuf::from(addr)),
                addr.to_string(),
            )
        }
    };

    info!("{} listen on {}", network, local_addr);
    Ok(StreamListener {
        network,
        local_addr,
        acceptor: Mutex::new(Some(acceptor)),
        callback: Arc::new(RwLock::new(None)),
        stopped: Arc::new(AtomicBool::new(false)),
        stop_signal: CancellationToken::new(),
    })
}

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
}

impl Acceptor {
    async fn accept(&self) -> io::Result<IncomingConnection> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", peer, e);
                }
                Ok(IncomingConnection::new(stream, peer.to_string()))
            }
            #[cfg(unix)]
            Acceptor::Unix(listener, _) => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix:unnamed".to_string());
                Ok(IncomingConnection::new(stream, peer))
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Acceptor::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Listener over a tokio TCP or Unix-domain socket
pub struct StreamListener {
    network: Network,
    local_addr: String,
    acceptor: Mutex<Option<Acceptor>>,
    callback: Arc<RwLock<Option<ConnectionCallback>>>,
    stopped: Arc<AtomicBool>,
    stop_signal: CancellationToken,
}

impl Listener for StreamListener {
    fn start(&self) -> Result<(), ListenerError> {
        let acceptor = self
            .acceptor
            .lock()
            .take()
            .ok_or_else(|| ListenerError::AlreadyStarted(self.local_addr.clone()))?;

        tokio::spawn(accept_loop(
            acceptor,
            self.network,
            self.local_addr.clone(),
            Arc::clone(&self.callback),
            Arc::clone(&self.stopped),
            self.stop_signal.clone(),
        ));

        info!("{} listener start: {}", self.network, self.local_addr);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.cancel();
        // Never started: release the address right here
        self.acceptor.lock().take();
    }

    fn on_new_connection(&self, callback: ConnectionCallback) {
        *self.callback.write() = Some(callback);
    }

    fn network(&self) -> Network {
        self.network
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    acceptor: Acceptor,
    network: Network,
    local_addr: String,
    callback: Arc<RwLock<Option<ConnectionCallback>>>,
    stopped: Arc<AtomicBool>,
    stop_signal: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = stop_signal.cancelled() => break,
            result = acceptor.accept() => result,
        };

        match result {
            Ok(conn) => {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let callback = callback.read().clone();
                match callback {
                    Some(callback) => {
                        debug!("New {} connection from {}", network, conn.peer_addr());
                        tokio::spawn(callback(conn));
                    }
                    None => {
                        warn!(
                            "{} listener {} has no connection callback, dropping {}",
                            network,
                            local_addr,
                            conn.peer_addr()
                        );
                    }
                }
            }
            Err(e) if is_transient(&e) => {
                debug!("{} accept transient error: {}", network, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            Err(e) => {
                if !stopped.load(Ordering::SeqCst) {
                    error!("{}.accept failed on {}: {}", network, local_addr, e);
                }
                break;
            }
        }
    }

    info!("{} listener stopped: {}", network, local_addr);
}

/// Accept failures worth retrying: interrupted calls, connections that died
/// in the backlog, and resource exhaustion that may clear up
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
        );
    }

    false
}
