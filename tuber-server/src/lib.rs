//! tuber-server: session management for framed stream servers
//!
//! A [`Manager`] accepts connections from one or more [`Listener`]s, wraps
//! each in a [`Session`] that reads and writes length-prefixed frames, and
//! delivers every open, message and close event to a single [`Handler`].

pub mod config;
pub mod handler;
pub mod listener;
pub mod manager;
pub mod router;
pub mod session;


pub use handler::Handler;
pub use listener::{
    bind, ConnectionCallback, IncomingConnection, Listener, ListenerError, Network,
    StreamListener, Transport,
};
pub use manager::{Manager, ManagerConfig, ManagerError, DEFAULT_CONNECT_LIMIT};
pub use router::{Router, RouterError};
pub use session::{CloseReason, Session, SessionError, SessionEvent, SessionId, SessionState};
