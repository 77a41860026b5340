//! Client-server connection management
//!
//! Provides TCP and Unix socket connections to a tuber server with
//! automatic message framing and async dispatch.

mod client;
mod handler;

pub use client::{Connection, ConnectionState};
pub use handler::MessageSender;
