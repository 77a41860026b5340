//! tuber-client: connect to a tuber server
//!
//! [`Connection`] dials `tcp://host:port` or `unix:///path`, frames outgoing
//! messages with the shared length prefix and decodes incoming frames with
//! the same [`Codec`](tuber_protocol::Codec) the server uses.

pub mod connection;

pub use connection::{Connection, ConnectionState, MessageSender};
