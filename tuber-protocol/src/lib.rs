//! tuber-protocol: Wire framing and message codecs
//!
//! This crate defines the length-prefixed frame format shared by the tuber
//! server and client, and the pluggable [`Codec`] abstraction that turns
//! frame payloads into application messages.
//!
//! Wire format, per frame:
//!
//! ```text
//! +----------------------+---------------------+
//! | length: u32 (big-e.) | payload: length B   |
//! +----------------------+---------------------+
//! ```

pub mod codec;
pub mod frame;
pub mod routing;

// Re-export main types at crate root
pub use codec::{BincodeCodec, Codec, CodecError, JsonCodec};
pub use frame::{
    read_frame, write_frame, FrameCodec, FrameError, DEFAULT_MAX_FRAME_SIZE, LEN_SIZE,
};
pub use routing::Routable;
