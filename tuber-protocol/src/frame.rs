//! Length-prefixed frame I/O
//!
//! A frame is a 4-byte big-endian unsigned length followed by exactly that
//! many payload bytes. [`read_frame`] and [`write_frame`] operate on a single
//! frame per call and keep no state between calls; [`FrameCodec`] exposes the
//! same format to `tokio_util::codec::Framed` users such as the client.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix in bytes
pub const LEN_SIZE: usize = 4;

/// Default maximum payload size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame read/write error
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended before a full length prefix arrived
    #[error("Stream closed after {received} of 4 header bytes")]
    ShortHeader { received: usize },

    #[error("Frame too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer closed cleanly on a frame boundary
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, Self::ShortHeader { received: 0 })
    }

    /// True when the underlying I/O failed because a deadline passed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

/// Read one frame and return its payload
///
/// Fails with [`FrameError::Oversized`] as soon as the header declares more
/// than `max_frame_size` bytes; no payload bytes are consumed in that case.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; LEN_SIZE];
    let mut received = 0;
    while received < LEN_SIZE {
        let n = reader.read(&mut header[received..]).await?;
        if n == 0 {
            return Err(FrameError::ShortHeader { received });
        }
        received += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(FrameError::Oversized {
            size: len,
            max: max_frame_size,
        });
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(payload.freeze())
}

/// Write one frame carrying `payload`
///
/// The prefix and payload go out from a single buffer; `write_all` keeps
/// writing until every byte is accepted or the writer fails.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > max_frame_size {
        return Err(FrameError::Oversized {
            size: payload.len(),
            max: max_frame_size,
        });
    }

    let mut buf = BytesMut::with_capacity(LEN_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// `tokio_util` codec speaking the same frame format
///
/// Yields raw payloads; message decoding is left to a [`crate::Codec`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length prefix
        if src.len() < LEN_SIZE {
            return Ok(None);
        }

        // Peek at length without consuming
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if len > self.max_frame_size {
            return Err(FrameError::Oversized {
                size: len,
                max: self.max_frame_size,
            });
        }

        if src.len() < LEN_SIZE + len {
            src.reserve(LEN_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None if src.len() < LEN_SIZE => Err(FrameError::ShortHeader {
                received: src.len(),
            }),
            None => Err(FrameError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            ))),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(FrameError::Oversized {
                size: item.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LEN_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}
