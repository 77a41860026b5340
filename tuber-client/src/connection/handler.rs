//! Clonable sender for outgoing messages

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use tuber_protocol::Codec;
use tuber_utils::{Result, TuberError};

/// Clonable message sender
pub struct MessageSender<C: Codec> {
    tx: mpsc::Sender<Bytes>,
    codec: Arc<C>,
}

impl<C: Codec> Clone for MessageSender<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<C: Codec> MessageSender<C> {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>, codec: Arc<C>) -> Self {
        Self { tx, codec }
    }

    pub async fn send(&self, msg: &C::Message) -> Result<()> {
        let payload = self
            .codec
            .encode(msg)
            .map_err(|e| TuberError::protocol(e.to_string()))?;
        self.tx
            .send(payload)
            .await
            .map_err(|_| TuberError::ConnectionClosed)?;
        Ok(())
    }

    /// Send without waiting (fire and forget); dropped messages are logged
    pub fn send_nowait(&self, msg: &C::Message) {
        let payload = match self.codec.encode(msg) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping message that failed to encode: {}", e);
                return;
            }
        };
        match self.tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outgoing queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Connection closed, dropping message");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
