//! Application callbacks
//!
//! All three callbacks run on the manager's single dispatch task, in the
//! order events were queued. A callback that awaits holds up every other
//! session, so long work should be spawned.

use std::sync::Arc;

use async_trait::async_trait;
use tuber_protocol::Codec;

use crate::session::Session;

/// Receives session lifecycle and message events
#[async_trait]
pub trait Handler<C: Codec>: Send + 'static {
    /// A session was admitted; called before any of its messages
    async fn on_session_open(&mut self, _session: &Arc<Session<C>>) {}

    /// A session finished; no further messages follow
    async fn on_session_close(&mut self, _session: &Arc<Session<C>>) {}

    /// A decoded message arrived
    async fn on_msg(&mut self, session: &Arc<Session<C>>, message: C::Message);
}
