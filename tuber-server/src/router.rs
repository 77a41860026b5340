//! Message-id routing
//!
//! [`Router`] is a [`Handler`] that looks up each incoming message's
//! [`Routable::msg_id`] in a table filled once at startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{trace, warn};

use tuber_protocol::{Codec, Routable};

use crate::handler::Handler;
use crate::session::Session;

/// Router errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Route for message id {0} is already registered")]
    DuplicateRoute(u32),
}

type Route<C> = Box<
    dyn FnMut(Arc<Session<C>>, <C as Codec>::Message) -> BoxFuture<'static, ()> + Send,
>;
type Hook<C> = Box<dyn FnMut(Arc<Session<C>>) -> BoxFuture<'static, ()> + Send>;

/// Dispatches messages to per-id callbacks
pub struct Router<C: Codec> {
    routes: HashMap<u32, Route<C>>,
    on_open: Option<Hook<C>>,
    on_close: Option<Hook<C>>,
}

impl<C: Codec> Default for Router<C>
where
    C::Message: Routable,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> Router<C>
where
    C::Message: Routable,
{
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            on_open: None,
            on_close: None,
        }
    }

    /// Register the callback for `msg_id`; each id may be routed once
    pub fn route<F, Fut>(&mut self, msg_id: u32, mut callback: F) -> Result<&mut Self, RouterError>
    where
        F: FnMut(Arc<Session<C>>, C::Message) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.routes.contains_key(&msg_id) {
            return Err(RouterError::DuplicateRoute(msg_id));
        }
        self.routes.insert(
            msg_id,
            Box::new(move |session, message| callback(session, message).boxed()),
        );
        Ok(self)
    }

    pub fn on_open<F, Fut>(&mut self, mut hook: F) -> &mut Self
    where
        F: FnMut(Arc<Session<C>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_open = Some(Box::new(move |session| hook(session).boxed()));
        self
    }

    pub fn on_close<F, Fut>(&mut self, mut hook: F) -> &mut Self
    where
        F: FnMut(Arc<Session<C>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(Box::new(move |session| hook(session).boxed()));
        self
    }

    pub fn has_route(&self, msg_id: u32) -> bool {
        self.routes.contains_key(&msg_id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl<C: Codec> Handler<C> for Router<C>
where
    C::Message: Routable,
{
    async fn on_session_open(&mut self, session: &Arc<Session<C>>) {
        if let Some(hook) = self.on_open.as_mut() {
            hook(Arc::clone(session)).await;
        }
    }

    async fn on_session_close(&mut self, session: &Arc<Session<C>>) {
        if let Some(hook) = self.on_close.as_mut() {
            hook(Arc::clone(session)).await;
        }
    }

    async fn on_msg(&mut self, session: &Arc<Session<C>>, message: C::Message) {
        let msg_id = message.msg_id();
        match self.routes.get_mut(&msg_id) {
            Some(route) => {
                trace!(session_id = %session.id(), msg_id, "routing message");
                route(Arc::clone(session), message).await;
            }
            None => {
                warn!(session_id = %session.id(), msg_id, "no route for message");
            }
        }
    }
}
