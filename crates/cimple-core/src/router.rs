//! Kind-keyed dispatch of inbound envelopes.

use crate::Result;
use crate::messages::{Envelope, MessageKind};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How [`MessageRouter::route`] disposed of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Handler,
    Fallback,
    Dropped,
}

/// Maps each message kind to at most one handler, with an optional fallback
/// for kinds nobody registered.
///
/// Registering a second handler for a kind replaces the first one.
#[derive(Clone, Default)]
pub struct MessageRouter {
    handlers: HashMap<MessageKind, Handler>,
    fallback: Option<Handler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`.
    pub fn on<F, Fut>(&mut self, kind: MessageKind, handler: F) -> &mut Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(kind, Arc::new(move |envelope| Box::pin(handler(envelope))));
        self
    }

    /// Register the handler used for kinds without a dedicated handler.
    pub fn on_error<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |envelope| Box::pin(handler(envelope))));
        self
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Dispatch one envelope and surface the handler's error, if any.
    pub async fn route(&self, envelope: Envelope) -> Result<Routed> {
        let kind = envelope.kind();

        if let Some(handler) = self.handlers.get(&kind) {
            handler(envelope).await?;
            return Ok(Routed::Handler);
        }

        if let Some(fallback) = &self.fallback {
            fallback(envelope).await?;
            return Ok(Routed::Fallback);
        }

        debug!(kind = %kind, message_id = %envelope.id, "No handler registered, dropping message");
        Ok(Routed::Dropped)
    }
}
