use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::messaging::body::{MessageBody, MessageType};

/// Dispatches a received message body to application code. An `Err` result causes the
///  message to be rejected, i.e. the sender delivers it again later.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandlerInvoker: Send + Sync + 'static {
    async fn handle(&self, body: &MessageBody) -> anyhow::Result<()>;
}

/// Application handler for a specific message type
#[async_trait]
pub trait MessageHandler<T: MessageType>: Send + Sync + 'static {
    async fn handle(&self, message: T) -> anyhow::Result<()>;
}

/// Handler working on untyped bodies, e.g. for [MessageBody::Text] or [MessageBody::Raw]
#[async_trait]
pub trait BodyHandler: Send + Sync + 'static {
    async fn handle(&self, body: &MessageBody) -> anyhow::Result<()>;
}


struct TypedBodyHandler<T: MessageType, H: MessageHandler<T>> {
    handler: H,
    _message_type: PhantomData<fn(T)>,
}

#[async_trait]
impl <T: MessageType, H: MessageHandler<T>> BodyHandler for TypedBodyHandler<T, H> {
    async fn handle(&self, body: &MessageBody) -> anyhow::Result<()> {
        let message = body.parse::<T>()?;
        self.handler.handle(message).await
    }
}


/// Maps type names to handlers. Handlers are registered at startup, and there is at most one
///  handler per type name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<String, Arc<dyn BodyHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub fn register<T: MessageType>(&mut self, handler: impl MessageHandler<T>) -> anyhow::Result<()> {
        self.register_body_handler(T::TYPE_NAME, TypedBodyHandler {
            handler,
            _message_type: PhantomData,
        })
    }

    pub fn register_body_handler(&mut self, type_name: &str, handler: impl BodyHandler) -> anyhow::Result<()> {
        match self.handlers.entry(type_name.to_string()) {
            Entry::Occupied(_) => bail!("registering a second handler for type {:?}", type_name),
            Entry::Vacant(e) => {
                e.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }
}

#[async_trait]
impl HandlerInvoker for HandlerRegistry {
    async fn handle(&self, body: &MessageBody) -> anyhow::Result<()> {
        match self.handlers.get(body.type_name()) {
            Some(handler) => handler.handle(body).await,
            None => {
                // there is nobody to retry for, so the message counts as handled
                warn!(type_name = body.type_name(), "received a message for which there is no handler - ignoring");
                Ok(())
            }
        }
    }
}
