//! Background side of the message bus: maps each [`KnownAction`] to a handler
//! and serves them to every connected foreground context.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use talkie_types::ipc::{BusRequest, Done};
use talkie_types::{KnownAction, KnownEvent};

use crate::broadcaster::{Listener, ListenerError};
use crate::error::BusError;
use crate::port::{HandlerError, PortState, RequestHandler, RespondingPortListenerProvider};
use crate::transport::Acceptor;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<serde_json::Error> for ActionError {
    fn from(err: serde_json::Error) -> Self {
        ActionError::InvalidData(err.to_string())
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    /// `Ok(None)` is acknowledged with [`Done`].
    async fn handle(&self, data: Value) -> Result<Option<Value>, ActionError>;
}

pub struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, ActionError>> + Send + 'static,
{
    async fn handle(&self, data: Value) -> Result<Option<Value>, ActionError> {
        (self.f)(data).await
    }
}

pub fn action_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, ActionError>> + Send + 'static,
{
    Arc::new(FnAction { f })
}

/// One handler per action. Registering an action again replaces its handler.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<KnownAction, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, action: KnownAction, handler: Arc<dyn ActionHandler>) {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(action, handler);
        if replaced.is_some() {
            debug!("Replaced handler for {}", action);
        }
    }

    pub fn get(&self, action: KnownAction) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&action)
            .cloned()
    }

    pub fn actions(&self) -> Vec<KnownAction> {
        let mut actions: Vec<KnownAction> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        actions.sort();
        actions
    }

    /// Decode a bus request and run its handler.
    ///
    /// Unknown actions yield `None`, which the port answers with the
    /// no-response marker. Malformed requests and failing handlers are
    /// reported back to the requesting context.
    pub async fn dispatch(&self, payload: Value) -> Result<Option<Value>, HandlerError> {
        let request: BusRequest = serde_json::from_value(payload).map_err(|e| {
            warn!("Rejecting malformed bus request: {}", e);
            HandlerError::new(format!("malformed bus request: {e}"))
        })?;
        let Some(handler) = self.get(request.action) else {
            warn!("No handler for action {}", request.action);
            return Ok(None);
        };
        match handler.handle(request.data).await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => Ok(Some(serde_json::to_value(Done::YES).map_err(|e| {
                HandlerError::new(e.to_string())
            })?)),
            Err(e) => {
                warn!("Action {} failed: {}", request.action, e);
                Err(HandlerError::new(e.to_string()))
            }
        }
    }
}

struct Dispatcher(Arc<ActionRegistry>);

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, payload: Value) -> Result<Option<Value>, HandlerError> {
        self.0.dispatch(payload).await
    }
}

/// Listener that posts every event it sees to the contexts connected to the
/// service, as `Notify` frames.
struct ContextForwarder {
    listener: Weak<RespondingPortListenerProvider>,
}

#[async_trait]
impl Listener for ContextForwarder {
    async fn on_event(
        &self,
        event: KnownEvent,
        payload: &Value,
    ) -> Result<Option<Value>, ListenerError> {
        let Some(listener) = self.listener.upgrade() else {
            return Ok(None);
        };
        match listener.notify_all(event, payload) {
            Ok(reached) => trace!("Forwarded {} to {} contexts", event, reached),
            Err(BusError::NotConnected { .. }) => trace!("Not serving, {} stays local", event),
            Err(e) => debug!("Could not forward {}: {}", event, e),
        }
        Ok(None)
    }
}

/// Serves an [`ActionRegistry`] on the bus port.
pub struct MessageBusService {
    registry: Arc<ActionRegistry>,
    listener: Arc<RespondingPortListenerProvider>,
}

impl MessageBusService {
    pub fn new(port_name: impl Into<String>) -> Self {
        let registry = Arc::new(ActionRegistry::new());
        let listener = Arc::new(RespondingPortListenerProvider::new(
            port_name,
            Arc::new(Dispatcher(registry.clone())),
        ));
        Self { registry, listener }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn register(&self, action: KnownAction, handler: Arc<dyn ActionHandler>) {
        self.registry.register(action, handler);
    }

    pub fn port_name(&self) -> &str {
        self.listener.name()
    }

    pub fn state(&self) -> PortState {
        self.listener.state()
    }

    pub fn connected_contexts(&self) -> usize {
        self.listener.port_count()
    }

    pub async fn start<A: Acceptor>(&self, acceptor: A) -> Result<(), BusError> {
        self.listener.start(acceptor).await?;
        info!(
            "Message bus serving {} actions on {}",
            self.registry.actions().len(),
            self.port_name()
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), BusError> {
        self.listener.stop().await
    }

    /// Post `event` to every connected context. Returns how many it reached.
    pub fn notify_contexts<T: Serialize + ?Sized>(
        &self,
        event: KnownEvent,
        payload: &T,
    ) -> Result<usize, BusError> {
        self.listener.notify_all(event, payload)
    }

    /// A listener that forwards the events it receives to every connected
    /// context. Register it on a broadcaster to extend that broadcaster
    /// across ports.
    pub fn forwarder(&self) -> Arc<dyn Listener> {
        Arc::new(ContextForwarder {
            listener: Arc::downgrade(&self.listener),
        })
    }

    /// Ask every connected context; the first one with an answer wins.
    pub async fn ask_contexts(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, BusError> {
        self.listener.request_all(payload, timeout).await
    }
}
