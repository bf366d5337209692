//! The per-context registry of named-event listeners.
//!
//! Listeners are registered against a [`KnownEvent`] together with the
//! [`ContextHandle`] of the context that owns them. A broadcast invokes every
//! listener of the event concurrently and collects their answers.
//!
//! Failure policy per listener:
//! - owner context reported dead by the probe: unregistered, contributes `None`;
//! - error matching a dead-object signature: unregistered, contributes `None`;
//! - any other error or a panic: the whole broadcast fails with
//!   [`BusError::Listener`] and the results of the other listeners are dropped.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures_util::future::try_join_all;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

use talkie_types::config::LivenessConfig;
use talkie_types::KnownEvent;

use crate::context::ContextHandle;
use crate::error::BusError;
use crate::liveness::LivenessProbe;

/// Error returned by a listener. Only the message survives, since that is all
/// a dead-object check can look at.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ListenerError {
    pub message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn on_event(
        &self,
        event: KnownEvent,
        payload: &Value,
    ) -> Result<Option<Value>, ListenerError>;
}

/// Listener backed by an async closure. See [`listener_fn`].
pub struct FnListener<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(KnownEvent, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, ListenerError>> + Send + 'static,
{
    async fn on_event(
        &self,
        event: KnownEvent,
        payload: &Value,
    ) -> Result<Option<Value>, ListenerError> {
        (self.f)(event, payload.clone()).await
    }
}

/// Wrap an async closure as a shareable listener.
///
/// Identity is the returned `Arc`: keep a clone of it to unregister later.
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn Listener>
where
    F: Fn(KnownEvent, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, ListenerError>> + Send + 'static,
{
    Arc::new(FnListener { f })
}

#[derive(Clone)]
struct Registration {
    id: u64,
    listener: Arc<dyn Listener>,
    owner: ContextHandle,
}

struct BroadcasterInner {
    listeners: Mutex<HashMap<KnownEvent, Vec<Registration>>>,
    next_id: AtomicU64,
    probe: LivenessProbe,
}

impl BroadcasterInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<KnownEvent, Vec<Registration>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_where(
        &self,
        event: KnownEvent,
        matches: impl Fn(&Registration) -> bool,
    ) -> Result<(), BusError> {
        let mut registry = self.registry();
        let list = registry
            .get_mut(&event)
            .ok_or(BusError::NotFound { event })?;
        let index = list
            .iter()
            .position(matches)
            .ok_or(BusError::NotFound { event })?;
        list.remove(index);
        if list.is_empty() {
            registry.remove(&event);
        }
        Ok(())
    }
}

fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Removes exactly one registration when invoked.
pub struct KillSwitch {
    broadcaster: Weak<BroadcasterInner>,
    event: KnownEvent,
    id: u64,
}

impl KillSwitch {
    pub fn event(&self) -> KnownEvent {
        self.event
    }

    /// Unregister the listener this switch was returned for.
    ///
    /// Fails with [`BusError::NotFound`] when the registration is already gone,
    /// including on a second call.
    pub fn kill(&self) -> Result<(), BusError> {
        let event = self.event;
        let inner = self
            .broadcaster
            .upgrade()
            .ok_or(BusError::NotFound { event })?;
        let id = self.id;
        inner.remove_where(event, |reg| reg.id == id)
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new(probe: LivenessProbe) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                probe,
            }),
        }
    }

    /// Append `listener` to the list for `event`.
    pub fn register(
        &self,
        owner: ContextHandle,
        event: KnownEvent,
        listener: Arc<dyn Listener>,
    ) -> KillSwitch {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Registering listener {} for {} (owner {})", id, event, owner.kind());
        self.inner
            .registry()
            .entry(event)
            .or_default()
            .push(Registration { id, listener, owner });
        KillSwitch {
            broadcaster: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Remove the first registration of exactly this listener (pointer identity).
    pub fn unregister(&self, event: KnownEvent, listener: &Arc<dyn Listener>) -> Result<(), BusError> {
        self.inner
            .remove_where(event, |reg| same_listener(&reg.listener, listener))
    }

    pub fn listener_count(&self, event: KnownEvent) -> usize {
        self.inner.registry().get(&event).map_or(0, Vec::len)
    }

    /// Events with at least one listener, in stable order.
    pub fn events(&self) -> Vec<KnownEvent> {
        let mut events: Vec<KnownEvent> = self.inner.registry().keys().copied().collect();
        events.sort();
        events
    }

    /// Deliver `payload` to every listener of `event`.
    ///
    /// The payload is serialized once up front, so listeners never share live
    /// references with the caller. Result slots follow registration order.
    pub async fn broadcast<T>(&self, event: KnownEvent, payload: &T) -> Result<Vec<Option<Value>>, BusError>
    where
        T: Serialize + ?Sized,
    {
        let snapshot: Vec<Registration> = match self.inner.registry().get(&event) {
            Some(list) => list.clone(),
            None => Vec::new(),
        };
        if snapshot.is_empty() {
            trace!("No listeners for {}", event);
            return Ok(Vec::new());
        }

        let payload = serde_json::to_value(payload)?;
        debug!("Broadcasting {} to {} listener(s)", event, snapshot.len());

        let deliveries = snapshot
            .into_iter()
            .map(|reg| self.deliver(event, &payload, reg));
        try_join_all(deliveries).await
    }

    async fn deliver(
        &self,
        event: KnownEvent,
        payload: &Value,
        reg: Registration,
    ) -> Result<Option<Value>, BusError> {
        if self.inner.probe.is_dead(&reg.owner) {
            warn!(
                "Listener {} for {} belongs to an unloaded {} context; unregistering",
                reg.id,
                event,
                reg.owner.kind()
            );
            self.prune(event, reg.id);
            return Ok(None);
        }

        let outcome = AssertUnwindSafe(reg.listener.on_event(event, payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) if self.inner.probe.is_dead_error(&err.message) => {
                warn!(
                    "Listener {} for {} hit a dead object ({}); unregistering",
                    reg.id, event, err.message
                );
                self.prune(event, reg.id);
                Ok(None)
            }
            Ok(Err(err)) => Err(BusError::Listener {
                event,
                message: err.message,
            }),
            Err(panic) => Err(BusError::Listener {
                event,
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    fn prune(&self, event: KnownEvent, id: u64) {
        // A kill switch may have raced us to it.
        if self.inner.remove_where(event, |reg| reg.id == id).is_err() {
            trace!("Listener {} for {} already removed", id, event);
        }
    }
}

/// Probes owners and matches the default dead-object signatures.
impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(LivenessProbe::from_config(&LivenessConfig::default()))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        format!("listener panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("listener panicked: {msg}")
    } else {
        "listener panicked".to_string()
    }
}
