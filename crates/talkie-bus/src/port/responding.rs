//! Request/response over ports.
//!
//! A `Request` frame must be answered by exactly one `Response` or `Failure`
//! frame carrying its id. `Response { payload: None }` means "nothing to say",
//! which keeps "no answer" distinct from an answer of JSON `null`. A `Failure`
//! carries the message of the handler error and surfaces as
//! [`BusError::Remote`] on the requesting side.
//!
//! Two shapes exist:
//! - [`RespondingPortConnectorProvider`] talks to a single listener. A second
//!   response for an already answered request is a protocol violation: all
//!   pending requests fail and the provider refuses further requests.
//!   Duplicates are only seen while the port is open, so a duplicate arriving
//!   after the last holder released the port goes unnoticed; [`hold`] keeps
//!   the port (and its reader) open between requests.
//! - [`RespondingPortListenerProvider`] talks to every connected context at
//!   once. [`RespondingPortListenerProvider::request_all`] takes the first
//!   response that carries a payload and ignores the rest.
//!
//! `Notify` frames arriving at a connector built [`with_events`] are broadcast
//! on that context's [`Broadcaster`].
//!
//! [`hold`]: RespondingPortConnectorProvider::hold
//! [`with_events`]: RespondingPortConnectorProvider::with_events

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use talkie_types::ipc::PortFrame;
use talkie_types::KnownEvent;

use crate::broadcaster::Broadcaster;
use crate::error::BusError;
use crate::transport::{Acceptor, Connector};

use super::{CountingPortConnectorProvider, PortHandle, PortListenerProvider, PortObserver, PortState};

/// How many answered request ids are remembered for duplicate detection.
const ANSWERED_MEMORY: usize = 256;

/// Error returned by a [`RequestHandler`]; its message is sent back in a
/// `Failure` frame.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Answers requests arriving on a port.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// `Ok(None)` is sent back as the explicit "no response" marker.
    async fn handle(&self, payload: Value) -> Result<Option<Value>, HandlerError>;
}

/// Handler for contexts that never answer requests.
struct Silent;

#[async_trait]
impl RequestHandler for Silent {
    async fn handle(&self, _payload: Value) -> Result<Option<Value>, HandlerError> {
        Ok(None)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `handler` on a request and post its single reply.
fn serve_request(handler: &Arc<dyn RequestHandler>, port: &PortHandle, id: Uuid, payload: Value) {
    let handler = Arc::clone(handler);
    let port = port.clone();
    tokio::spawn(async move {
        let reply = match handler.handle(payload).await {
            Ok(payload) => PortFrame::response(id, payload),
            Err(e) => {
                debug!("Request {} on {} failed: {}", id, port.name(), e);
                PortFrame::failure(id, e.message)
            }
        };
        if let Err(e) = port.post(&reply) {
            debug!("Could not answer request {} on {}: {}", id, port.name(), e);
        }
    });
}

fn parse_frame(port: &PortHandle, frame: Value) -> Option<PortFrame> {
    match serde_json::from_value(frame) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Dropping malformed frame on {}: {}", port.name(), e);
            None
        }
    }
}

/// Broadcast a notification on the local broadcaster without blocking the reader.
fn deliver_notify(events: &Option<Broadcaster>, port: &PortHandle, event: KnownEvent, payload: Value) {
    let Some(events) = events.clone() else {
        trace!("Ignoring {} on {}: no local broadcaster", event, port.name());
        return;
    };
    let name = port.name().to_string();
    tokio::spawn(async move {
        if let Err(e) = events.broadcast(event, &payload).await {
            warn!("Relaying {} from {} failed: {}", event, name, e);
        }
    });
}

// ─── Single listener ──────────────────────────────────────────────────────────

type Reply = Result<Option<Value>, BusError>;
type Waiter = oneshot::Sender<Reply>;

struct PendingRequests {
    name: String,
    handler: Arc<dyn RequestHandler>,
    events: Option<Broadcaster>,
    waiters: Mutex<HashMap<Uuid, Waiter>>,
    answered: Mutex<VecDeque<Uuid>>,
    violation: Mutex<Option<BusError>>,
}

impl PendingRequests {
    fn resolve(&self, id: Uuid, reply: Reply) {
        let waiter = lock(&self.waiters).remove(&id);
        if let Some(waiter) = waiter {
            let mut answered = lock(&self.answered);
            if answered.len() == ANSWERED_MEMORY {
                answered.pop_front();
            }
            answered.push_back(id);
            drop(answered);
            let _ = waiter.send(reply);
            return;
        }

        if lock(&self.answered).contains(&id) {
            let violation = BusError::DuplicateResponse {
                name: self.name.clone(),
                id,
            };
            error!("{}", violation);
            self.fail_all(&violation);
            *lock(&self.violation) = Some(violation);
        } else {
            warn!("Ignoring late response {} on {}", id, self.name);
        }
    }

    fn fail_all(&self, err: &BusError) {
        let waiters: Vec<Waiter> = lock(&self.waiters).drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}

impl PortObserver for PendingRequests {
    fn on_message(&self, port: &PortHandle, frame: Value) {
        match parse_frame(port, frame) {
            Some(PortFrame::Response { reply_to, payload }) => self.resolve(reply_to, Ok(payload)),
            Some(PortFrame::Failure { reply_to, message }) => {
                let failure = BusError::Remote {
                    name: self.name.clone(),
                    message,
                };
                self.resolve(reply_to, Err(failure))
            }
            Some(PortFrame::Request { id, payload }) => {
                serve_request(&self.handler, port, id, payload)
            }
            Some(PortFrame::Notify { event, payload }) => {
                deliver_notify(&self.events, port, event, payload)
            }
            None => {}
        }
    }

    fn on_disconnect(&self, port: &PortHandle) {
        self.fail_all(&BusError::PortClosed {
            name: port.name().to_string(),
        });
    }
}

/// Connecting side of a request/response port.
///
/// Each request holds the underlying counting port for its duration, so the
/// physical port stays open only while requests are in flight or while
/// somebody [holds](Self::hold) it.
pub struct RespondingPortConnectorProvider {
    port: CountingPortConnectorProvider,
    pending: Arc<PendingRequests>,
}

impl RespondingPortConnectorProvider {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self::build(name.into(), connector, Arc::new(Silent), None)
    }

    /// Also answer requests the listener sends towards this context.
    pub fn with_handler(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self::build(name.into(), connector, handler, None)
    }

    /// Also broadcast notifications from the listener on `events`.
    pub fn with_events(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        events: Broadcaster,
    ) -> Self {
        Self::build(name.into(), connector, Arc::new(Silent), Some(events))
    }

    fn build(
        name: String,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn RequestHandler>,
        events: Option<Broadcaster>,
    ) -> Self {
        let pending = Arc::new(PendingRequests {
            name: name.clone(),
            handler,
            events,
            waiters: Mutex::new(HashMap::new()),
            answered: Mutex::new(VecDeque::new()),
            violation: Mutex::new(None),
        });
        let observer: Arc<dyn PortObserver> = pending.clone();
        Self {
            port: CountingPortConnectorProvider::new(name, connector, observer),
            pending,
        }
    }

    pub fn name(&self) -> &str {
        self.port.name()
    }

    pub fn state(&self) -> PortState {
        self.port.state()
    }

    /// Keep the port open between requests, so notifications and late
    /// duplicate responses are received.
    pub async fn hold(&self) -> Result<(), BusError> {
        self.port.connect().await
    }

    /// Undo one [`hold`](Self::hold).
    pub async fn release(&self) -> Result<(), BusError> {
        self.port.disconnect().await
    }

    /// Send `payload` and wait up to `timeout` for its response.
    ///
    /// Returns `Ok(None)` when the listener answered with the no-response
    /// marker and [`BusError::Remote`] when its handler failed.
    pub async fn request(&self, payload: Value, timeout: Duration) -> Result<Option<Value>, BusError> {
        if let Some(violation) = lock(&self.pending.violation).clone() {
            return Err(violation);
        }
        self.port.connect().await?;
        let result = self.exchange(payload, timeout).await;
        if let Err(e) = self.port.disconnect().await {
            debug!("Releasing {} after request: {}", self.name(), e);
        }
        result
    }

    async fn exchange(&self, payload: Value, timeout: Duration) -> Result<Option<Value>, BusError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending.waiters).insert(id, tx);

        if let Err(e) = self.port.post_message(&PortFrame::Request { id, payload }) {
            lock(&self.pending.waiters).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::PortClosed {
                name: self.name().to_string(),
            }),
            Err(_) => {
                lock(&self.pending.waiters).remove(&id);
                Err(BusError::Timeout {
                    name: self.name().to_string(),
                    timeout,
                })
            }
        }
    }
}

// ─── Multiple listeners ───────────────────────────────────────────────────────

struct Fanout {
    winner: Option<oneshot::Sender<Reply>>,
    expected: Option<usize>,
    empty: usize,
    /// First failure reported, returned when no context answers with a payload.
    failure: Option<String>,
}

impl Fanout {
    fn settle_if_exhausted(&mut self, name: &str) {
        if self.expected.is_some_and(|expected| self.empty >= expected) {
            if let Some(winner) = self.winner.take() {
                let outcome = match self.failure.take() {
                    Some(message) => Err(BusError::Remote {
                        name: name.to_string(),
                        message,
                    }),
                    None => Ok(None),
                };
                let _ = winner.send(outcome);
            }
        }
    }
}

struct ListenerSide {
    name: String,
    handler: Arc<dyn RequestHandler>,
    fanouts: Mutex<HashMap<Uuid, Fanout>>,
}

impl ListenerSide {
    fn offer(&self, id: Uuid, reply: Result<Option<Value>, String>) {
        let mut fanouts = lock(&self.fanouts);
        let Some(fanout) = fanouts.get_mut(&id) else {
            trace!("Ignoring response {} on {} after a winner was chosen", id, self.name);
            return;
        };
        match reply {
            Ok(Some(value)) => {
                if let Some(winner) = fanout.winner.take() {
                    let _ = winner.send(Ok(Some(value)));
                }
                fanouts.remove(&id);
            }
            other => {
                if let Err(message) = other {
                    if fanout.failure.is_none() {
                        fanout.failure = Some(message);
                    }
                }
                fanout.empty += 1;
                fanout.settle_if_exhausted(&self.name);
                if fanout.winner.is_none() {
                    fanouts.remove(&id);
                }
            }
        }
    }
}

impl PortObserver for ListenerSide {
    fn on_connect(&self, port: &PortHandle) {
        debug!("Context connected on {} (#{})", port.name(), port.id());
    }

    fn on_message(&self, port: &PortHandle, frame: Value) {
        match parse_frame(port, frame) {
            Some(PortFrame::Request { id, payload }) => {
                serve_request(&self.handler, port, id, payload)
            }
            Some(PortFrame::Response { reply_to, payload }) => self.offer(reply_to, Ok(payload)),
            Some(PortFrame::Failure { reply_to, message }) => self.offer(reply_to, Err(message)),
            Some(PortFrame::Notify { event, .. }) => {
                trace!("Ignoring {} notification from context #{}", event, port.id());
            }
            None => {}
        }
    }

    fn on_disconnect(&self, port: &PortHandle) {
        debug!("Context disconnected from {} (#{})", port.name(), port.id());
    }
}

/// Accepting side of a request/response port, shared by many contexts.
pub struct RespondingPortListenerProvider {
    listener: PortListenerProvider,
    side: Arc<ListenerSide>,
}

impl RespondingPortListenerProvider {
    pub fn new(name: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        let name = name.into();
        let side = Arc::new(ListenerSide {
            name: name.clone(),
            handler,
            fanouts: Mutex::new(HashMap::new()),
        });
        let observer: Arc<dyn PortObserver> = side.clone();
        Self {
            listener: PortListenerProvider::new(name, observer),
            side,
        }
    }

    pub fn name(&self) -> &str {
        self.listener.name()
    }

    pub fn state(&self) -> PortState {
        self.listener.state()
    }

    pub fn port_count(&self) -> usize {
        self.listener.port_count()
    }

    pub async fn start<A: Acceptor>(&self, acceptor: A) -> Result<(), BusError> {
        self.listener.start(acceptor).await
    }

    pub async fn stop(&self) -> Result<(), BusError> {
        self.listener.stop().await
    }

    /// Post `event` to every connected context as a `Notify` frame.
    ///
    /// Returns how many contexts it reached.
    pub fn notify_all<T: Serialize + ?Sized>(&self, event: KnownEvent, payload: &T) -> Result<usize, BusError> {
        let frame = PortFrame::notify(event, serde_json::to_value(payload)?);
        self.listener.post_all(&frame)
    }

    /// Send `payload` to every connected context; the first response with a
    /// payload wins and later ones are dropped.
    ///
    /// `Ok(None)` when no context is connected or every context answered with
    /// the no-response marker. When no context answered with a payload but
    /// one failed, that failure is returned as [`BusError::Remote`].
    pub async fn request_all(&self, payload: Value, timeout: Duration) -> Result<Option<Value>, BusError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.side.fanouts).insert(
            id,
            Fanout {
                winner: Some(tx),
                expected: None,
                empty: 0,
                failure: None,
            },
        );

        let sent = match self.listener.post_all(&PortFrame::Request { id, payload }) {
            Ok(sent) => sent,
            Err(e) => {
                lock(&self.side.fanouts).remove(&id);
                return Err(e);
            }
        };
        {
            let mut fanouts = lock(&self.side.fanouts);
            if let Some(fanout) = fanouts.get_mut(&id) {
                fanout.expected = Some(sent);
                fanout.settle_if_exhausted(&self.side.name);
                if fanout.winner.is_none() {
                    fanouts.remove(&id);
                }
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                lock(&self.side.fanouts).remove(&id);
                Err(BusError::Timeout {
                    name: self.name().to_string(),
                    timeout,
                })
            }
        }
    }
}
