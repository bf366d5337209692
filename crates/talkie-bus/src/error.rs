//! Error type shared by every part of the message bus.
//!
//! Variants fall into four groups:
//! - transient transport conditions (`NoListener`, `NotConnected`, `PortClosed`,
//!   `Transport`), which the groundwork retries;
//! - protocol violations (`DuplicateResponse`, `PortNameMismatch`, `NotFound`,
//!   `AlreadyConnected`), which indicate a programming error and are never retried;
//! - `Timeout`, kept distinct so callers can log and move on;
//! - everything a listener, storage or serializer reports.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use talkie_types::{KnownAction, KnownEvent};

#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Unregistering a listener that is not registered.
    #[error("listener not found for event {event}")]
    NotFound { event: KnownEvent },

    #[error("port {name} is already connected")]
    AlreadyConnected { name: String },

    #[error("port {name} is not connected")]
    NotConnected { name: String },

    /// Nobody is accepting connections on this port name (yet).
    #[error("no listener registered for port {name}")]
    NoListener { name: String },

    /// The far side of the port went away.
    #[error("port {name} was closed by the other side")]
    PortClosed { name: String },

    #[error("port name mismatch: expected {expected}, got {actual}")]
    PortNameMismatch { expected: String, actual: String },

    /// A request received more than one response.
    #[error("duplicate response for request {id} on port {name}")]
    DuplicateResponse { name: String, id: Uuid },

    #[error("request on port {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("giving up on {action} after {attempts} attempts: {message}")]
    GivingUp {
        action: KnownAction,
        attempts: u32,
        message: String,
    },

    /// The listener answered with the no-response marker where an answer was required.
    #[error("no context answered {action}")]
    NoResponse { action: KnownAction },

    /// The other side of the port failed while handling a request.
    #[error("remote handler on port {name} failed: {message}")]
    Remote { name: String, message: String },

    #[error("listener for {event} failed: {message}")]
    Listener { event: KnownEvent, message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("serialization failed: {message}")]
    Serialization { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl BusError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::NotFound { .. } => "listener_not_found",
            BusError::AlreadyConnected { .. } => "port_already_connected",
            BusError::NotConnected { .. } => "port_not_connected",
            BusError::NoListener { .. } => "port_no_listener",
            BusError::PortClosed { .. } => "port_closed",
            BusError::PortNameMismatch { .. } => "port_name_mismatch",
            BusError::DuplicateResponse { .. } => "duplicate_response",
            BusError::Timeout { .. } => "request_timeout",
            BusError::GivingUp { .. } => "giving_up",
            BusError::NoResponse { .. } => "no_response",
            BusError::Remote { .. } => "remote_failure",
            BusError::Listener { .. } => "listener_failed",
            BusError::Transport { .. } => "transport_error",
            BusError::Serialization { .. } => "serialization_error",
            BusError::Storage { .. } => "storage_error",
        }
    }

    /// Whether a message-bus send that failed this way may succeed if tried again.
    ///
    /// Only conditions caused by contexts still starting up or restarting qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::NoListener { .. }
                | BusError::NotConnected { .. }
                | BusError::PortClosed { .. }
                | BusError::Transport { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        BusError::Transport {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for BusError {
    fn from(err: rusqlite::Error) -> Self {
        BusError::Storage {
            message: err.to_string(),
        }
    }
}
