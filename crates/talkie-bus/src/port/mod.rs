//! Port providers: stateful owners of one named port.
//!
//! ```text
//!   PortProviderBase            lifecycle state machine (watch channel)
//!     ├── PortConnectorProvider       opens a port through a Connector
//!     │     └── CountingPortConnectorProvider   shares it between logical holders
//!     │           └── RespondingPortConnectorProvider   request → one response
//!     └── PortListenerProvider        accepts ports through an Acceptor
//!           └── RespondingPortListenerProvider     serves requests, first-response-wins fan-out
//! ```

mod base;
mod connector;
mod counting;
mod listener;
mod responding;

use serde::Serialize;
use serde_json::Value;

use crate::error::BusError;
use crate::transport::PortSender;

pub use base::PortState;
pub use connector::PortConnectorProvider;
pub use counting::CountingPortConnectorProvider;
pub use listener::PortListenerProvider;
pub use responding::{
    HandlerError, RequestHandler, RespondingPortConnectorProvider, RespondingPortListenerProvider,
};

/// One open port as seen by an observer, usable to reply on it.
#[derive(Debug, Clone)]
pub struct PortHandle {
    id: u64,
    sender: PortSender,
}

impl PortHandle {
    pub(crate) fn new(id: u64, sender: PortSender) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.sender.name()
    }

    /// Serialize `payload` and post it. Only the serialized copy crosses the port.
    pub fn post<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), BusError> {
        self.sender.post(serde_json::to_value(payload)?)
    }
}

/// Receives what happens on the ports of a provider.
pub trait PortObserver: Send + Sync + 'static {
    fn on_connect(&self, _port: &PortHandle) {}

    fn on_message(&self, port: &PortHandle, frame: Value);

    fn on_disconnect(&self, _port: &PortHandle) {}
}

/// Observer that only traces inbound frames.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl PortObserver for TracingObserver {
    fn on_message(&self, port: &PortHandle, frame: Value) {
        tracing::debug!("Port {}#{} received {}", port.name(), port.id(), frame);
    }
}
