//! Ports and the transports that open them.
//!
//! A [`Port`] is a named, bidirectional queue of JSON frames between two
//! contexts. Frames posted by one side arrive in FIFO order on the other side.
//! Dropping every sender of one side closes the port for the other side, which
//! observes it as `recv()` returning `None`.
//!
//! - [`hub`]: in-memory router for contexts living in one process.
//! - [`stream`]: NDJSON framing over any byte stream (Unix sockets).

pub mod hub;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BusError;

pub use hub::{HubAcceptor, PortHub};

/// Sending half of a port. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Value>,
}

impl PortSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, frame: Value) -> Result<(), BusError> {
        self.tx.send(frame).map_err(|_| BusError::PortClosed {
            name: self.name.to_string(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl PortReceiver {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub struct Port {
    sender: PortSender,
    receiver: PortReceiver,
}

impl Port {
    /// Two connected ends of a port named `name`.
    pub fn pair(name: &str) -> (Port, Port) {
        let name: Arc<str> = Arc::from(name);
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Port {
            sender: PortSender {
                name: Arc::clone(&name),
                tx: b_tx,
            },
            receiver: PortReceiver { rx: a_rx },
        };
        let b = Port {
            sender: PortSender { name, tx: a_tx },
            receiver: PortReceiver { rx: b_rx },
        };
        (a, b)
    }

    pub fn name(&self) -> &str {
        self.sender.name()
    }

    pub fn post(&self, frame: Value) -> Result<(), BusError> {
        self.sender.post(frame)
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Opens the connecting side of a port.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, name: &str) -> Result<Port, BusError>;
}

/// Yields ports opened towards the accepting side.
///
/// `accept` must be cancel-safe: it is polled inside `select!`.
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// `None` once the transport can no longer produce ports.
    async fn accept(&mut self) -> Option<Port>;
}
