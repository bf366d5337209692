use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BusError;

use super::{Acceptor, Connector, Port};

type Listeners = HashMap<String, mpsc::UnboundedSender<Port>>;

/// In-memory port router shared by every context of one process.
///
/// At most one live acceptor per port name. Connecting to a name nobody
/// listens on fails with [`BusError::NoListener`], the same condition a
/// foreground context hits when the background has not finished starting.
#[derive(Clone, Default)]
pub struct PortHub {
    listeners: Arc<Mutex<Listeners>>,
}

impl PortHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start accepting ports named `name`. Dropping the acceptor stops it.
    pub fn listen(&self, name: &str) -> Result<HubAcceptor, BusError> {
        let mut listeners = self.listeners();
        if listeners.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(BusError::AlreadyConnected {
                name: name.to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(name.to_string(), tx);
        debug!("Hub listening on {}", name);
        Ok(HubAcceptor {
            name: name.to_string(),
            rx,
        })
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners()
            .get(name)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Connector for PortHub {
    async fn connect(&self, name: &str) -> Result<Port, BusError> {
        let no_listener = || BusError::NoListener {
            name: name.to_string(),
        };
        let mut listeners = self.listeners();
        let tx = listeners.get(name).ok_or_else(no_listener)?;
        let (local, remote) = Port::pair(name);
        if tx.send(remote).is_err() {
            listeners.remove(name);
            return Err(no_listener());
        }
        Ok(local)
    }
}

/// Accepting side of a hub listen.
#[derive(Debug)]
pub struct HubAcceptor {
    name: String,
    rx: mpsc::UnboundedReceiver<Port>,
}

impl HubAcceptor {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Acceptor for HubAcceptor {
    async fn accept(&mut self) -> Option<Port> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let hub = PortHub::new();
        let err = hub.connect("bus").await.unwrap_err();
        assert!(matches!(err, BusError::NoListener { .. }));
    }

    #[tokio::test]
    async fn connect_reaches_the_acceptor() {
        let hub = PortHub::new();
        let mut acceptor = hub.listen("bus").unwrap();
        let local = hub.connect("bus").await.unwrap();
        let mut remote = acceptor.accept().await.unwrap();

        assert_eq!(remote.name(), "bus");
        local.post(json!({ "hello": 1 })).unwrap();
        assert_eq!(remote.recv().await, Some(json!({ "hello": 1 })));
    }

    #[tokio::test]
    async fn dropped_acceptor_frees_the_name() {
        let hub = PortHub::new();
        let acceptor = hub.listen("bus").unwrap();
        assert!(hub.listen("bus").is_err());
        drop(acceptor);

        assert!(!hub.is_listening("bus"));
        assert!(matches!(
            hub.connect("bus").await,
            Err(BusError::NoListener { .. })
        ));
        assert!(hub.listen("bus").is_ok());
    }
}
