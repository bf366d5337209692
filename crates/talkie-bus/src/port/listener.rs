use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::transport::{Acceptor, Port, PortSender};

use super::base::{PortProviderBase, PortState, Transition};
use super::{PortHandle, PortObserver};

type Ports = Arc<Mutex<HashMap<u64, PortSender>>>;

fn lock_ports(ports: &Ports) -> MutexGuard<'_, HashMap<u64, PortSender>> {
    ports.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the accepting side of one named port; any number of contexts may be
/// connected to it at once.
pub struct PortListenerProvider {
    base: Arc<PortProviderBase>,
    observer: Arc<dyn PortObserver>,
    ports: Ports,
    next_id: Arc<AtomicU64>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl PortListenerProvider {
    pub fn new(name: impl Into<String>, observer: Arc<dyn PortObserver>) -> Self {
        Self {
            base: Arc::new(PortProviderBase::new(name)),
            observer,
            ports: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            accept_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn state(&self) -> PortState {
        self.base.state()
    }

    pub fn port_count(&self) -> usize {
        lock_ports(&self.ports).len()
    }

    fn accept_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.accept_task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start accepting ports from `acceptor`.
    ///
    /// Fails with [`BusError::AlreadyConnected`] when already started.
    pub async fn start<A: Acceptor>(&self, acceptor: A) -> Result<(), BusError> {
        let guard = match self.base.begin_connect().await? {
            Transition::Joined => return Ok(()),
            Transition::Owned(guard) => guard,
        };
        let task = tokio::spawn(accept_loop(
            acceptor,
            Arc::clone(&self.base),
            Arc::clone(&self.observer),
            Arc::clone(&self.ports),
            Arc::clone(&self.next_id),
        ));
        if let Some(stale) = self.accept_task().replace(task) {
            stale.abort();
        }
        guard.complete(PortState::Connected);
        info!("Listening for contexts on {}", self.base.name());
        Ok(())
    }

    /// Stop accepting and drop every connected port.
    pub async fn stop(&self) -> Result<(), BusError> {
        let guard = match self.base.begin_disconnect().await? {
            Transition::Joined => return Ok(()),
            Transition::Owned(guard) => guard,
        };
        if let Some(task) = self.accept_task().take() {
            task.abort();
        }
        lock_ports(&self.ports).clear();
        guard.complete(PortState::Disconnected);
        info!("Stopped listening on {}", self.base.name());
        Ok(())
    }

    /// Serialize `payload` once and post it to every connected port.
    ///
    /// Returns how many ports it was delivered to; ports found closed are dropped.
    pub fn post_all<T: Serialize + ?Sized>(&self, payload: &T) -> Result<usize, BusError> {
        self.base.ensure_connected()?;
        let frame = serde_json::to_value(payload)?;
        let mut ports = lock_ports(&self.ports);
        ports.retain(|id, sender| match sender.post(frame.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Dropping closed port #{} on {}", id, sender.name());
                false
            }
        });
        Ok(ports.len())
    }
}

impl Drop for PortListenerProvider {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task().take() {
            task.abort();
        }
    }
}

async fn accept_loop<A: Acceptor>(
    mut acceptor: A,
    base: Arc<PortProviderBase>,
    observer: Arc<dyn PortObserver>,
    ports: Ports,
    next_id: Arc<AtomicU64>,
) {
    // Readers live in the set so that aborting this task tears them all down.
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            incoming = acceptor.accept() => {
                let Some(port) = incoming else { break };
                if port.name() != base.name() {
                    let violation = BusError::PortNameMismatch {
                        expected: base.name().to_string(),
                        actual: port.name().to_string(),
                    };
                    error!("Rejecting port: {}", violation);
                    continue;
                }
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                readers.spawn(serve_port(
                    id,
                    port,
                    Arc::clone(&observer),
                    Arc::clone(&ports),
                ));
            }
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
    if base.mark_lost() {
        warn!("Transport for {} stopped accepting", base.name());
    }
    while readers.join_next().await.is_some() {}
}

async fn serve_port(id: u64, port: Port, observer: Arc<dyn PortObserver>, ports: Ports) {
    let (sender, mut receiver) = port.split();
    let handle = PortHandle::new(id, sender.clone());
    lock_ports(&ports).insert(id, sender);
    observer.on_connect(&handle);

    while let Some(frame) = receiver.recv().await {
        observer.on_message(&handle, frame);
    }

    lock_ports(&ports).remove(&id);
    observer.on_disconnect(&handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, PortHub};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    /// Forwards every inbound frame to a channel.
    struct Forward(mpsc::UnboundedSender<(u64, Value)>);

    impl PortObserver for Forward {
        fn on_message(&self, port: &PortHandle, frame: Value) {
            let _ = self.0.send((port.id(), frame));
        }
    }

    /// Acceptor over a plain channel of ports, to inject misnamed ports.
    struct Channel(mpsc::UnboundedReceiver<Port>);

    #[async_trait::async_trait]
    impl Acceptor for Channel {
        async fn accept(&mut self) -> Option<Port> {
            self.0.recv().await
        }
    }

    async fn wait_for_ports(listener: &PortListenerProvider, n: usize) {
        while listener.port_count() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn frames_from_several_contexts_reach_the_observer() {
        let hub = PortHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = PortListenerProvider::new("bus", Arc::new(Forward(tx)));
        listener.start(hub.listen("bus").unwrap()).await.unwrap();

        let popup = hub.connect("bus").await.unwrap();
        let options = hub.connect("bus").await.unwrap();
        popup.post(json!("from popup")).unwrap();
        options.post(json!("from options")).unwrap();

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|(id, _)| *id);
        assert_ne!(seen[0].0, seen[1].0);
        let frames: Vec<Value> = seen.into_iter().map(|(_, f)| f).collect();
        assert!(frames.contains(&json!("from popup")));
        assert!(frames.contains(&json!("from options")));
    }

    #[tokio::test]
    async fn post_all_reaches_every_port() {
        let hub = PortHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = PortListenerProvider::new("bus", Arc::new(Forward(tx)));
        assert!(matches!(
            listener.post_all(&json!(1)),
            Err(BusError::NotConnected { .. })
        ));
        listener.start(hub.listen("bus").unwrap()).await.unwrap();

        let mut a = hub.connect("bus").await.unwrap();
        let mut b = hub.connect("bus").await.unwrap();
        wait_for_ports(&listener, 2).await;

        assert_eq!(listener.post_all(&json!({ "progress": 0.5 })).unwrap(), 2);
        assert_eq!(a.recv().await, Some(json!({ "progress": 0.5 })));
        assert_eq!(b.recv().await, Some(json!({ "progress": 0.5 })));
    }

    #[tokio::test]
    async fn misnamed_port_is_rejected() {
        let (port_tx, port_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = PortListenerProvider::new("bus", Arc::new(Forward(tx)));
        listener.start(Channel(port_rx)).await.unwrap();

        let (mut local, remote) = Port::pair("not-the-bus");
        port_tx.send(remote).unwrap();
        assert_eq!(local.recv().await, None);
        assert_eq!(listener.port_count(), 0);
    }

    #[tokio::test]
    async fn start_twice_fails_and_stop_closes_ports() {
        let hub = PortHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = PortListenerProvider::new("bus", Arc::new(Forward(tx)));
        listener.start(hub.listen("bus").unwrap()).await.unwrap();

        let (_other_tx, other_rx) = mpsc::unbounded_channel();
        assert!(matches!(
            listener.start(Channel(other_rx)).await,
            Err(BusError::AlreadyConnected { .. })
        ));

        let mut popup = hub.connect("bus").await.unwrap();
        wait_for_ports(&listener, 1).await;
        listener.stop().await.unwrap();
        assert_eq!(popup.recv().await, None);
        assert_eq!(listener.state(), PortState::Disconnected);
    }
}
