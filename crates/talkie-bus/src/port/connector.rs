use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::transport::{Connector, PortReceiver};

use super::base::{PortProviderBase, PortState, Transition};
use super::{PortHandle, PortObserver};

struct Link {
    handle: PortHandle,
    reader: JoinHandle<()>,
}

/// Owns the connecting side of one named port.
///
/// Inbound frames are handed to the observer from a reader task. If the far
/// side closes the port, the provider drops back to `Disconnected` on its own.
pub struct PortConnectorProvider {
    base: Arc<PortProviderBase>,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn PortObserver>,
    link: Mutex<Option<Link>>,
    next_id: AtomicU64,
}

impl PortConnectorProvider {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn PortObserver>,
    ) -> Self {
        Self {
            base: Arc::new(PortProviderBase::new(name)),
            connector,
            observer,
            link: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn state(&self) -> PortState {
        self.base.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PortState::Connected
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the port.
    ///
    /// Fails with [`BusError::AlreadyConnected`] when connected. A call made
    /// while another connect is in flight waits for that attempt instead.
    pub async fn connect(&self) -> Result<(), BusError> {
        let guard = match self.base.begin_connect().await? {
            Transition::Joined => return Ok(()),
            Transition::Owned(guard) => guard,
        };

        let port = self.connector.connect(self.base.name()).await?;
        if port.name() != self.base.name() {
            return Err(BusError::PortNameMismatch {
                expected: self.base.name().to_string(),
                actual: port.name().to_string(),
            });
        }

        let (sender, receiver) = port.split();
        let handle = PortHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), sender);
        self.observer.on_connect(&handle);
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.base),
            Arc::clone(&self.observer),
            handle.clone(),
            receiver,
        ));
        if let Some(stale) = self.link().replace(Link { handle, reader }) {
            stale.reader.abort();
        }
        guard.complete(PortState::Connected);
        debug!("Port {} connected", self.base.name());
        Ok(())
    }

    /// Close the port.
    ///
    /// Fails with [`BusError::NotConnected`] unless connected or already
    /// disconnecting, in which case the in-flight disconnect is awaited.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        let guard = match self.base.begin_disconnect().await? {
            Transition::Joined => return Ok(()),
            Transition::Owned(guard) => guard,
        };
        let link = self.link().take();
        guard.complete(PortState::Disconnected);
        if let Some(link) = link {
            link.reader.abort();
            self.observer.on_disconnect(&link.handle);
        }
        debug!("Port {} disconnected", self.base.name());
        Ok(())
    }

    /// Serialize `payload` and post it on the port.
    pub fn post_message<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), BusError> {
        self.base.ensure_connected()?;
        let frame = serde_json::to_value(payload)?;
        let link = self.link();
        let link = link.as_ref().ok_or_else(|| BusError::NotConnected {
            name: self.base.name().to_string(),
        })?;
        link.handle.sender.post(frame)
    }
}

impl Drop for PortConnectorProvider {
    fn drop(&mut self) {
        if let Some(link) = self.link().take() {
            link.reader.abort();
        }
    }
}

async fn read_loop(
    base: Arc<PortProviderBase>,
    observer: Arc<dyn PortObserver>,
    handle: PortHandle,
    mut receiver: PortReceiver,
) {
    while let Some(frame) = receiver.recv().await {
        observer.on_message(&handle, frame);
    }
    if base.mark_lost() {
        warn!("Port {} was closed by the other side", base.name());
        observer.on_disconnect(&handle);
    }
}
