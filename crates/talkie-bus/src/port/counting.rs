use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::BusError;
use crate::transport::Connector;

use super::base::PortState;
use super::{PortConnectorProvider, PortObserver};

/// Shares one physical port between any number of logical holders.
///
/// The first `connect` opens the port and the `disconnect` that releases the
/// last holder closes it; every other call only moves the holder count.
pub struct CountingPortConnectorProvider {
    provider: PortConnectorProvider,
    holders: Mutex<usize>,
}

impl CountingPortConnectorProvider {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn PortObserver>,
    ) -> Self {
        Self {
            provider: PortConnectorProvider::new(name, connector, observer),
            holders: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn state(&self) -> PortState {
        self.provider.state()
    }

    /// Number of outstanding logical connects.
    pub async fn holders(&self) -> usize {
        *self.holders.lock().await
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        let mut holders = self.holders.lock().await;
        // Also reopen when the far side dropped the port under existing holders.
        if !self.provider.is_connected() {
            self.provider.connect().await?;
        }
        *holders += 1;
        debug!("Port {} holders: {}", self.provider.name(), *holders);
        Ok(())
    }

    /// Release one holder. Fails with [`BusError::NotConnected`] when there is
    /// nobody to release; the count never goes below zero.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        let mut holders = self.holders.lock().await;
        let remaining = holders.checked_sub(1).ok_or_else(|| BusError::NotConnected {
            name: self.provider.name().to_string(),
        })?;
        if remaining == 0 && self.provider.is_connected() {
            self.provider.disconnect().await?;
        }
        *holders = remaining;
        debug!("Port {} holders: {}", self.provider.name(), remaining);
        Ok(())
    }

    pub fn post_message<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), BusError> {
        self.provider.post_message(payload)
    }
}
