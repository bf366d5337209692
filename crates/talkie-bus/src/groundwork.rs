//! Foreground side of the message bus.
//!
//! Every foreground context talks to the background through one
//! [`MessageBusGroundwork`]. The typed wrappers below it (speaking, settings,
//! events, metadata) only pick the action and the payload shape.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use talkie_types::config::BusConfig;
use talkie_types::ipc::{BroadcastRelay, BusRequest, Done, PlatformInfo, SpeakRequest};
use talkie_types::settings::SetSetting;
use talkie_types::{KnownAction, KnownEvent};

use crate::error::BusError;
use crate::port::RespondingPortConnectorProvider;
use crate::retry::{RetryError, RetryPolicy};
use crate::transport::Connector;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct MessageBusGroundwork {
    connector: Arc<RespondingPortConnectorProvider>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl MessageBusGroundwork {
    pub fn new(
        connector: Arc<RespondingPortConnectorProvider>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            retry,
            timeout,
        }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &BusConfig) -> Self {
        Self::new(
            Arc::new(RespondingPortConnectorProvider::new(
                config.port_name.clone(),
                connector,
            )),
            RetryPolicy::from_config(config),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    pub fn port_name(&self) -> &str {
        self.connector.name()
    }

    /// Keep the port open between requests, waiting for the background with
    /// the retry policy. Notifications only arrive while the port is held.
    pub async fn hold(&self) -> Result<(), BusError> {
        let connector = &self.connector;
        match self.retry.run(|_| connector.hold()).await {
            Ok(()) => Ok(()),
            Err(RetryError::Fatal(e)) => Err(e),
            Err(RetryError::Exhausted { last, .. }) => Err(last),
        }
    }

    /// Undo one [`hold`](Self::hold).
    pub async fn release(&self) -> Result<(), BusError> {
        self.connector.release().await
    }

    /// Ask the background to perform `action` and decode its answer.
    pub async fn bespeak<M, R>(&self, action: KnownAction, message: &M) -> Result<R, BusError>
    where
        M: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.bespeak_with_timeout(action, message, self.timeout).await
    }

    pub async fn bespeak_with_timeout<M, R>(
        &self,
        action: KnownAction,
        message: &M,
        timeout: Duration,
    ) -> Result<R, BusError>
    where
        M: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(BusRequest {
            action,
            data: serde_json::to_value(message)?,
        })?;

        let connector = &self.connector;
        let outcome = self
            .retry
            .run(|attempt| {
                let payload = payload.clone();
                async move {
                    if attempt > 1 {
                        debug!("Retrying {} (attempt {})", action, attempt);
                    }
                    connector.request(payload, timeout).await
                }
            })
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(RetryError::Fatal(e)) => {
                if e.is_timeout() {
                    warn!("{} timed out after {:?}", action, timeout);
                }
                return Err(e);
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                return Err(BusError::GivingUp {
                    action,
                    attempts,
                    message: format!("{} (message: {})", last, payload),
                });
            }
        };

        match response {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(BusError::NoResponse { action }),
        }
    }

    /// Notify the background of `action`; resolves once it acknowledged.
    pub async fn betoken<M>(&self, action: KnownAction, message: &M) -> Result<Done, BusError>
    where
        M: Serialize + ?Sized,
    {
        self.bespeak(action, message).await
    }
}

// ─── Typed wrappers ───────────────────────────────────────────────────────────

pub struct SpeakingGroundwork {
    bus: Arc<MessageBusGroundwork>,
}

impl SpeakingGroundwork {
    pub fn new(bus: Arc<MessageBusGroundwork>) -> Self {
        Self { bus }
    }

    pub async fn start_speaking(&self, text: &str, voice: Option<&str>) -> Result<Done, BusError> {
        let request = SpeakRequest {
            text: text.to_string(),
            voice: voice.map(str::to_string),
        };
        self.bus.betoken(KnownAction::StartSpeaking, &request).await
    }

    pub async fn stop_speaking(&self) -> Result<Done, BusError> {
        self.bus.betoken(KnownAction::StopSpeaking, &()).await
    }

    pub async fn is_speaking(&self) -> Result<bool, BusError> {
        self.bus.bespeak(KnownAction::IsSpeaking, &()).await
    }
}

pub struct SettingsGroundwork {
    bus: Arc<MessageBusGroundwork>,
}

impl SettingsGroundwork {
    pub fn new(bus: Arc<MessageBusGroundwork>) -> Self {
        Self { bus }
    }

    /// `Ok(None)` when the key was never stored.
    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>, BusError> {
        self.bus.bespeak(KnownAction::GetSetting, key).await
    }

    pub async fn set_setting(&self, key: &str, value: Value) -> Result<Done, BusError> {
        let request = SetSetting {
            key: key.to_string(),
            value,
        };
        self.bus.betoken(KnownAction::SetSetting, &request).await
    }
}

pub struct EventsGroundwork {
    bus: Arc<MessageBusGroundwork>,
}

impl EventsGroundwork {
    pub fn new(bus: Arc<MessageBusGroundwork>) -> Self {
        Self { bus }
    }

    /// Have the background broadcast `event` to its own listeners.
    pub async fn relay<T: Serialize + ?Sized>(
        &self,
        event: KnownEvent,
        payload: &T,
    ) -> Result<Done, BusError> {
        let relay = BroadcastRelay {
            event,
            payload: serde_json::to_value(payload)?,
        };
        self.bus.betoken(KnownAction::Broadcast, &relay).await
    }
}

/// Read-only facts about the background, fetched once and cached.
pub struct MetadataCoating {
    bus: Arc<MessageBusGroundwork>,
    version: tokio::sync::OnceCell<String>,
    platform: tokio::sync::OnceCell<PlatformInfo>,
}

impl MetadataCoating {
    pub fn new(bus: Arc<MessageBusGroundwork>) -> Self {
        Self {
            bus,
            version: tokio::sync::OnceCell::new(),
            platform: tokio::sync::OnceCell::new(),
        }
    }

    pub async fn version(&self) -> Result<&str, BusError> {
        let version = self
            .version
            .get_or_try_init(|| self.bus.bespeak(KnownAction::GetVersion, &()))
            .await?;
        Ok(version.as_str())
    }

    pub async fn platform(&self) -> Result<&PlatformInfo, BusError> {
        self.platform
            .get_or_try_init(|| self.bus.bespeak(KnownAction::GetPlatform, &()))
            .await
    }
}
