//! Wiring of a background context and of the foreground contexts that talk to it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use talkie_types::config::TalkieConfig;
use talkie_types::ipc::{BroadcastRelay, PlatformInfo, SpeakRequest};
use talkie_types::settings::SetSetting;
use talkie_types::{KnownAction, KnownEvent};

use crate::broadcaster::Broadcaster;
use crate::context::{ContextKind, SharedContext};
use crate::error::BusError;
use crate::groundwork::{
    EventsGroundwork, MessageBusGroundwork, MetadataCoating, SettingsGroundwork,
    SpeakingGroundwork,
};
use crate::liveness::LivenessProbe;
use crate::port::RespondingPortConnectorProvider;
use crate::retry::RetryPolicy;
use crate::service::{action_fn, ActionError, MessageBusService};
use crate::settings::SettingsManager;
use crate::storage::Storage;
use crate::transport::{Acceptor, Connector};

#[async_trait]
pub trait SpeechEngine: Send + Sync + 'static {
    /// Resolves once the text has been spoken or speech was stopped.
    async fn speak(&self, text: &str, voice: Option<&str>) -> Result<(), ActionError>;
    async fn stop(&self) -> Result<(), ActionError>;
}

/// Speech engine that only logs.
#[derive(Debug, Default)]
pub struct NullSpeech;

#[async_trait]
impl SpeechEngine for NullSpeech {
    async fn speak(&self, text: &str, voice: Option<&str>) -> Result<(), ActionError> {
        info!("Speaking {} chars (voice: {})", text.chars().count(), voice.unwrap_or("default"));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ActionError> {
        debug!("Stop requested");
        Ok(())
    }
}

// ─── Background ───────────────────────────────────────────────────────────────

/// The background context: owns the settings, the speech engine and the
/// message-bus service every foreground context talks to.
///
/// Every event broadcast here is also forwarded to the foreground contexts
/// holding a port to the service.
pub struct Background {
    context: SharedContext,
    broadcaster: Broadcaster,
    settings: SettingsManager,
    service: MessageBusService,
    /// Utterances in flight.
    speaking: Arc<AtomicUsize>,
}

impl Background {
    pub fn new(
        config: &TalkieConfig,
        storage: Arc<dyn Storage>,
        speech: Arc<dyn SpeechEngine>,
    ) -> Self {
        let broadcaster = Broadcaster::new(LivenessProbe::from_config(&config.liveness));
        let settings = SettingsManager::new(storage, broadcaster.clone());
        let background = Self {
            context: SharedContext::new(ContextKind::Background),
            broadcaster,
            settings,
            service: MessageBusService::new(config.bus.port_name.clone()),
            speaking: Arc::new(AtomicUsize::new(0)),
        };
        background.register_actions(speech);
        let forwarder = background.service.forwarder();
        for event in KnownEvent::ALL {
            background.broadcaster.register(
                background.context.handle(),
                event,
                forwarder.clone(),
            );
        }
        background
    }

    fn register_actions(&self, speech: Arc<dyn SpeechEngine>) {
        let settings = self.settings.clone();
        self.service.register(
            KnownAction::GetSetting,
            action_fn(move |data| get_setting(settings.clone(), data)),
        );

        let settings = self.settings.clone();
        self.service.register(
            KnownAction::SetSetting,
            action_fn(move |data| set_setting(settings.clone(), data)),
        );

        let speaker = Speaker {
            engine: speech,
            broadcaster: self.broadcaster.clone(),
            speaking: self.speaking.clone(),
        };
        let start = speaker.clone();
        self.service.register(
            KnownAction::StartSpeaking,
            action_fn(move |data| start.clone().start(data)),
        );
        self.service.register(
            KnownAction::StopSpeaking,
            action_fn(move |_| speaker.clone().stop()),
        );

        let speaking = self.speaking.clone();
        self.service.register(
            KnownAction::IsSpeaking,
            action_fn(move |_| {
                let speaking = speaking.load(Ordering::SeqCst) > 0;
                async move { Ok(Some(json!(speaking))) }
            }),
        );

        self.service.register(
            KnownAction::GetVersion,
            action_fn(|_| async { Ok(Some(json!(env!("CARGO_PKG_VERSION")))) }),
        );

        self.service.register(
            KnownAction::GetPlatform,
            action_fn(|_| async { Ok(Some(json!(PlatformInfo::current()))) }),
        );

        let broadcaster = self.broadcaster.clone();
        self.service.register(
            KnownAction::Broadcast,
            action_fn(move |data| relay(broadcaster.clone(), data)),
        );
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn settings(&self) -> &SettingsManager {
        &self.settings
    }

    pub fn service(&self) -> &MessageBusService {
        &self.service
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst) > 0
    }

    pub async fn start<A: Acceptor>(&self, acceptor: A) -> Result<(), BusError> {
        self.service.start(acceptor).await
    }

    pub async fn stop(&self) -> Result<(), BusError> {
        self.service.stop().await
    }
}

async fn get_setting(settings: SettingsManager, data: Value) -> Result<Option<Value>, ActionError> {
    let key: String = serde_json::from_value(data)?;
    let value = settings.get_stored_value(&key).await?;
    Ok(Some(value.unwrap_or(Value::Null)))
}

async fn set_setting(settings: SettingsManager, data: Value) -> Result<Option<Value>, ActionError> {
    let request: SetSetting = serde_json::from_value(data)?;
    settings.set_stored_value(&request.key, &request.value).await?;
    Ok(None)
}

async fn relay(broadcaster: Broadcaster, data: Value) -> Result<Option<Value>, ActionError> {
    let relay: BroadcastRelay = serde_json::from_value(data)?;
    broadcaster.broadcast(relay.event, &relay.payload).await?;
    Ok(None)
}

#[derive(Clone)]
struct Speaker {
    engine: Arc<dyn SpeechEngine>,
    broadcaster: Broadcaster,
    speaking: Arc<AtomicUsize>,
}

impl Speaker {
    /// Acknowledges as soon as speech has started; `afterSpeaking` follows
    /// once the engine is done.
    async fn start(self, data: Value) -> Result<Option<Value>, ActionError> {
        let request: SpeakRequest = serde_json::from_value(data)?;
        let payload = json!({ "text": request.text });
        self.broadcaster
            .broadcast(KnownEvent::BeforeSpeaking, &payload)
            .await?;

        self.speaking.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let spoken = self
                .engine
                .speak(&request.text, request.voice.as_deref())
                .await;
            self.speaking.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = spoken {
                warn!("Speech failed: {}", e);
                return;
            }
            if let Err(e) = self
                .broadcaster
                .broadcast(KnownEvent::AfterSpeaking, &payload)
                .await
            {
                warn!("afterSpeaking listeners failed: {}", e);
            }
        });
        Ok(None)
    }

    async fn stop(self) -> Result<Option<Value>, ActionError> {
        self.engine.stop().await?;
        self.broadcaster
            .broadcast(KnownEvent::StopSpeaking, &())
            .await?;
        Ok(None)
    }
}

// ─── Foreground ───────────────────────────────────────────────────────────────

/// A foreground context (popup, options page, content script) and its typed
/// views of the message bus.
///
/// Events forwarded by the background reach [`broadcaster`](Self::broadcaster)
/// while the context is [attached](Self::attach).
pub struct Foreground {
    context: SharedContext,
    broadcaster: Broadcaster,
    bus: Arc<MessageBusGroundwork>,
    pub speaking: SpeakingGroundwork,
    pub settings: SettingsGroundwork,
    pub events: EventsGroundwork,
    pub metadata: MetadataCoating,
}

impl Foreground {
    pub fn new(kind: ContextKind, connector: Arc<dyn Connector>, config: &TalkieConfig) -> Self {
        let broadcaster = Broadcaster::new(LivenessProbe::from_config(&config.liveness));
        let provider = RespondingPortConnectorProvider::with_events(
            config.bus.port_name.clone(),
            connector,
            broadcaster.clone(),
        );
        let bus = Arc::new(MessageBusGroundwork::new(
            Arc::new(provider),
            RetryPolicy::from_config(&config.bus),
            Duration::from_millis(config.bus.request_timeout_ms),
        ));
        Self {
            context: SharedContext::new(kind),
            broadcaster,
            bus: bus.clone(),
            speaking: SpeakingGroundwork::new(bus.clone()),
            settings: SettingsGroundwork::new(bus.clone()),
            events: EventsGroundwork::new(bus.clone()),
            metadata: MetadataCoating::new(bus),
        }
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Local listeners for this context, including events forwarded by the
    /// background.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Keep the port to the background open so its events keep arriving.
    pub async fn attach(&self) -> Result<(), BusError> {
        self.bus.hold().await?;
        debug!("{} attached to {}", self.context.kind(), self.bus.port_name());
        Ok(())
    }

    pub async fn detach(&self) -> Result<(), BusError> {
        self.bus.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::listener_fn;
    use crate::storage::MemoryStorage;
    use crate::transport::PortHub;
    use tokio::sync::{mpsc, Notify};

    async fn running_with(hub: &PortHub, speech: Arc<dyn SpeechEngine>) -> Background {
        let config = TalkieConfig::default();
        let background = Background::new(&config, Arc::new(MemoryStorage::new()), speech);
        background
            .start(hub.listen(&config.bus.port_name).unwrap())
            .await
            .unwrap();
        background
    }

    async fn running(hub: &PortHub) -> Background {
        running_with(hub, Arc::new(NullSpeech)).await
    }

    fn foreground(hub: &PortHub, kind: ContextKind) -> Foreground {
        Foreground::new(kind, Arc::new(hub.clone()), &TalkieConfig::default())
    }

    /// Sends every `(event, payload)` seen on `broadcaster` for `events`.
    fn record(
        broadcaster: &Broadcaster,
        owner: &SharedContext,
        events: &[KnownEvent],
    ) -> mpsc::UnboundedReceiver<(KnownEvent, Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        for &event in events {
            let tx = tx.clone();
            broadcaster.register(
                owner.handle(),
                event,
                listener_fn(move |event, payload| {
                    let _ = tx.send((event, payload));
                    async { Ok(None) }
                }),
            );
        }
        rx
    }

    /// Speaks until released, one utterance per permit.
    struct GatedSpeech {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl SpeechEngine for GatedSpeech {
        async fn speak(&self, _text: &str, _voice: Option<&str>) -> Result<(), ActionError> {
            self.gate.notified().await;
            Ok(())
        }

        async fn stop(&self) -> Result<(), ActionError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn settings_round_trip_through_the_bus() {
        let hub = PortHub::new();
        let _background = running(&hub).await;
        let popup = foreground(&hub, ContextKind::Popup);

        assert_eq!(popup.settings.get_setting("voice").await.unwrap(), None);
        popup.settings.set_setting("voice", json!("alice")).await.unwrap();
        assert_eq!(
            popup.settings.get_setting("voice").await.unwrap(),
            Some(json!("alice"))
        );
    }

    #[tokio::test]
    async fn speaking_is_framed_by_events() {
        let hub = PortHub::new();
        let background = running(&hub).await;
        let mut seen = record(
            background.broadcaster(),
            background.context(),
            &[KnownEvent::BeforeSpeaking, KnownEvent::AfterSpeaking],
        );

        let popup = foreground(&hub, ContextKind::Popup);
        popup.speaking.start_speaking("hello", None).await.unwrap();

        let before = seen.recv().await.unwrap();
        assert_eq!(before, (KnownEvent::BeforeSpeaking, json!({ "text": "hello" })));
        let after = seen.recv().await.unwrap();
        assert_eq!(after, (KnownEvent::AfterSpeaking, json!({ "text": "hello" })));
        assert!(!popup.speaking.is_speaking().await.unwrap());
    }

    #[tokio::test]
    async fn long_speech_is_acknowledged_before_it_ends() {
        let hub = PortHub::new();
        let gate = Arc::new(Notify::new());
        let background = running_with(&hub, Arc::new(GatedSpeech { gate: gate.clone() })).await;
        let mut after = record(
            background.broadcaster(),
            background.context(),
            &[KnownEvent::AfterSpeaking],
        );
        let popup = foreground(&hub, ContextKind::Popup);

        popup.speaking.start_speaking("first", None).await.unwrap();
        popup.speaking.start_speaking("second", None).await.unwrap();
        assert!(popup.speaking.is_speaking().await.unwrap());

        gate.notify_one();
        after.recv().await.unwrap();
        assert!(background.is_speaking());

        gate.notify_one();
        after.recv().await.unwrap();
        assert!(!background.is_speaking());
        assert!(!popup.speaking.is_speaking().await.unwrap());
    }

    #[tokio::test]
    async fn relayed_events_reach_background_listeners() {
        let hub = PortHub::new();
        let background = running(&hub).await;
        let mut seen = record(
            background.broadcaster(),
            background.context(),
            &[KnownEvent::PassSelectedTextToBackground],
        );
        let content = foreground(&hub, ContextKind::ContentScript);

        content
            .events
            .relay(KnownEvent::PassSelectedTextToBackground, "some words")
            .await
            .unwrap();
        assert_eq!(
            seen.recv().await.unwrap(),
            (KnownEvent::PassSelectedTextToBackground, json!("some words"))
        );
    }

    #[tokio::test]
    async fn attached_foreground_hears_background_events() {
        let hub = PortHub::new();
        let background = running(&hub).await;
        let popup = foreground(&hub, ContextKind::Popup);
        let mut seen = record(popup.broadcaster(), popup.context(), &[KnownEvent::SettingChanged]);
        popup.attach().await.unwrap();
        while background.service().connected_contexts() < 1 {
            tokio::task::yield_now().await;
        }

        let options = foreground(&hub, ContextKind::Options);
        options.settings.set_setting("rate", json!(1.5)).await.unwrap();

        let (event, payload) = seen.recv().await.unwrap();
        assert_eq!(event, KnownEvent::SettingChanged);
        assert_eq!(payload["key"], json!("rate"));
        assert_eq!(payload["value"], json!(1.5));
        popup.detach().await.unwrap();
    }

    #[tokio::test]
    async fn metadata_is_served() {
        let hub = PortHub::new();
        let _background = running(&hub).await;
        let options = foreground(&hub, ContextKind::Options);

        assert_eq!(options.metadata.version().await.unwrap(), env!("CARGO_PKG_VERSION"));
        assert_eq!(options.metadata.platform().await.unwrap(), &PlatformInfo::current());
    }
}
