use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use talkie_bus::port::{CountingPortConnectorProvider, TracingObserver};
use talkie_bus::transport::{Acceptor, Connector, Port, PortHub};
use talkie_bus::{
    action_fn, listener_fn, Background, Broadcaster, BusError, ContextKind, Foreground,
    ListenerError, MemoryStorage, MessageBusGroundwork, MessageBusService, NullSpeech,
    SharedContext,
};
use talkie_types::config::TalkieConfig;
use talkie_types::ipc::Done;
use talkie_types::settings::SettingChange;
use talkie_types::{KnownAction, KnownEvent};

/// Connector that counts physical opens and can refuse the first few.
struct Flaky {
    hub: PortHub,
    refuse: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(hub: &PortHub, refuse: u32) -> Self {
        Self {
            hub: hub.clone(),
            refuse,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Connector for Flaky {
    async fn connect(&self, name: &str) -> Result<Port, BusError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.refuse {
            return Err(BusError::NoListener {
                name: name.to_string(),
            });
        }
        self.hub.connect(name).await
    }
}

#[tokio::test]
async fn two_after_speaking_listeners_both_answer() {
    let broadcaster = Broadcaster::default();
    let popup = SharedContext::new(ContextKind::Popup);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second"] {
        let sink = seen.clone();
        broadcaster.register(
            popup.handle(),
            KnownEvent::AfterSpeaking,
            listener_fn(move |event, payload| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push((event, payload));
                    Ok(Some(json!(tag)))
                }
            }),
        );
    }

    let results = broadcaster
        .broadcast(KnownEvent::AfterSpeaking, &json!({ "ok": true }))
        .await
        .unwrap();

    assert_eq!(results, vec![Some(json!("first")), Some(json!("second"))]);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for (event, payload) in seen.iter() {
        assert_eq!(*event, KnownEvent::AfterSpeaking);
        assert_eq!(*payload, json!({ "ok": true }));
    }
}

#[tokio::test]
async fn unloaded_context_listener_is_pruned() {
    let broadcaster = Broadcaster::default();
    let background = SharedContext::new(ContextKind::Background);
    let content = SharedContext::new(ContextKind::ContentScript);

    broadcaster.register(
        background.handle(),
        KnownEvent::ProgressUpdate,
        listener_fn(|_, _| async { Ok(Some(json!("alive"))) }),
    );
    broadcaster.register(
        content.handle(),
        KnownEvent::ProgressUpdate,
        listener_fn(|_, _| async { Ok(Some(json!("unreachable"))) }),
    );
    drop(content);

    let results = broadcaster
        .broadcast(KnownEvent::ProgressUpdate, &json!(0.5))
        .await
        .unwrap();
    assert_eq!(results, vec![Some(json!("alive")), None]);
    assert_eq!(broadcaster.listener_count(KnownEvent::ProgressUpdate), 1);
}

#[tokio::test]
async fn two_holders_close_the_port_once() {
    let hub = PortHub::new();
    let mut acceptor = hub.listen("speech").unwrap();
    let connector = Arc::new(Flaky::new(&hub, 0));
    let port = CountingPortConnectorProvider::new(
        "speech",
        connector.clone(),
        Arc::new(TracingObserver),
    );

    port.connect().await.unwrap();
    port.connect().await.unwrap();
    assert_eq!(port.holders().await, 2);
    assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    let mut remote = acceptor.accept().await.unwrap();

    port.disconnect().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(50), remote.recv())
            .await
            .is_err(),
        "port closed while a holder remained"
    );

    port.disconnect().await.unwrap();
    assert_eq!(remote.recv().await, None);
    assert!(matches!(
        port.disconnect().await,
        Err(BusError::NotConnected { .. })
    ));
    assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
}

async fn done_service(hub: &PortHub) -> MessageBusService {
    let service = MessageBusService::new("talkie-message-bus");
    service.register(KnownAction::StopSpeaking, action_fn(|_| async { Ok(None) }));
    service
        .start(hub.listen("talkie-message-bus").unwrap())
        .await
        .unwrap();
    service
}

#[tokio::test(start_paused = true)]
async fn betoken_succeeds_after_transient_failures() {
    let hub = PortHub::new();
    let _service = done_service(&hub).await;
    let connector = Arc::new(Flaky::new(&hub, 6));
    let bus = MessageBusGroundwork::from_config(connector.clone(), &TalkieConfig::default().bus);

    let done = bus.betoken(KnownAction::StopSpeaking, &()).await.unwrap();
    assert_eq!(done, Done::YES);
    assert_eq!(connector.calls.load(Ordering::SeqCst), 7);
}

#[tokio::test(start_paused = true)]
async fn betoken_gives_up_after_ten_attempts() {
    let hub = PortHub::new();
    let _service = done_service(&hub).await;
    let connector = Arc::new(Flaky::new(&hub, 100));
    let bus = MessageBusGroundwork::from_config(connector.clone(), &TalkieConfig::default().bus);

    let err = bus.betoken(KnownAction::StopSpeaking, &()).await.unwrap_err();
    assert!(matches!(err, BusError::GivingUp { attempts: 10, .. }));
    assert!(!err.is_timeout());
    assert_eq!(connector.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn setting_changes_are_announced_once_with_both_values() {
    let hub = PortHub::new();
    let config = TalkieConfig::default();
    let background = Background::new(&config, Arc::new(MemoryStorage::new()), Arc::new(NullSpeech));
    background
        .start(hub.listen(&config.bus.port_name).unwrap())
        .await
        .unwrap();

    let changes = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = changes.clone();
    background.broadcaster().register(
        background.context().handle(),
        KnownEvent::SettingChanged,
        listener_fn(move |_, payload| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(payload);
                Ok(None)
            }
        }),
    );

    let options = Foreground::new(ContextKind::Options, Arc::new(hub.clone()), &config);
    options.settings.set_setting("rate", json!(1.25)).await.unwrap();
    options.settings.set_setting("rate", json!(1.25)).await.unwrap();
    assert_eq!(changes.lock().unwrap().len(), 1);

    options.settings.set_setting("rate", json!(2)).await.unwrap();
    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 2);
    let last: SettingChange = serde_json::from_value(changes[1].clone()).unwrap();
    assert_eq!(last.previous_value, Some(json!(1.25)));
    assert_eq!(last.value, json!(2));
}

#[tokio::test]
async fn failing_listener_reason_reaches_the_caller() {
    let hub = PortHub::new();
    let config = TalkieConfig::default();
    let background = Background::new(&config, Arc::new(MemoryStorage::new()), Arc::new(NullSpeech));
    background
        .start(hub.listen(&config.bus.port_name).unwrap())
        .await
        .unwrap();
    background.broadcaster().register(
        background.context().handle(),
        KnownEvent::SettingChanged,
        listener_fn(|_, _| async { Err(ListenerError::new("options page listener exploded")) }),
    );

    let options = Foreground::new(ContextKind::Options, Arc::new(hub.clone()), &config);
    let err = options
        .settings
        .set_setting("voice", json!("bob"))
        .await
        .unwrap_err();
    match &err {
        BusError::Remote { name, message } => {
            assert_eq!(name, &config.bus.port_name);
            assert!(message.contains("options page listener exploded"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!err.is_retryable());

    // The value stays stored even though announcing it failed.
    assert_eq!(
        options.settings.get_setting("voice").await.unwrap(),
        Some(json!("bob"))
    );
}

#[tokio::test]
async fn background_events_fan_out_to_attached_contexts() {
    let hub = PortHub::new();
    let config = TalkieConfig::default();
    let background = Background::new(&config, Arc::new(MemoryStorage::new()), Arc::new(NullSpeech));
    background
        .start(hub.listen(&config.bus.port_name).unwrap())
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut attached = Vec::new();
    for kind in [ContextKind::Popup, ContextKind::ContentScript] {
        let context = Foreground::new(kind, Arc::new(hub.clone()), &config);
        let tx = tx.clone();
        context.broadcaster().register(
            context.context().handle(),
            KnownEvent::ProgressUpdate,
            listener_fn(move |_, payload| {
                let _ = tx.send((kind, payload));
                async { Ok(None) }
            }),
        );
        context.attach().await.unwrap();
        attached.push(context);
    }
    while background.service().connected_contexts() < 2 {
        tokio::task::yield_now().await;
    }

    background
        .broadcaster()
        .broadcast(KnownEvent::ProgressUpdate, &json!(0.75))
        .await
        .unwrap();

    let mut heard = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    heard.sort_by_key(|(kind, _)| kind.to_string());
    assert_eq!(
        heard,
        vec![
            (ContextKind::ContentScript, json!(0.75)),
            (ContextKind::Popup, json!(0.75)),
        ]
    );
}
