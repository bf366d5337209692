//! Talkie message bus.
//!
//! Execution contexts (one background, any number of foreground contexts)
//! share nothing but JSON values posted over named ports. On top of the ports
//! sit a per-context event [`Broadcaster`], request/response providers, the
//! foreground [`MessageBusGroundwork`] with its retry policy, and the
//! background [`MessageBusService`].

pub mod background;
pub mod broadcaster;
pub mod config;
pub mod context;
pub mod error;
pub mod groundwork;
pub mod liveness;
pub mod port;
pub mod retry;
pub mod service;
pub mod settings;
pub mod storage;
pub mod transport;

pub use background::{Background, Foreground, NullSpeech, SpeechEngine};
pub use broadcaster::{listener_fn, Broadcaster, KillSwitch, Listener, ListenerError};
pub use context::{ContextHandle, ContextKind, SharedContext};
pub use error::BusError;
pub use groundwork::MessageBusGroundwork;
pub use liveness::{DeadDetection, LivenessProbe};
pub use port::{HandlerError, RequestHandler};
pub use retry::RetryPolicy;
pub use service::{action_fn, ActionError, ActionHandler, ActionRegistry, MessageBusService};
pub use settings::SettingsManager;
pub use storage::{MemoryStorage, SqliteStorage, Storage};
