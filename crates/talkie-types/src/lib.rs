pub mod action;
pub mod config;
pub mod event;
pub mod ipc;
pub mod settings;

pub use action::KnownAction;
pub use event::KnownEvent;
