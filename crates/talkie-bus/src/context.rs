//! Explicit per-context state.
//!
//! Each execution context (background, popup, options page, ...) constructs one
//! [`SharedContext`] at startup and passes it to whatever needs to know who it is.
//! Listeners registered on a broadcaster keep only a [`ContextHandle`], a weak
//! back-reference, so the broadcaster never keeps an unloaded context alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextKind {
    Background,
    Popup,
    Options,
    ContentScript,
    Offscreen,
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Background => write!(f, "background"),
            Self::Popup => write!(f, "popup"),
            Self::Options => write!(f, "options"),
            Self::ContentScript => write!(f, "content-script"),
            Self::Offscreen => write!(f, "offscreen"),
        }
    }
}

#[derive(Debug)]
struct ContextInner {
    id: Uuid,
    kind: ContextKind,
    loaded: AtomicBool,
}

/// The owning handle of an execution context.
///
/// Dropping the last clone, or calling [`SharedContext::unload`], makes every
/// [`ContextHandle`] derived from it report the context as dead.
#[derive(Debug, Clone)]
pub struct SharedContext {
    inner: Arc<ContextInner>,
}

impl SharedContext {
    pub fn new(kind: ContextKind) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                kind,
                loaded: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// Mark the context as unloaded while references to it still exist.
    pub fn unload(&self) {
        self.inner.loaded.store(false, Ordering::Release);
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            id: self.inner.id,
            kind: self.inner.kind,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Weak reference to a [`SharedContext`].
#[derive(Debug, Clone)]
pub struct ContextHandle {
    id: Uuid,
    kind: ContextKind,
    inner: Weak<ContextInner>,
}

impl ContextHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn is_alive(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.loaded.load(Ordering::Acquire))
    }
}
