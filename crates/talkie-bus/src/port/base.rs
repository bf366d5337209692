use tokio::sync::watch;
use tracing::trace;

use crate::error::BusError;

/// Lifecycle of a provider's port.
///
/// `Disconnected → Connecting → Connected → Disconnecting → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Outcome of asking to start a transition.
pub(crate) enum Transition<'a> {
    /// The caller owns the transition and must complete it.
    Owned(TransitionGuard<'a>),
    /// Another caller's in-flight transition finished successfully.
    Joined,
}

/// Completes a transition. If dropped before [`TransitionGuard::complete`]
/// (error or cancellation), the state falls back so the provider never stays
/// stuck mid-transition.
pub(crate) struct TransitionGuard<'a> {
    base: &'a PortProviderBase,
    fallback: PortState,
    done: bool,
}

impl TransitionGuard<'_> {
    pub(crate) fn complete(mut self, state: PortState) {
        self.base.set(state);
        self.done = true;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.base.set(self.fallback);
        }
    }
}

/// Name and lifecycle shared by connector and listener providers.
///
/// Concurrent callers of `begin_connect`/`begin_disconnect` during an
/// in-flight transition wait for it instead of starting another one.
#[derive(Debug)]
pub(crate) struct PortProviderBase {
    name: String,
    state: watch::Sender<PortState>,
}

impl PortProviderBase {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(PortState::Disconnected);
        Self {
            name: name.into(),
            state,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> PortState {
        *self.state.borrow()
    }

    fn set(&self, state: PortState) {
        trace!("Port {} -> {}", self.name, state);
        self.state.send_replace(state);
    }

    /// Atomically move `from → to`; false if the state was something else.
    fn swap(&self, from: PortState, to: PortState) -> bool {
        let swapped = self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if swapped {
            trace!("Port {} -> {}", self.name, to);
        }
        swapped
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), BusError> {
        if self.state() == PortState::Connected {
            Ok(())
        } else {
            Err(self.not_connected())
        }
    }

    fn not_connected(&self) -> BusError {
        BusError::NotConnected {
            name: self.name.clone(),
        }
    }

    fn closed(&self) -> BusError {
        BusError::transport(format!("state of port {} is no longer observable", self.name))
    }

    pub(crate) async fn begin_connect(&self) -> Result<Transition<'_>, BusError> {
        loop {
            let mut rx = self.state.subscribe();
            if self.swap(PortState::Disconnected, PortState::Connecting) {
                return Ok(Transition::Owned(TransitionGuard {
                    base: self,
                    fallback: PortState::Disconnected,
                    done: false,
                }));
            }
            let current = *rx.borrow_and_update();
            match current {
                PortState::Connected => {
                    return Err(BusError::AlreadyConnected {
                        name: self.name.clone(),
                    })
                }
                PortState::Connecting => {
                    let settled = *rx
                        .wait_for(|s| *s != PortState::Connecting)
                        .await
                        .map_err(|_| self.closed())?;
                    return match settled {
                        PortState::Connected => Ok(Transition::Joined),
                        _ => Err(self.not_connected()),
                    };
                }
                PortState::Disconnecting => {
                    rx.wait_for(|s| *s != PortState::Disconnecting)
                        .await
                        .map_err(|_| self.closed())?;
                }
                PortState::Disconnected => {}
            }
        }
    }

    pub(crate) async fn begin_disconnect(&self) -> Result<Transition<'_>, BusError> {
        let mut rx = self.state.subscribe();
        if self.swap(PortState::Connected, PortState::Disconnecting) {
            return Ok(Transition::Owned(TransitionGuard {
                base: self,
                fallback: PortState::Disconnected,
                done: false,
            }));
        }
        let current = *rx.borrow_and_update();
        match current {
            PortState::Disconnecting => {
                rx.wait_for(|s| *s != PortState::Disconnecting)
                    .await
                    .map_err(|_| self.closed())?;
                Ok(Transition::Joined)
            }
            _ => Err(self.not_connected()),
        }
    }

    /// The far side went away while connected.
    pub(crate) fn mark_lost(&self) -> bool {
        self.swap(PortState::Connected, PortState::Disconnected)
    }
}
