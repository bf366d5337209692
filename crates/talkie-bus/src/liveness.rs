//! Detection of listeners whose owning context has gone away.
//!
//! Two strategies are available and can be combined:
//! - [`DeadDetection::Probe`] checks the owning [`ContextHandle`] before a
//!   listener is invoked;
//! - [`DeadDetection::Signature`] inspects the error a listener returned for
//!   known "dead object" phrasings, for contexts that die without the handle
//!   noticing (a torn-down page still answering with engine errors).

use talkie_types::config::LivenessConfig;

use crate::context::ContextHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadDetection {
    Probe,
    Signature(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct LivenessProbe {
    strategies: Vec<DeadDetection>,
}

impl LivenessProbe {
    pub fn new(strategies: Vec<DeadDetection>) -> Self {
        Self { strategies }
    }

    pub fn from_config(config: &LivenessConfig) -> Self {
        let mut strategies = Vec::with_capacity(2);
        if config.probe_contexts {
            strategies.push(DeadDetection::Probe);
        }
        if !config.dead_object_signatures.is_empty() {
            strategies.push(DeadDetection::Signature(
                config.dead_object_signatures.clone(),
            ));
        }
        Self { strategies }
    }

    /// Proactive check, run before invoking a listener.
    pub fn is_dead(&self, owner: &ContextHandle) -> bool {
        self.strategies
            .iter()
            .any(|s| matches!(s, DeadDetection::Probe) && !owner.is_alive())
    }

    /// Reactive check, run on the message of an error a listener returned.
    pub fn is_dead_error(&self, message: &str) -> bool {
        self.strategies.iter().any(|s| match s {
            DeadDetection::Signature(signatures) => {
                signatures.iter().any(|sig| message.contains(sig.as_str()))
            }
            DeadDetection::Probe => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextKind, SharedContext};

    #[test]
    fn default_config_probes_and_matches_signatures() {
        let probe = LivenessProbe::from_config(&LivenessConfig::default());
        assert!(probe.is_dead_error("TypeError: can't access dead object"));
        assert!(probe.is_dead_error("<unavailable>"));
        assert!(!probe.is_dead_error("TypeError: x is undefined"));

        let ctx = SharedContext::new(ContextKind::Popup);
        let handle = ctx.handle();
        assert!(!probe.is_dead(&handle));
        ctx.unload();
        assert!(probe.is_dead(&handle));
    }

    #[test]
    fn signature_only_probe_ignores_context_state() {
        let probe = LivenessProbe::new(vec![DeadDetection::Signature(vec!["gone".into()])]);
        let ctx = SharedContext::new(ContextKind::ContentScript);
        let handle = ctx.handle();
        drop(ctx);
        assert!(!probe.is_dead(&handle));
        assert!(probe.is_dead_error("object is gone"));
    }

    #[test]
    fn empty_probe_never_reports_dead() {
        let probe = LivenessProbe::default();
        assert!(!probe.is_dead_error("can't access dead object"));
    }
}
