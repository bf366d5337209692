use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalkieConfig {
    pub bus: BusConfig,
    pub liveness: LivenessConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Name of the port foreground contexts open towards the background.
    pub port_name: String,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Ask a listener's owning context whether it is still alive before invoking it.
    pub probe_contexts: bool,
    /// Error message fragments that mean "the listener's context is gone".
    pub dead_object_signatures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the default settings database location.
    #[serde(default)]
    pub settings_db: Option<String>,
}

impl Default for TalkieConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            liveness: LivenessConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            storage: StorageConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port_name: "talkie-message-bus".to_string(),
            retry_attempts: 10,
            retry_delay_ms: 100,
            request_timeout_ms: 1000,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_contexts: true,
            dead_object_signatures: vec![
                "access dead object".to_string(),
                "<unavailable>".to_string(),
            ],
        }
    }
}
