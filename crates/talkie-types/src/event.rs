use serde::{Deserialize, Serialize};

/// Events the broadcaster knows how to route.
///
/// The list is closed: every context that listens to or broadcasts an event
/// must be built against the same set of names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KnownEvent {
    BeforeSpeaking,
    AfterSpeaking,
    BeforeSpeakingPart,
    AfterSpeakingPart,
    StopSpeaking,
    SettingChanged,
    ProgressUpdate,
    ResetProgress,
    AddProgress,
    FinishProgress,
    PassSelectedTextToBackground,
}

impl KnownEvent {
    pub const ALL: [KnownEvent; 11] = [
        Self::BeforeSpeaking,
        Self::AfterSpeaking,
        Self::BeforeSpeakingPart,
        Self::AfterSpeakingPart,
        Self::StopSpeaking,
        Self::SettingChanged,
        Self::ProgressUpdate,
        Self::ResetProgress,
        Self::AddProgress,
        Self::FinishProgress,
        Self::PassSelectedTextToBackground,
    ];

    /// Wire name, as used in frames and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeSpeaking => "beforeSpeaking",
            Self::AfterSpeaking => "afterSpeaking",
            Self::BeforeSpeakingPart => "beforeSpeakingPart",
            Self::AfterSpeakingPart => "afterSpeakingPart",
            Self::StopSpeaking => "stopSpeaking",
            Self::SettingChanged => "settingChanged",
            Self::ProgressUpdate => "progressUpdate",
            Self::ResetProgress => "resetProgress",
            Self::AddProgress => "addProgress",
            Self::FinishProgress => "finishProgress",
            Self::PassSelectedTextToBackground => "passSelectedTextToBackground",
        }
    }
}

impl std::fmt::Display for KnownEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KnownEvent {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown event: {}", s))
    }
}
