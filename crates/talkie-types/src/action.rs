use serde::{Deserialize, Serialize};

/// Actions a foreground context can ask the background context to perform
/// over the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KnownAction {
    GetSetting,
    SetSetting,
    StartSpeaking,
    StopSpeaking,
    IsSpeaking,
    GetVersion,
    GetPlatform,
    /// Relay an event through the background broadcaster.
    Broadcast,
}

impl KnownAction {
    pub const ALL: [KnownAction; 8] = [
        Self::GetSetting,
        Self::SetSetting,
        Self::StartSpeaking,
        Self::StopSpeaking,
        Self::IsSpeaking,
        Self::GetVersion,
        Self::GetPlatform,
        Self::Broadcast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetSetting => "getSetting",
            Self::SetSetting => "setSetting",
            Self::StartSpeaking => "startSpeaking",
            Self::StopSpeaking => "stopSpeaking",
            Self::IsSpeaking => "isSpeaking",
            Self::GetVersion => "getVersion",
            Self::GetPlatform => "getPlatform",
            Self::Broadcast => "broadcast",
        }
    }
}

impl std::fmt::Display for KnownAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KnownAction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown action: {}", s))
    }
}
