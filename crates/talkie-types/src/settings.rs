use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of `KnownEvent::SettingChanged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingChange {
    pub key: String,
    /// `None` when the key had never been stored.
    pub previous_value: Option<Value>,
    pub value: Value,
}

/// Request data for `KnownAction::SetSetting`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSetting {
    pub key: String,
    pub value: Value,
}
