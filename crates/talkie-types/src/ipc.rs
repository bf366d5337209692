use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::action::KnownAction;
use crate::event::KnownEvent;

/// A single unit travelling over a port, in either direction.
///
/// Only JSON values cross a port. Anything that cannot be serialized has to be
/// replaced with a primitive identifier before it is posted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PortFrame {
    /// Expects exactly one `Response` carrying the same id.
    Request { id: Uuid, payload: Value },
    /// Reply to a `Request`. `payload: None` is the explicit "no response"
    /// marker, distinct from a JSON `null` answer.
    #[serde(rename_all = "camelCase")]
    Response {
        reply_to: Uuid,
        #[serde(
            default,
            deserialize_with = "present",
            skip_serializing_if = "Option::is_none"
        )]
        payload: Option<Value>,
    },
    /// Reply to a `Request` whose handler failed.
    #[serde(rename_all = "camelCase")]
    Failure { reply_to: Uuid, message: String },
    /// Fire-and-forget event, broadcast locally by the receiving context.
    Notify {
        event: KnownEvent,
        #[serde(default)]
        payload: Value,
    },
}

/// A field that is present is an answer, even when it is `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl PortFrame {
    pub fn request(payload: Value) -> Self {
        Self::Request {
            id: Uuid::new_v4(),
            payload,
        }
    }

    pub fn response(reply_to: Uuid, payload: Option<Value>) -> Self {
        Self::Response { reply_to, payload }
    }

    pub fn failure(reply_to: Uuid, message: impl Into<String>) -> Self {
        Self::Failure {
            reply_to,
            message: message.into(),
        }
    }

    pub fn notify(event: KnownEvent, payload: Value) -> Self {
        Self::Notify { event, payload }
    }
}

/// First line written on a stream-backed port, naming the port being opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub port: String,
}

/// Message-bus request carried inside a `PortFrame::Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRequest {
    pub action: KnownAction,
    #[serde(default)]
    pub data: Value,
}

/// Acknowledgement returned for notify-style (`betoken`) requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done {
    pub done: bool,
}

impl Done {
    pub const YES: Done = Done { done: true };
}

/// Payload of a `KnownAction::Broadcast` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRelay {
    pub event: KnownEvent,
    #[serde(default)]
    pub payload: Value,
}

/// Request data for `KnownAction::StartSpeaking`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Answer to `KnownAction::GetPlatform`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
}

impl PlatformInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}
