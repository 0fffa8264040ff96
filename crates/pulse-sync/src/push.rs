//! Typed server-push messages.
//!
//! Every frame maps to exactly one [`PushMessage`]; anything unparsable
//! becomes [`PushMessage::Unrecognized`]. A frame still counts as a sign of
//! life whatever its content.

use pulse_core::is_signed_token;
use pulse_transport::PushFrame;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-side pacing mode for the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionMode {
    /// No restrictions.
    #[default]
    Normal,
    /// Fewer suggestions.
    Reduced,
    /// Suggest a break.
    Rest,
    /// Minimal distraction.
    Focus,
    /// A mode this client does not know yet.
    #[serde(other)]
    Unknown,
}

fn default_max_tips() -> u32 {
    999
}

fn default_system_message() -> String {
    "System ready.".to_string()
}

/// Pacing decision pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Mode.
    #[serde(default)]
    pub mode: DecisionMode,
    /// How many tips may be shown.
    #[serde(default = "default_max_tips")]
    pub max_tips_allowed: u32,
    /// Whether sharing is allowed.
    #[serde(default)]
    pub allow_share: bool,
    /// Whether a new tip may be requested.
    #[serde(default)]
    pub allow_new_tip: bool,
    /// Message to show.
    #[serde(default = "default_system_message")]
    pub system_message: String,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            mode: DecisionMode::Normal,
            max_tips_allowed: default_max_tips(),
            allow_share: false,
            allow_new_tip: false,
            system_message: default_system_message(),
        }
    }
}

/// One classified push message.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// `heartbeat`, `ping` or a comment line.
    Heartbeat,
    /// Greeting sent right after the subscription opens.
    Hello {
        /// Online count, if included.
        online: Option<u64>,
    },
    /// Online-now count (`online` event or a default message with `onlineNow`).
    Online(u64),
    /// Total visits.
    Total(u64),
    /// Visitor profile.
    Profile(Value),
    /// Aggregated insights.
    Insights(Value),
    /// Pacing decision.
    Decision(Decision),
    /// Unknown name or malformed payload.
    Unrecognized,
}

/// A parsed frame plus any identity it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPush {
    /// Classified message.
    pub message: PushMessage,
    /// Signed `visitorId` found in the payload.
    pub renewed_identity: Option<String>,
}

impl InboundPush {
    /// Classify one frame.
    #[must_use]
    pub fn parse(frame: &PushFrame) -> Self {
        match frame {
            PushFrame::Comment(_) => Self {
                message: PushMessage::Heartbeat,
                renewed_identity: None,
            },
            PushFrame::Message { event, data } => {
                let payload = serde_json::from_str::<Value>(data).ok();
                let renewed_identity = payload.as_ref().and_then(signed_visitor_id);
                let message = classify(event.as_deref(), payload);
                Self {
                    message,
                    renewed_identity,
                }
            }
        }
    }
}

fn classify(event: Option<&str>, payload: Option<Value>) -> PushMessage {
    match event.map(str::trim).filter(|name| !name.is_empty()) {
        Some("heartbeat" | "ping") => PushMessage::Heartbeat,
        Some("hello") => PushMessage::Hello {
            online: payload.as_ref().and_then(|p| count_field(p, "online")),
        },
        Some("online") => payload
            .as_ref()
            .and_then(|p| count_field(p, "online"))
            .map_or(PushMessage::Unrecognized, PushMessage::Online),
        Some("total") => payload
            .as_ref()
            .and_then(|p| count_field(p, "total"))
            .map_or(PushMessage::Unrecognized, PushMessage::Total),
        Some("profile") => object(payload).map_or(PushMessage::Unrecognized, PushMessage::Profile),
        Some("insights") => {
            object(payload).map_or(PushMessage::Unrecognized, PushMessage::Insights)
        }
        Some("decision") => object(payload)
            .and_then(|p| serde_json::from_value::<Decision>(p).ok())
            .map_or(PushMessage::Unrecognized, PushMessage::Decision),
        Some(_) => PushMessage::Unrecognized,
        None => payload
            .as_ref()
            .and_then(|p| count_field(p, "onlineNow"))
            .map_or(PushMessage::Unrecognized, PushMessage::Online),
    }
}

fn object(payload: Option<Value>) -> Option<Value> {
    payload.filter(Value::is_object)
}

/// Non-negative integer field, accepting whole floats.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn count_field(payload: &Value, key: &str) -> Option<u64> {
    let value = payload.get(key)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as u64)
    })
}

fn signed_visitor_id(payload: &Value) -> Option<String> {
    payload
        .get("visitorId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| is_signed_token(v))
        .map(ToString::to_string)
}
