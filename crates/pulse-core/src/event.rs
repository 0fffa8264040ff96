//! Outbound event model.
//!
//! A [`QueuedEvent`] is created for every tracked user action, persisted by the
//! event queue before any delivery attempt and removed only once the backend
//! confirms it with a 2xx response.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::UnknownEventKind;

/// Length of the random part of a generated event id.
pub const EVENT_ID_RANDOM_LEN: usize = 18;

/// Closed set of event kinds the backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A new tip was shown.
    NewTip,
    /// A tip was copied.
    CopyTip,
    /// A tip was shared.
    ShareTip,
    /// The visitor picked a topic.
    Topic,
}

impl EventKind {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NewTip => "NEW_TIP",
            Self::CopyTip => "COPY_TIP",
            Self::ShareTip => "SHARE_TIP",
            Self::Topic => "TOPIC",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW_TIP" => Ok(Self::NewTip),
            "COPY_TIP" => Ok(Self::CopyTip),
            "SHARE_TIP" => Ok(Self::ShareTip),
            "TOPIC" => Ok(Self::Topic),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

/// Caller-supplied part of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    /// Event kind.
    pub kind: EventKind,
    /// Optional context tag.
    pub topic: Option<String>,
    /// Optional opaque reference (tip id, share target, ...).
    pub reference: Option<String>,
    /// Extra metadata; overrides client metadata on key collision.
    pub metadata: Map<String, Value>,
}

impl EventPayload {
    /// Payload with no topic, reference or metadata.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            topic: None,
            reference: None,
            metadata: Map::new(),
        }
    }

    /// Builder: set the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Builder: set the opaque reference.
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Builder: add one metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Client environment merged into every event's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMeta {
    /// IANA time zone name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Minutes to add to local time to get UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz_offset_min: Option<i32>,
    /// BCP 47 language tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl ClientMeta {
    /// Read the host environment (`TZ`, `LANG`, local UTC offset).
    #[must_use]
    pub fn detect() -> Self {
        let tz = std::env::var("TZ")
            .ok()
            .map(|v| v.trim().trim_start_matches(':').to_string())
            .filter(|v| !v.is_empty());
        let lang = std::env::var("LC_ALL")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| std::env::var("LANG").ok())
            .and_then(|v| language_tag(&v))
            .unwrap_or_else(|| "en".to_string());
        let offset_secs = Local::now().offset().local_minus_utc();
        Self {
            tz,
            tz_offset_min: Some(-offset_secs / 60),
            lang: Some(lang),
        }
    }

    /// True when at least one field is known.
    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.tz.is_some() || self.tz_offset_min.is_some() || self.lang.is_some()
    }

    /// Metadata map seeded with the known fields.
    #[must_use]
    pub fn to_metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(tz) = &self.tz {
            map.insert("tz".into(), Value::from(tz.clone()));
        }
        if let Some(offset) = self.tz_offset_min {
            map.insert("tzOffsetMin".into(), Value::from(offset));
        }
        if let Some(lang) = &self.lang {
            map.insert("lang".into(), Value::from(lang.clone()));
        }
        map
    }
}

/// `en_US.UTF-8` → `en-US`; `C`/`POSIX` yield nothing.
fn language_tag(locale: &str) -> Option<String> {
    let base = locale.split(['.', '@']).next()?.trim();
    if base.is_empty() || base == "C" || base == "POSIX" {
        return None;
    }
    Some(base.replace('_', "-"))
}

/// Generate an event id: `e_` followed by random alphanumerics.
#[must_use]
pub fn generate_event_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(EVENT_ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("e_{suffix}")
}

/// A tracked action awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Unique id; removal and de-duplication key.
    pub id: String,
    /// Subject (page) the event belongs to.
    pub subject: String,
    /// Event kind.
    pub kind: EventKind,
    /// Optional context tag.
    #[serde(default)]
    pub topic: Option<String>,
    /// Optional opaque reference.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    /// Client metadata merged with caller metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    #[serde(default)]
    pub attempt_count: u32,
}

impl QueuedEvent {
    /// Build an event with a fresh id, stamped now.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: EventPayload, client: &ClientMeta) -> Self {
        Self::with_id(generate_event_id(), subject, payload, client, Utc::now())
    }

    /// Build an event with an explicit id and timestamp.
    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        subject: impl Into<String>,
        payload: EventPayload,
        client: &ClientMeta,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut metadata = client.to_metadata();
        metadata.extend(payload.metadata);
        Self {
            id: id.into(),
            subject: subject.into(),
            kind: payload.kind,
            topic: payload.topic,
            reference: payload.reference,
            metadata,
            created_at,
            attempt_count: 0,
        }
    }

    /// JSON body for the event submission endpoint.
    ///
    /// `meta` echoes `eventId` and `ts` (epoch milliseconds) so the backend can
    /// de-duplicate retried deliveries.
    #[must_use]
    pub fn wire_body(&self) -> Value {
        let mut meta = self.metadata.clone();
        meta.insert("eventId".into(), Value::from(self.id.clone()));
        meta.insert("ts".into(), Value::from(self.created_at.timestamp_millis()));
        json!({
            "page": self.subject,
            "type": self.kind,
            "topic": self.topic,
            "ref": self.reference,
            "meta": meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn client() -> ClientMeta {
        ClientMeta {
            tz: Some("America/Santiago".into()),
            tz_offset_min: Some(180),
            lang: Some("es-CL".into()),
        }
    }

    #[test]
    fn kind_round_trips_names() {
        for kind in [
            EventKind::NewTip,
            EventKind::CopyTip,
            EventKind::ShareTip,
            EventKind::Topic,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!("copy_tip".parse::<EventKind>().unwrap(), EventKind::CopyTip);
        assert!("LIKE_TIP".parse::<EventKind>().is_err());
    }

    #[test]
    fn generated_ids_have_prefix_and_length() {
        let id = generate_event_id();
        assert!(id.starts_with("e_"));
        assert_eq!(id.len(), 2 + EVENT_ID_RANDOM_LEN);
        assert!(id[2..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_event_id());
    }

    #[test]
    fn caller_metadata_overrides_client_meta() {
        let payload = EventPayload::new(EventKind::ShareTip)
            .with_topic("focus")
            .with_reference("tip-42")
            .with_meta("lang", "en")
            .with_meta("target", "x");
        let event = QueuedEvent::new("visits", payload, &client());

        assert_eq!(event.metadata["lang"], "en");
        assert_eq!(event.metadata["tz"], "America/Santiago");
        assert_eq!(event.metadata["tzOffsetMin"], 180);
        assert_eq!(event.metadata["target"], "x");
        assert_eq!(event.attempt_count, 0);
    }

    #[test]
    fn wire_body_echoes_id_and_timestamp() {
        let created_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let event = QueuedEvent::with_id(
            "e_fixed",
            "visits",
            EventPayload::new(EventKind::NewTip).with_reference("tip-1"),
            &ClientMeta::default(),
            created_at,
        );

        assert_eq!(
            event.wire_body(),
            json!({
                "page": "visits",
                "type": "NEW_TIP",
                "topic": null,
                "ref": "tip-1",
                "meta": {"eventId": "e_fixed", "ts": 1_700_000_000_123_i64},
            })
        );
    }

    #[test]
    fn persisted_form_uses_ref_field() {
        let event = QueuedEvent::with_id(
            "e_1",
            "visits",
            EventPayload::new(EventKind::Topic).with_reference("r"),
            &ClientMeta::default(),
            Utc::now(),
        );
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["ref"], "r");
        assert_eq!(raw["kind"], "TOPIC");

        let back: QueuedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn language_tag_from_locale() {
        assert_eq!(language_tag("en_US.UTF-8").as_deref(), Some("en-US"));
        assert_eq!(language_tag("de_DE@euro").as_deref(), Some("de-DE"));
        assert_eq!(language_tag("C"), None);
    }

    #[test]
    fn client_meta_serializes_camel_case() {
        let raw = serde_json::to_value(client()).unwrap();
        assert_eq!(raw["tzOffsetMin"], 180);
        assert!(ClientMeta::detect().is_populated());
    }
}
