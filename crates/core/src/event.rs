//! Webhook payload normalization.
//!
//! The platform delivers webhooks in several historical shapes with varying
//! field names (`message_id` | `mid` | `id`, `body` | `text`, `media_url` |
//! `url`, …). Everything downstream of the HTTP boundary works on one
//! canonical event shape produced here. Malformed optional fields degrade to
//! best-effort defaults; the only hard validation failure is a missing
//! `event_type`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::message::{Direction, MessageContent};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Missing event_type")]
    MissingEventType,
    #[error("webhook payload must be a JSON object")]
    NotAnObject,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewSubscriber,
    SubscriberFound,
    MessageReceived,
    MessageSent,
    TagApplied,
    TagRemoved,
    CustomFieldChanged,
    Unsupported(String),
}

impl EventType {
    fn parse(raw: &str) -> Self {
        match raw {
            "new_subscriber" | "subscriber_created" => Self::NewSubscriber,
            "subscriber_found" => Self::SubscriberFound,
            "message_received" | "incoming_message" => Self::MessageReceived,
            "message_sent" | "outgoing_message" => Self::MessageSent,
            "tag_applied" | "tag_added" => Self::TagApplied,
            "tag_removed" => Self::TagRemoved,
            "custom_field_changed" | "custom_field_set" => Self::CustomFieldChanged,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SubscriberPayload {
    pub id: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub whatsapp_phone: Option<String>,
    pub email: Option<String>,
    pub page_id: Option<String>,
    pub instagram_id: Option<String>,
    pub ig_id: Option<String>,
    pub ig_username: Option<String>,
    pub custom_fields: Map<String, Value>,
}

impl SubscriberPayload {
    /// Lenient parse of a raw subscriber record; returns `None` when the value
    /// is not a JSON object. Unrecognized keys are folded into `custom_fields`.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(subscriber_payload)
    }

    /// `name`, else first + last name joined.
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
            return Some(name.to_string());
        }
        let first = self.first_name.as_deref().map(str::trim).unwrap_or("");
        let last = self.last_name.as_deref().map(str::trim).unwrap_or("");
        let joined = format!("{first} {last}");
        let joined = joined.trim();
        (!joined.is_empty()).then(|| joined.to_string())
    }

    pub fn best_phone(&self) -> Option<&str> {
        self.phone
            .as_deref()
            .map(str::trim)
            .filter(|phone| !phone.is_empty())
            .or_else(|| {
                self.whatsapp_phone
                    .as_deref()
                    .map(str::trim)
                    .filter(|phone| !phone.is_empty())
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MessagePayload {
    pub platform_msg_id: String,
    /// Set when no id candidate was present and one was generated from the
    /// clock. Synthetic ids are never deduplicated against each other.
    pub synthetic_id: bool,
    pub direction: Direction,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CustomFieldPayload {
    pub name: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalEvent {
    pub event_type: EventType,
    pub subscriber_id: Option<String>,
    pub subscriber: Option<SubscriberPayload>,
    pub message: Option<MessagePayload>,
    pub tag: Option<String>,
    pub custom_field: Option<CustomFieldPayload>,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalEvent {
    /// The platform-scoped subscriber identifier, from the top-level field or
    /// the embedded subscriber record.
    pub fn subscriber_identifier(&self) -> Option<&str> {
        self.subscriber_id
            .as_deref()
            .or_else(|| self.subscriber.as_ref().and_then(|sub| sub.id.as_deref()))
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Converts a raw webhook body into the canonical event shape.
pub fn normalize_webhook(payload: &Value) -> Result<CanonicalEvent, NormalizeError> {
    let object = payload.as_object().ok_or(NormalizeError::NotAnObject)?;

    let raw_event_type = first_string(object, &["event_type", "type"])
        .ok_or(NormalizeError::MissingEventType)?;
    let event_type = EventType::parse(&raw_event_type);

    let timestamp =
        object.get("timestamp").and_then(parse_timestamp).unwrap_or_else(Utc::now);

    let subscriber = object.get("subscriber").and_then(Value::as_object).map(subscriber_payload);
    let subscriber_id = first_string(object, &["subscriber_id", "subscriber_ID"])
        .or_else(|| subscriber.as_ref().and_then(|sub| sub.id.clone()));

    let message = object
        .get("message")
        .and_then(Value::as_object)
        .map(|raw| message_payload(raw, &event_type, timestamp));

    let tag = object.get("tag").and_then(tag_name);
    // A field record without a usable name cannot be stored under any key, so
    // it normalizes to no custom field at all.
    let custom_field = object.get("custom_field").and_then(Value::as_object).and_then(|raw| {
        let name = first_string(raw, &["name", "field_name", "key"])?;
        Some(CustomFieldPayload {
            name,
            value: raw
                .get("value")
                .cloned()
                .or_else(|| raw.get("field_value").cloned())
                .unwrap_or(Value::Null),
        })
    });

    Ok(CanonicalEvent {
        event_type,
        subscriber_id,
        subscriber,
        message,
        tag,
        custom_field,
        timestamp,
    })
}

fn subscriber_payload(raw: &Map<String, Value>) -> SubscriberPayload {
    let known = [
        "id", "subscriber_id", "name", "first_name", "last_name", "phone", "whatsapp_phone",
        "email", "page_id", "instagram_id", "ig_id", "ig_username", "custom_fields",
        "last_interaction", "last_seen",
    ];
    let mut custom_fields = raw
        .get("custom_fields")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    // Some payload shapes flatten custom fields to unrecognized top-level keys.
    for (key, value) in raw {
        if !known.contains(&key.as_str()) {
            custom_fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    SubscriberPayload {
        id: first_string(raw, &["id", "subscriber_id"]),
        name: first_string(raw, &["name"]),
        first_name: first_string(raw, &["first_name"]),
        last_name: first_string(raw, &["last_name"]),
        phone: first_string(raw, &["phone"]),
        whatsapp_phone: first_string(raw, &["whatsapp_phone"]),
        email: first_string(raw, &["email"]),
        page_id: first_string(raw, &["page_id"]),
        instagram_id: first_string(raw, &["instagram_id"]),
        ig_id: first_string(raw, &["ig_id"]),
        ig_username: first_string(raw, &["ig_username"]),
        custom_fields,
    }
}

fn message_payload(
    raw: &Map<String, Value>,
    event_type: &EventType,
    event_timestamp: DateTime<Utc>,
) -> MessagePayload {
    let (platform_msg_id, synthetic_id) =
        match first_string(raw, &["platform_msg_id", "id", "message_id", "mid"]) {
            Some(id) => (id, false),
            // True platform duplicates always carry one of the canonical ids,
            // so a clock-derived id is safe as a last resort.
            None => (format!("synthetic-{}", Utc::now().timestamp_millis()), true),
        };

    let direction = first_string(raw, &["direction"])
        .and_then(|raw_direction| Direction::parse(&raw_direction))
        .unwrap_or(match event_type {
            EventType::MessageSent => Direction::Outbound,
            _ => Direction::Inbound,
        });

    let sent_at = raw.get("timestamp").and_then(parse_timestamp).unwrap_or(event_timestamp);

    let lat = raw.get("lat").and_then(Value::as_f64);
    let lng = raw.get("lng").and_then(Value::as_f64);
    let url = first_string(raw, &["media_url", "url"]);
    let content = if let (Some(lat), Some(lng)) = (lat, lng) {
        MessageContent::Location { lat, lng }
    } else if let Some(url) = url {
        MessageContent::Media {
            url,
            media_type: first_string(raw, &["type", "media_type"])
                .unwrap_or_else(|| "file".to_string()),
            caption: first_string(raw, &["caption"]),
            filename: first_string(raw, &["filename", "file_name"]),
        }
    } else {
        MessageContent::Text { text: first_string(raw, &["body", "text"]).unwrap_or_default() }
    };

    MessagePayload { platform_msg_id, synthetic_id, direction, content, sent_at }
}

fn tag_name(value: &Value) -> Option<String> {
    match value {
        Value::String(tag) => {
            let tag = tag.trim();
            (!tag.is_empty()).then(|| tag.to_string())
        }
        Value::Object(object) => first_string(object, &["name", "tag_name"]),
        _ => None,
    }
}

fn first_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match object.get(*key) {
            Some(Value::String(value)) => {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
            Some(Value::Number(value)) => return Some(value.to_string()),
            _ => {}
        }
    }
    None
}

/// Accepts epoch seconds, epoch milliseconds, or an RFC 3339 string.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => {
            let raw = number.as_i64()?;
            let (secs, millis) =
                if raw > 10_000_000_000 { (raw / 1000, raw % 1000) } else { (raw, 0) };
            Utc.timestamp_opt(secs, (millis as u32) * 1_000_000).single()
        }
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|timestamp| timestamp.with_timezone(&Utc)),
        _ => None,
    }
}
