use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::conversation::ConversationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(format!("MS-{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        url: String,
        media_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Location {
        lat: f64,
        lng: f64,
    },
}

/// One inbound or outbound communication unit. Immutable once created;
/// `platform_msg_id` is the deduplication key within a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub direction: Direction,
    pub content: MessageContent,
    pub platform_msg_id: String,
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        direction: Direction,
        content: MessageContent,
        platform_msg_id: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            direction,
            content,
            platform_msg_id: platform_msg_id.into(),
            sent_at,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MessageContent;

    #[test]
    fn content_serializes_with_kind_tag() {
        let content = MessageContent::Media {
            url: "https://cdn.example/photo.jpg".to_string(),
            media_type: "image".to_string(),
            caption: Some("the bike".to_string()),
            filename: None,
        };
        let value = serde_json::to_value(&content).expect("serialize");
        assert_eq!(value["kind"], "media");
        assert_eq!(value["url"], "https://cdn.example/photo.jpg");
        assert!(value.get("filename").is_none());

        let back: MessageContent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, content);
    }
}
