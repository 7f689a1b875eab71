use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::Channel;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(format!("CV-{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// A channel-scoped message thread belonging to exactly one Lead.
///
/// Unique per (channel, channel_subscriber_id); created lazily on the first
/// message from that channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub lead_id: crate::domain::lead::LeadId,
    pub channel: Channel,
    pub channel_subscriber_id: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        lead_id: crate::domain::lead::LeadId,
        channel: Channel,
        channel_subscriber_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::generate(),
            lead_id,
            channel,
            channel_subscriber_id: channel_subscriber_id.into(),
            last_message_at: None,
            status: ConversationStatus::Open,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advances `last_message_at`, but only forward in time.
    ///
    /// Webhooks arrive out of timestamp order; a late historical message must
    /// not regress the last-activity signal. Returns whether the value moved.
    pub fn observe_message_at(&mut self, sent_at: DateTime<Utc>) -> bool {
        match self.last_message_at {
            Some(current) if sent_at < current => false,
            _ => {
                self.last_message_at = Some(sent_at);
                self.updated_at = Utc::now();
                true
            }
        }
    }
}
