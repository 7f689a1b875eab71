pub mod channel;
pub mod config;
pub mod domain;
pub mod event;

pub use channel::{detect_channel, Channel, ChannelDetection};
pub use domain::conversation::{Conversation, ConversationId, ConversationStatus};
pub use domain::lead::{Lead, LeadId, LeadStage};
pub use domain::message::{Direction, Message, MessageContent, MessageId};
pub use domain::sync::{SyncKind, SyncRecord, SyncRecordId, SyncStatus};
pub use event::{
    normalize_webhook, CanonicalEvent, CustomFieldPayload, EventType, MessagePayload,
    NormalizeError, SubscriberPayload,
};

pub use chrono;
