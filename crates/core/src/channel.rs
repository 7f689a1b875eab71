//! Originating-channel classification for platform subscriber records.
//!
//! The platform reports WhatsApp, Instagram and Messenger contacts through the
//! same subscriber shape, so the channel has to be inferred from which fields
//! are populated. The checks below are a priority-ordered disambiguation
//! policy; reordering them changes the outcome for ambiguous records. In
//! particular a `page_id` outranks a generic phone because WhatsApp-originated
//! subscribers never carry a page id.
//!
//! Rules 4 and 5 (phone without page id ⇒ whatsapp, email alone ⇒ facebook)
//! are best-effort heuristics observed in production data, not guarantees
//! from the platform contract. The detection reason is reported so
//! misclassified records can be audited.

use serde::{Deserialize, Serialize};

use crate::event::SubscriberPayload;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Instagram,
    Facebook,
    Unknown,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "whatsapp" => Some(Self::Whatsapp),
            "instagram" => Some(Self::Instagram),
            "facebook" => Some(Self::Facebook),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelDetection {
    pub detected: Channel,
    pub reason: &'static str,
}

/// Classifies a subscriber record. First matching rule wins; never errors.
pub fn detect_channel(subscriber: &SubscriberPayload) -> ChannelDetection {
    if present(&subscriber.instagram_id) {
        return ChannelDetection { detected: Channel::Instagram, reason: "instagram_id present" };
    }
    if present(&subscriber.ig_id) {
        return ChannelDetection { detected: Channel::Instagram, reason: "ig_id present" };
    }
    if present(&subscriber.ig_username) {
        return ChannelDetection { detected: Channel::Instagram, reason: "ig_username present" };
    }
    if present(&subscriber.page_id) {
        return ChannelDetection {
            detected: Channel::Facebook,
            reason: "page_id present without instagram signal",
        };
    }
    if present(&subscriber.whatsapp_phone) {
        return ChannelDetection { detected: Channel::Whatsapp, reason: "whatsapp_phone present" };
    }
    if present(&subscriber.phone) {
        return ChannelDetection {
            detected: Channel::Whatsapp,
            reason: "phone present without page_id (heuristic)",
        };
    }
    if present(&subscriber.email) {
        return ChannelDetection {
            detected: Channel::Facebook,
            reason: "email present without phone or page_id (heuristic)",
        };
    }
    ChannelDetection { detected: Channel::Unknown, reason: "no channel signal" }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).is_some_and(|value| !value.is_empty())
}
