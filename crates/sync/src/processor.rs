use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use motocrm_core::channel::detect_channel;
use motocrm_core::domain::conversation::{Conversation, ConversationId};
use motocrm_core::domain::lead::{Lead, LeadId};
use motocrm_core::domain::message::{Message, MessageId};
use motocrm_core::event::{CanonicalEvent, EventType, SubscriberPayload};
use motocrm_db::repositories::{
    ConversationRepository, LeadRepository, MessageRepository, RepositoryError,
};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("event carries no subscriber identifier")]
    MissingSubscriber,
    #[error("event carries no message payload")]
    MissingMessage,
    #[error("event carries no tag name")]
    MissingTag,
    #[error("event carries no custom field")]
    MissingCustomField,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What an event application did, for the webhook response and logs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessOutcome {
    pub processed: bool,
    pub lead_id: Option<LeadId>,
    pub conversation_id: Option<ConversationId>,
    pub message_id: Option<MessageId>,
    /// True when the message was already stored and the existing ids were
    /// returned instead of new ones.
    pub deduplicated: bool,
}

/// Applies canonical inbound events to CRM state.
///
/// Replays are the normal case, not the exception: the platform redelivers
/// webhooks, so every operation here resolves to the same state when run
/// twice with the same input.
pub struct EventProcessor {
    leads: Arc<dyn LeadRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
}

impl EventProcessor {
    pub fn new(
        leads: Arc<dyn LeadRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
    ) -> Self {
        Self { leads, conversations, messages }
    }

    pub async fn process(&self, event: &CanonicalEvent) -> Result<ProcessOutcome, ProcessError> {
        match &event.event_type {
            EventType::NewSubscriber | EventType::SubscriberFound => {
                self.process_subscriber(event).await
            }
            EventType::MessageReceived | EventType::MessageSent => {
                self.process_message(event).await
            }
            EventType::TagApplied => self.process_tag(event, true).await,
            EventType::TagRemoved => self.process_tag(event, false).await,
            EventType::CustomFieldChanged => self.process_custom_field(event).await,
            EventType::Unsupported(raw) => {
                debug!(event_type = %raw, "ignoring unsupported event type");
                Ok(ProcessOutcome::default())
            }
        }
    }

    async fn process_subscriber(
        &self,
        event: &CanonicalEvent,
    ) -> Result<ProcessOutcome, ProcessError> {
        let (mut lead, mut dirty) = self.resolve_lead(event).await?;
        if let Some(subscriber) = &event.subscriber {
            dirty |= lead.merge_subscriber(subscriber);
        }
        if dirty {
            lead = self
                .save_lead(lead, |winner| match &event.subscriber {
                    Some(subscriber) => winner.merge_subscriber(subscriber),
                    None => false,
                })
                .await?;
        }
        info!(lead_id = %lead.id.0, "subscriber event applied");

        Ok(ProcessOutcome { processed: true, lead_id: Some(lead.id), ..Default::default() })
    }

    async fn process_message(
        &self,
        event: &CanonicalEvent,
    ) -> Result<ProcessOutcome, ProcessError> {
        let payload = event.message.as_ref().ok_or(ProcessError::MissingMessage)?;
        let subscriber_id =
            event.subscriber_identifier().ok_or(ProcessError::MissingSubscriber)?.to_string();

        let (mut lead, mut dirty) = self.resolve_lead(event).await?;
        if let Some(subscriber) = &event.subscriber {
            dirty |= lead.merge_subscriber(subscriber);
        }
        if dirty {
            lead = self
                .save_lead(lead, |winner| match &event.subscriber {
                    Some(subscriber) => winner.merge_subscriber(subscriber),
                    None => false,
                })
                .await?;
        }

        let detection = detect_channel(
            event.subscriber.as_ref().unwrap_or(&SubscriberPayload {
                id: Some(subscriber_id.clone()),
                ..Default::default()
            }),
        );
        let mut conversation = match self
            .conversations
            .find_by_channel_identity(detection.detected, &subscriber_id)
            .await?
        {
            Some(conversation) => conversation,
            None => {
                let conversation =
                    Conversation::new(lead.id.clone(), detection.detected, &subscriber_id);
                debug!(
                    conversation_id = %conversation.id.0,
                    channel = detection.detected.as_str(),
                    reason = detection.reason,
                    "conversation opened"
                );
                match self.conversations.save(conversation.clone()).await {
                    Ok(()) => conversation,
                    // Lost a race with a concurrent webhook for the same identity.
                    Err(error) if error.is_duplicate_key() => self
                        .conversations
                        .find_by_channel_identity(detection.detected, &subscriber_id)
                        .await?
                        .ok_or(error)?,
                    Err(error) => return Err(error.into()),
                }
            }
        };

        // Synthetic ids never match a prior delivery, so the lookup is skipped.
        if !payload.synthetic_id {
            if let Some(existing) = self
                .messages
                .find_by_platform_id(&conversation.id, &payload.platform_msg_id)
                .await?
            {
                debug!(
                    message_id = %existing.id.0,
                    platform_msg_id = %payload.platform_msg_id,
                    "replayed message, returning stored ids"
                );
                return Ok(ProcessOutcome {
                    processed: true,
                    lead_id: Some(lead.id),
                    conversation_id: Some(conversation.id),
                    message_id: Some(existing.id),
                    deduplicated: true,
                });
            }
        }

        let direction = payload.direction;
        let message = Message::new(
            conversation.id.clone(),
            direction,
            payload.content.clone(),
            &payload.platform_msg_id,
            payload.sent_at,
        );
        let message_id = match self.messages.insert(message.clone()).await {
            Ok(()) => message.id,
            // Concurrent replay slipped past the lookup; the unique index is
            // the authority, so fetch what won.
            Err(error) if error.is_duplicate_key() => {
                let existing = self
                    .messages
                    .find_by_platform_id(&conversation.id, &payload.platform_msg_id)
                    .await?
                    .ok_or(error)?;
                return Ok(ProcessOutcome {
                    processed: true,
                    lead_id: Some(lead.id),
                    conversation_id: Some(conversation.id),
                    message_id: Some(existing.id),
                    deduplicated: true,
                });
            }
            Err(error) => return Err(error.into()),
        };

        if conversation.observe_message_at(payload.sent_at) {
            self.conversations.save(conversation.clone()).await?;
        }

        info!(
            lead_id = %lead.id.0,
            conversation_id = %conversation.id.0,
            message_id = %message_id.0,
            direction = direction.as_str(),
            "message stored"
        );

        Ok(ProcessOutcome {
            processed: true,
            lead_id: Some(lead.id),
            conversation_id: Some(conversation.id),
            message_id: Some(message_id),
            deduplicated: false,
        })
    }

    async fn process_tag(
        &self,
        event: &CanonicalEvent,
        applied: bool,
    ) -> Result<ProcessOutcome, ProcessError> {
        let tag = event.tag.as_deref().ok_or(ProcessError::MissingTag)?;
        let (mut lead, dirty) = self.resolve_lead(event).await?;

        let changed =
            if applied { lead.add_tag(tag) } else { lead.remove_tag(tag) };
        if changed || dirty {
            lead = self
                .save_lead(lead, |winner| {
                    if applied {
                        winner.add_tag(tag)
                    } else {
                        winner.remove_tag(tag)
                    }
                })
                .await?;
        }
        debug!(lead_id = %lead.id.0, tag, applied, changed, "tag event applied");

        Ok(ProcessOutcome { processed: true, lead_id: Some(lead.id), ..Default::default() })
    }

    async fn process_custom_field(
        &self,
        event: &CanonicalEvent,
    ) -> Result<ProcessOutcome, ProcessError> {
        let field = event.custom_field.as_ref().ok_or(ProcessError::MissingCustomField)?;
        let (mut lead, _) = self.resolve_lead(event).await?;

        lead.set_custom_field(&field.name, field.value.clone());
        lead = self
            .save_lead(lead, |winner| {
                winner.set_custom_field(&field.name, field.value.clone());
                true
            })
            .await?;
        debug!(lead_id = %lead.id.0, field = %field.name, "custom field applied");

        Ok(ProcessOutcome { processed: true, lead_id: Some(lead.id), ..Default::default() })
    }

    /// Saves a lead, recovering from the first-contact race: two concurrent
    /// webhooks can both miss the lookup and insert the same subscriber, and
    /// the loser's row hits the unique index. The stored winner is re-fetched
    /// by subscriber id (then phone), `reapply` is run against it, and the
    /// save retried once.
    async fn save_lead(
        &self,
        lead: Lead,
        reapply: impl FnOnce(&mut Lead) -> bool,
    ) -> Result<Lead, ProcessError> {
        let error = match self.leads.save(lead.clone()).await {
            Ok(()) => return Ok(lead),
            Err(error) if error.is_duplicate_key() => error,
            Err(error) => return Err(error.into()),
        };

        let mut winner = match lead.subscriber_id.as_deref() {
            Some(id) => self.leads.find_by_subscriber_id(id).await?,
            None => None,
        };
        if winner.is_none() {
            if let Some(phone) = lead.phone.as_deref() {
                winner = self.leads.find_by_phone(phone).await?;
            }
        }
        let mut winner = winner.ok_or(error)?;
        debug!(
            lead_id = %winner.id.0,
            "lead insert lost a race, continuing with the stored row"
        );
        if reapply(&mut winner) {
            self.leads.save(winner.clone()).await?;
        }
        Ok(winner)
    }

    /// Subscriber id first, then phone, then a fresh lead. The phone fallback
    /// is what links a walk-in lead captured by hand to their later platform
    /// identity.
    ///
    /// The returned flag is true when the lead is new or was mutated here and
    /// still needs a save.
    async fn resolve_lead(
        &self,
        event: &CanonicalEvent,
    ) -> Result<(Lead, bool), ProcessError> {
        let subscriber_id = event.subscriber_identifier();
        if let Some(id) = subscriber_id {
            if let Some(lead) = self.leads.find_by_subscriber_id(id).await? {
                return Ok((lead, false));
            }
        }

        let phone = event.subscriber.as_ref().and_then(|sub| sub.best_phone());
        if let Some(phone) = phone {
            if let Some(mut lead) = self.leads.find_by_phone(phone).await? {
                let linked = lead.subscriber_id.is_none() && subscriber_id.is_some();
                if linked {
                    lead.subscriber_id = subscriber_id.map(str::to_string);
                    lead.touch();
                }
                return Ok((lead, linked));
            }
        }

        let subscriber_id = subscriber_id.ok_or(ProcessError::MissingSubscriber)?;
        let name = event
            .subscriber
            .as_ref()
            .and_then(|sub| sub.display_name())
            .unwrap_or_else(|| "Unknown".to_string());
        let mut lead = Lead::new(name);
        lead.subscriber_id = Some(subscriber_id.to_string());
        Ok((lead, true))
    }
}
