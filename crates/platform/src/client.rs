use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use motocrm_core::event::SubscriberPayload;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

/// Partial profile update; `None` fields are left untouched on the platform.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SubscriberUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SubscriberUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }
}

/// Operations the sync layer needs from the platform API.
///
/// A missing subscriber surfaces as `Ok(None)` on the lookup calls; every
/// other non-2xx response is a `PlatformError::Api`.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn find_subscriber(
        &self,
        subscriber_id: &str,
    ) -> Result<Option<SubscriberPayload>, PlatformError>;

    async fn find_subscriber_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<SubscriberPayload>, PlatformError>;

    async fn add_tag(&self, subscriber_id: &str, tag: &str) -> Result<(), PlatformError>;

    async fn remove_tag(&self, subscriber_id: &str, tag: &str) -> Result<(), PlatformError>;

    async fn set_custom_field(
        &self,
        subscriber_id: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), PlatformError>;

    async fn update_subscriber(
        &self,
        subscriber_id: &str,
        update: SubscriberUpdate,
    ) -> Result<(), PlatformError>;
}
