use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::debug;

use motocrm_core::event::SubscriberPayload;

use crate::client::{PlatformClient, PlatformError, SubscriberUpdate};

/// REST client for the platform API, authenticated with a bearer token.
pub struct HttpPlatformClient {
    http: reqwest::Client,
    base_url: String,
    api_token: SecretString,
}

impl HttpPlatformClient {
    pub fn new(
        base_url: impl Into<String>,
        api_token: SecretString,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url, api_token })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json(&self, path: &str) -> Result<Option<Value>, PlatformError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<(), PlatformError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(self.api_token.expose_secret())
            .json(body)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(PlatformError::Api { status: status.as_u16(), message })
}

fn subscriber_from_body(body: Value) -> Result<Option<SubscriberPayload>, PlatformError> {
    // Lookup endpoints wrap the record in a `data` envelope.
    let record = body.get("data").cloned().unwrap_or(body);
    if record.is_null() {
        return Ok(None);
    }
    SubscriberPayload::from_value(&record)
        .map(Some)
        .ok_or_else(|| PlatformError::Decode("subscriber record is not an object".to_string()))
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn find_subscriber(
        &self,
        subscriber_id: &str,
    ) -> Result<Option<SubscriberPayload>, PlatformError> {
        debug!(subscriber_id, "platform subscriber lookup");
        match self.get_json(&format!("/subscriber/getInfo?subscriber_id={subscriber_id}")).await? {
            Some(body) => subscriber_from_body(body),
            None => Ok(None),
        }
    }

    async fn find_subscriber_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<SubscriberPayload>, PlatformError> {
        debug!(phone, "platform subscriber lookup by phone");
        match self.get_json(&format!("/subscriber/findByCustomField?phone={phone}")).await? {
            Some(body) => subscriber_from_body(body),
            None => Ok(None),
        }
    }

    async fn add_tag(&self, subscriber_id: &str, tag: &str) -> Result<(), PlatformError> {
        self.post_json(
            "/subscriber/addTagByName",
            &json!({"subscriber_id": subscriber_id, "tag_name": tag}),
        )
        .await
    }

    async fn remove_tag(&self, subscriber_id: &str, tag: &str) -> Result<(), PlatformError> {
        self.post_json(
            "/subscriber/removeTagByName",
            &json!({"subscriber_id": subscriber_id, "tag_name": tag}),
        )
        .await
    }

    async fn set_custom_field(
        &self,
        subscriber_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), PlatformError> {
        self.post_json(
            "/subscriber/setCustomFieldByName",
            &json!({
                "subscriber_id": subscriber_id,
                "field_name": field,
                "field_value": value,
            }),
        )
        .await
    }

    async fn update_subscriber(
        &self,
        subscriber_id: &str,
        update: SubscriberUpdate,
    ) -> Result<(), PlatformError> {
        if update.is_empty() {
            return Ok(());
        }
        let mut body = serde_json::to_value(&update)
            .map_err(|error| PlatformError::Decode(error.to_string()))?;
        body["subscriber_id"] = json!(subscriber_id);
        self.post_json("/subscriber/updateSubscriber", &body).await
    }
}
