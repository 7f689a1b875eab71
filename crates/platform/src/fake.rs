//! Scriptable platform double for sync and server tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use motocrm_core::event::SubscriberPayload;

use crate::client::{PlatformClient, PlatformError, SubscriberUpdate};

/// Every mutating call the fake has observed, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCall {
    AddTag { subscriber_id: String, tag: String },
    RemoveTag { subscriber_id: String, tag: String },
    SetCustomField { subscriber_id: String, field: String, value: Value },
    UpdateSubscriber { subscriber_id: String, update: SubscriberUpdate },
}

#[derive(Default)]
struct FakeState {
    subscribers: HashMap<String, SubscriberPayload>,
    subscribers_by_phone: HashMap<String, String>,
    calls: Vec<RecordedCall>,
    scripted_failures: VecDeque<String>,
    always_fail: Option<String>,
    failing_subscribers: HashSet<String>,
}

#[derive(Default)]
pub struct FakePlatformClient {
    state: Mutex<FakeState>,
}

impl FakePlatformClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscriber(&self, subscriber: SubscriberPayload) {
        let mut state = self.state.lock().expect("fake platform lock");
        if let Some(phone) = subscriber.best_phone() {
            if let Some(id) = subscriber.id.clone() {
                state.subscribers_by_phone.insert(phone.to_string(), id);
            }
        }
        if let Some(id) = subscriber.id.clone() {
            state.subscribers.insert(id, subscriber);
        }
    }

    /// Fails the next mutating call with the given message, then recovers.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().expect("fake platform lock").scripted_failures.push_back(message.into());
    }

    /// Fails every call until cleared with [`Self::heal`].
    pub fn fail_always(&self, message: impl Into<String>) {
        self.state.lock().expect("fake platform lock").always_fail = Some(message.into());
    }

    /// Fails any call that targets the given subscriber.
    pub fn fail_subscriber(&self, subscriber_id: impl Into<String>) {
        self.state
            .lock()
            .expect("fake platform lock")
            .failing_subscribers
            .insert(subscriber_id.into());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().expect("fake platform lock");
        state.always_fail = None;
        state.scripted_failures.clear();
        state.failing_subscribers.clear();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().expect("fake platform lock").calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().expect("fake platform lock").calls.len()
    }

    fn check_failure(
        state: &mut FakeState,
        subscriber_id: &str,
    ) -> Result<(), PlatformError> {
        if state.failing_subscribers.contains(subscriber_id) {
            return Err(PlatformError::Api {
                status: 500,
                message: format!("scripted failure for {subscriber_id}"),
            });
        }
        if let Some(message) = state.always_fail.clone() {
            return Err(PlatformError::Api { status: 500, message });
        }
        if let Some(message) = state.scripted_failures.pop_front() {
            return Err(PlatformError::Api { status: 500, message });
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for FakePlatformClient {
    async fn find_subscriber(
        &self,
        subscriber_id: &str,
    ) -> Result<Option<SubscriberPayload>, PlatformError> {
        let mut state = self.state.lock().expect("fake platform lock");
        Self::check_failure(&mut state, subscriber_id)?;
        Ok(state.subscribers.get(subscriber_id).cloned())
    }

    async fn find_subscriber_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<SubscriberPayload>, PlatformError> {
        let mut state = self.state.lock().expect("fake platform lock");
        Self::check_failure(&mut state, phone)?;
        let id = state.subscribers_by_phone.get(phone).cloned();
        Ok(id.and_then(|id| state.subscribers.get(&id).cloned()))
    }

    async fn add_tag(&self, subscriber_id: &str, tag: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().expect("fake platform lock");
        Self::check_failure(&mut state, subscriber_id)?;
        state.calls.push(RecordedCall::AddTag {
            subscriber_id: subscriber_id.to_string(),
            tag: tag.to_string(),
        });
        Ok(())
    }

    async fn remove_tag(&self, subscriber_id: &str, tag: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().expect("fake platform lock");
        Self::check_failure(&mut state, subscriber_id)?;
        state.calls.push(RecordedCall::RemoveTag {
            subscriber_id: subscriber_id.to_string(),
            tag: tag.to_string(),
        });
        Ok(())
    }

    async fn set_custom_field(
        &self,
        subscriber_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().expect("fake platform lock");
        Self::check_failure(&mut state, subscriber_id)?;
        state.calls.push(RecordedCall::SetCustomField {
            subscriber_id: subscriber_id.to_string(),
            field: field.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    async fn update_subscriber(
        &self,
        subscriber_id: &str,
        update: SubscriberUpdate,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().expect("fake platform lock");
        Self::check_failure(&mut state, subscriber_id)?;
        state.calls.push(RecordedCall::UpdateSubscriber {
            subscriber_id: subscriber_id.to_string(),
            update,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use motocrm_core::event::SubscriberPayload;

    use super::{FakePlatformClient, RecordedCall};
    use crate::client::PlatformClient;

    #[tokio::test]
    async fn records_calls_in_order() {
        let fake = FakePlatformClient::new();
        fake.add_tag("987", "hot").await.expect("add tag");
        fake.remove_tag("987", "cold").await.expect("remove tag");

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], RecordedCall::AddTag { .. }));
        assert!(matches!(calls[1], RecordedCall::RemoveTag { .. }));
    }

    #[tokio::test]
    async fn fail_next_recovers_after_one_call() {
        let fake = FakePlatformClient::new();
        fake.fail_next("boom");

        fake.add_tag("987", "hot").await.expect_err("first call fails");
        fake.add_tag("987", "hot").await.expect("second call succeeds");
        assert_eq!(fake.call_count(), 1);
    }

    #[tokio::test]
    async fn lookup_by_phone_resolves_through_the_id_index() {
        let fake = FakePlatformClient::new();
        fake.insert_subscriber(SubscriberPayload {
            id: Some("987".to_string()),
            phone: Some("+5437099".to_string()),
            ..Default::default()
        });

        let found = fake.find_subscriber_by_phone("+5437099").await.expect("lookup");
        assert_eq!(found.and_then(|sub| sub.id), Some("987".to_string()));
        assert!(fake.find_subscriber("unknown").await.expect("lookup").is_none());
    }
}
