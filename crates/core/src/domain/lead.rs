use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::event::SubscriberPayload;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

impl LeadId {
    pub fn generate() -> Self {
        Self(format!("LD-{}", Uuid::new_v4().simple()))
    }
}

/// Pipeline stage of a prospective motorcycle-financing customer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStage {
    NewLead,
    Contacted,
    Qualified,
    ProposalSent,
    FinancingReview,
    Approved,
    Delivered,
    Lost,
}

impl LeadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewLead => "new_lead",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::ProposalSent => "proposal_sent",
            Self::FinancingReview => "financing_review",
            Self::Approved => "approved",
            Self::Delivered => "delivered",
            Self::Lost => "lost",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new_lead" => Some(Self::NewLead),
            "contacted" => Some(Self::Contacted),
            "qualified" => Some(Self::Qualified),
            "proposal_sent" => Some(Self::ProposalSent),
            "financing_review" => Some(Self::FinancingReview),
            "approved" => Some(Self::Approved),
            "delivered" => Some(Self::Delivered),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    /// Fallback join key when the platform subscriber id is not yet known.
    pub phone: Option<String>,
    pub email: Option<String>,
    /// External platform subscriber id. At most one Lead carries a given id.
    pub subscriber_id: Option<String>,
    /// Ordered tag set, duplicates suppressed on insert.
    pub tags: Vec<String>,
    pub custom_fields: Map<String, Value>,
    pub stage: LeadStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: LeadId::generate(),
            name: name.into(),
            phone: None,
            email: None,
            subscriber_id: None,
            tags: Vec::new(),
            custom_fields: Map::new(),
            stage: LeadStage::NewLead,
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a tag unless it is already present. Returns whether the set changed.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.tags.iter().any(|existing| existing == tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    /// Removes a tag. Removing an absent tag is not an error.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|existing| existing != tag);
        self.tags.len() != before
    }

    pub fn set_custom_field(&mut self, key: &str, value: Value) -> bool {
        if self.custom_fields.get(key) == Some(&value) {
            return false;
        }
        self.custom_fields.insert(key.to_string(), value);
        true
    }

    /// Merges an incoming subscriber payload into this lead.
    ///
    /// A non-empty stored value is never overwritten by an empty incoming one;
    /// webhooks frequently carry partial subscriber snapshots. Returns whether
    /// anything changed.
    pub fn merge_subscriber(&mut self, subscriber: &SubscriberPayload) -> bool {
        let mut changed = false;

        if let Some(id) = non_empty(subscriber.id.as_deref()) {
            if self.subscriber_id.as_deref() != Some(id) {
                self.subscriber_id = Some(id.to_string());
                changed = true;
            }
        }
        let display_name = subscriber.display_name();
        if let Some(name) = non_empty(display_name.as_deref()) {
            if self.name.is_empty() || self.name == "Unknown" {
                if self.name != name {
                    self.name = name.to_string();
                    changed = true;
                }
            }
        }
        if let Some(phone) = non_empty(subscriber.best_phone()) {
            if self.phone.is_none() {
                self.phone = Some(phone.to_string());
                changed = true;
            }
        }
        if let Some(email) = non_empty(subscriber.email.as_deref()) {
            if self.email.is_none() {
                self.email = Some(email.to_string());
                changed = true;
            }
        }
        for (key, value) in &subscriber.custom_fields {
            if value.is_null() {
                continue;
            }
            if self.custom_fields.get(key) != Some(value) {
                self.custom_fields.insert(key.clone(), value.clone());
                changed = true;
            }
        }

        if changed {
            self.touch();
        }
        changed
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use crate::event::SubscriberPayload;

    use super::{Lead, LeadStage};

    fn subscriber(phone: Option<&str>, name: Option<&str>) -> SubscriberPayload {
        SubscriberPayload {
            phone: phone.map(str::to_string),
            name: name.map(str::to_string),
            ..SubscriberPayload::default()
        }
    }

    #[test]
    fn tags_keep_insertion_order_and_suppress_duplicates() {
        let mut lead = Lead::new("Carlos");
        assert!(lead.add_tag("hot"));
        assert!(lead.add_tag("financing"));
        assert!(!lead.add_tag("hot"));
        assert_eq!(lead.tags, vec!["hot", "financing"]);
    }

    #[test]
    fn removing_absent_tag_is_a_noop() {
        let mut lead = Lead::new("Carlos");
        lead.add_tag("hot");
        assert!(!lead.remove_tag("cold"));
        assert!(lead.remove_tag("hot"));
        assert!(lead.tags.is_empty());
    }

    #[test]
    fn merge_never_overwrites_non_empty_with_empty() {
        let mut lead = Lead::new("María");
        lead.phone = Some("+5437099999".to_string());

        let incoming = subscriber(Some("   "), None);
        let changed = lead.merge_subscriber(&incoming);

        assert!(!changed);
        assert_eq!(lead.phone.as_deref(), Some("+5437099999"));
        assert_eq!(lead.name, "María");
    }

    #[test]
    fn merge_backfills_missing_fields() {
        let mut lead = Lead::new("Unknown");
        let mut incoming = subscriber(Some("+543709876543"), Some("María"));
        incoming.id = Some("987654321".to_string());
        incoming.email = Some("maria@example.com".to_string());

        assert!(lead.merge_subscriber(&incoming));
        assert_eq!(lead.name, "María");
        assert_eq!(lead.phone.as_deref(), Some("+543709876543"));
        assert_eq!(lead.email.as_deref(), Some("maria@example.com"));
        assert_eq!(lead.subscriber_id.as_deref(), Some("987654321"));
    }

    #[test]
    fn merge_combines_custom_fields() {
        let mut lead = Lead::new("Carlos");
        lead.set_custom_field("model", json!("XR 250"));

        let mut fields = Map::new();
        fields.insert("budget".to_string(), json!(450000));
        let incoming =
            SubscriberPayload { custom_fields: fields, ..SubscriberPayload::default() };

        assert!(lead.merge_subscriber(&incoming));
        assert_eq!(lead.custom_fields.get("model"), Some(&json!("XR 250")));
        assert_eq!(lead.custom_fields.get("budget"), Some(&json!(450000)));
    }

    #[test]
    fn stage_round_trips_through_str() {
        for stage in [
            LeadStage::NewLead,
            LeadStage::Contacted,
            LeadStage::Qualified,
            LeadStage::ProposalSent,
            LeadStage::FinancingReview,
            LeadStage::Approved,
            LeadStage::Delivered,
            LeadStage::Lost,
        ] {
            assert_eq!(LeadStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(LeadStage::parse("bogus"), None);
    }
}
