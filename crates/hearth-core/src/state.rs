//! Entity state types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The state of an entity at a point in time
///
/// A state carries the entity's current value (as a string), any associated
/// attributes, and timestamps for when the value last changed and when the
/// state was last updated. The broker's cache holds at most one current
/// state per entity id and replaces entries wholesale, never merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    /// The entity this state belongs to (e.g. "light.kitchen")
    pub entity_id: String,

    /// The state value (e.g. "on", "off", "23.5", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last updated (even if the value didn't change)
    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    /// Create a new state with the current timestamp and no attributes
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: HashMap::new(),
            last_changed: now,
            last_updated: now,
        }
    }

    /// Attach attributes to this state
    pub fn with_attributes(mut self, attributes: HashMap<String, serde_json::Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// The domain part of the entity id ("light" for "light.kitchen")
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }

    /// Get an attribute value by key, deserialized to the requested type
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Check if the state value represents an unavailable entity
    pub fn is_unavailable(&self) -> bool {
        self.state == "unavailable"
    }
}

impl PartialEq for EntityState {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

/// A partial state update sent to the hub's state-mutation endpoint
///
/// The state value is mandatory; attributes are optional and merged
/// server-side. The broker never reconciles a patch with its local cache;
/// the next observed state-changed event is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePatch {
    /// The new state value
    pub state: String,

    /// Attributes to update (partial; server-side merge semantics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, serde_json::Value>>,
}

impl StatePatch {
    /// Create a patch carrying only a state value
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: None,
        }
    }

    /// Attach a partial attribute update
    pub fn with_attributes(mut self, attributes: HashMap<String, serde_json::Value>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Build the request body for the mutation call
    pub fn into_body(self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("state".to_string(), serde_json::Value::String(self.state));
        if let Some(attributes) = self.attributes {
            body.insert(
                "attributes".to_string(),
                serde_json::Value::Object(attributes.into_iter().collect()),
            );
        }
        serde_json::Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_domain_extraction() {
        let state = EntityState::new("light.kitchen", "on");
        assert_eq!(state.domain(), "light");

        let odd = EntityState::new("no_dot", "on");
        assert_eq!(odd.domain(), "no_dot");
    }

    #[test]
    fn test_typed_attribute_access() {
        let mut attributes = HashMap::new();
        attributes.insert("brightness".to_string(), json!(128));
        let state = EntityState::new("light.kitchen", "on").with_attributes(attributes);

        assert_eq!(state.attribute::<u8>("brightness"), Some(128));
        assert_eq!(state.attribute::<String>("missing"), None);
    }

    #[test]
    fn test_equality_ignores_timestamps() {
        let mut a = EntityState::new("light.kitchen", "on");
        let b = EntityState::new("light.kitchen", "on");
        a.last_updated = a.last_updated + chrono::Duration::seconds(30);
        assert_eq!(a, b);
    }

    #[test]
    fn test_patch_body_omits_absent_attributes() {
        let body = StatePatch::new("off").into_body();
        assert_eq!(body, json!({"state": "off"}));

        let mut attributes = HashMap::new();
        attributes.insert("reason".to_string(), json!("manual"));
        let body = StatePatch::new("off").with_attributes(attributes).into_body();
        assert_eq!(body, json!({"state": "off", "attributes": {"reason": "manual"}}));
    }
}
