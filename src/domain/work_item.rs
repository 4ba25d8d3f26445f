//! Work items read from the backlog and the results produced for them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Immutable snapshot of one backlog record, taken at selection time.
///
/// Whether the item has been processed is never stored here; it is derived
/// from the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub payload: Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self { id: id.into(), payload }
    }

    /// Look up a top-level payload field, treating `null` as absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name).filter(|v| !v.is_null())
    }

    /// A payload field rendered as plain text.
    pub fn field_text(&self, name: &str) -> Option<String> {
        self.field(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Validated, ready-to-persist outcome of one [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub work_item_id: String,
    pub update_fields: Map<String, Value>,
}

impl ItemResult {
    pub fn new(work_item_id: impl Into<String>, update_fields: Map<String, Value>) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            update_fields,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.update_fields.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_treats_null_as_absent() {
        let item = WorkItem::new("a", json!({"title": "Dune", "summary": null}));
        assert_eq!(item.field("title"), Some(&json!("Dune")));
        assert!(item.field("summary").is_none());
        assert!(item.field("missing").is_none());
    }

    #[test]
    fn test_field_text_renders_non_strings() {
        let item = WorkItem::new("a", json!({"title": "Dune", "year": 1965}));
        assert_eq!(item.field_text("title").as_deref(), Some("Dune"));
        assert_eq!(item.field_text("year").as_deref(), Some("1965"));
    }

    #[test]
    fn test_item_result_builder() {
        let result = ItemResult::new("a", Map::new()).with_field("summary", "text");
        assert_eq!(result.work_item_id, "a");
        assert_eq!(result.update_fields.get("summary"), Some(&json!("text")));
    }
}
