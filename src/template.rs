//! Config-driven collaborator.
//!
//! A content type is described in YAML: which source fields an item needs,
//! a prompt template with `{{field}}` placeholders, how reply keys map to
//! target fields, and optional count and range rules. Count mismatches are
//! rejected unless the content type opts into truncation; short lists are
//! never padded.

use handlebars::{Handlebars, RenderErrorReason};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ItemResult, RequestBuilder, ResponseValidator, ValidationError, WorkItem, parse_reply_json};
use crate::llm::{RawReply, RequestPayload};
use crate::storage::WorkQuery;

/// Maps one reply key to one target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    pub reply_key: String,
    pub target: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// What to do when a list in the reply has the wrong length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountPolicy {
    #[default]
    Reject,
    /// Keep the first `count` entries of a longer list. Shorter lists are
    /// still rejected.
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRule {
    pub reply_key: String,
    pub count: usize,
    #[serde(default)]
    pub policy: CountPolicy,
}

/// Inclusive numeric bounds for a reply key (or every number in a list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    pub reply_key: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentTypeConfig {
    pub name: String,
    /// Overrides the configured model
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    pub prompt_template: String,
    pub outputs: Vec<OutputField>,
    #[serde(default)]
    pub expected_count: Option<CountRule>,
    #[serde(default)]
    pub ranges: Vec<RangeRule>,
    /// Merged over the configured API parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ContentTypeConfig {
    pub fn target_fields(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.target.clone()).collect()
    }

    /// Selection query for this content type.
    pub fn work_query(&self) -> WorkQuery {
        WorkQuery::new(self.required_fields.clone(), self.target_fields())
    }
}

/// [`RequestBuilder`] + [`ResponseValidator`] for one [`ContentTypeConfig`].
#[derive(Debug, Clone)]
pub struct TemplateHandler {
    content: ContentTypeConfig,
    model: String,
    parameters: Value,
    handlebars: Handlebars<'static>,
}

impl TemplateHandler {
    pub fn new(content: ContentTypeConfig, default_model: &str, base_parameters: &Map<String, Value>) -> Self {
        let model = content.model.clone().unwrap_or_else(|| default_model.to_string());
        let mut parameters = base_parameters.clone();
        parameters.extend(content.parameters.clone());

        let mut handlebars = Handlebars::new();
        // A placeholder the item cannot fill is an error, not an empty string
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);

        Self {
            content,
            model,
            parameters: Value::Object(parameters),
            handlebars,
        }
    }

    pub fn content(&self) -> &ContentTypeConfig {
        &self.content
    }

    /// Render the prompt with the item payload as context. `{{id}}` is the item id.
    pub fn render(&self, item: &WorkItem) -> Result<String, ValidationError> {
        let mut context = match &item.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        context.insert("id".to_string(), Value::String(item.id.clone()));

        self.handlebars
            .render_template(&self.content.prompt_template, &Value::Object(context))
            .map_err(|e| match e.reason() {
                RenderErrorReason::MissingVariable(Some(path)) => ValidationError::missing(path.clone()),
                _ => ValidationError::MalformedPayload(format!("Failed to render prompt: {}", e)),
            })
    }

    fn check_count(&self, reply: &mut Map<String, Value>) -> Result<(), ValidationError> {
        let Some(rule) = &self.content.expected_count else {
            return Ok(());
        };
        let list = match reply.get_mut(&rule.reply_key) {
            Some(Value::Array(list)) => list,
            Some(_) => {
                return Err(ValidationError::MalformedPayload(format!("{} is not a list", rule.reply_key)));
            }
            None => return Err(ValidationError::missing(&rule.reply_key)),
        };

        match (list.len().cmp(&rule.count), rule.policy) {
            (std::cmp::Ordering::Equal, _) => Ok(()),
            (std::cmp::Ordering::Greater, CountPolicy::Truncate) => {
                log::debug!("Truncating {} from {} to {} entries", rule.reply_key, list.len(), rule.count);
                list.truncate(rule.count);
                Ok(())
            }
            _ => Err(ValidationError::CountMismatch {
                field: rule.reply_key.clone(),
                expected: rule.count,
                actual: list.len(),
            }),
        }
    }

    fn check_ranges(&self, reply: &Map<String, Value>) -> Result<(), ValidationError> {
        for rule in &self.content.ranges {
            let Some(value) = reply.get(&rule.reply_key) else {
                continue;
            };
            let values: Vec<&Value> = match value {
                Value::Array(list) => list.iter().collect(),
                other => vec![other],
            };
            for v in values {
                let n = v.as_f64().ok_or_else(|| ValidationError::OutOfRange {
                    field: rule.reply_key.clone(),
                    detail: format!("{} is not a number", v),
                })?;
                let below = rule.min.is_some_and(|min| n < min);
                let above = rule.max.is_some_and(|max| n > max);
                if below || above {
                    return Err(ValidationError::OutOfRange {
                        field: rule.reply_key.clone(),
                        detail: format!("{} not in [{}, {}]", n, fmt_bound(rule.min), fmt_bound(rule.max)),
                    });
                }
            }
        }
        Ok(())
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| b.to_string())
}

impl RequestBuilder for TemplateHandler {
    fn build_request(&self, item: &WorkItem) -> Result<RequestPayload, ValidationError> {
        for field in &self.content.required_fields {
            if crate::storage::is_empty(item.payload.get(field)) {
                return Err(ValidationError::missing(field));
            }
        }

        Ok(RequestPayload::new(self.model.clone(), self.render(item)?).with_parameters(self.parameters.clone()))
    }
}

impl ResponseValidator for TemplateHandler {
    fn validate(&self, reply: &RawReply, item: &WorkItem) -> Result<ItemResult, ValidationError> {
        let mut map = parse_reply_json(&reply.content)?;
        self.check_count(&mut map)?;
        self.check_ranges(&map)?;

        let mut update = Map::new();
        for output in &self.content.outputs {
            match map.remove(&output.reply_key) {
                Some(value) if !crate::storage::is_empty(Some(&value)) => {
                    update.insert(output.target.clone(), value);
                }
                _ if output.required => return Err(ValidationError::missing(&output.reply_key)),
                _ => {}
            }
        }

        if update.is_empty() {
            return Err(ValidationError::MalformedPayload("reply produced no fields".to_string()));
        }
        Ok(ItemResult::new(item.id.clone(), update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const YAML: &str = r#"
name: book-summary
required_fields: [title, author]
prompt_template: "Summarize {{ title }} by {{author}} ({{id}}). Give {{missing_ok}}"
outputs:
  - reply_key: summary
    target: ai_summary
  - reply_key: keywords
    target: ai_keywords
  - reply_key: rating
    target: ai_rating
    required: false
expected_count:
  reply_key: keywords
  count: 3
ranges:
  - reply_key: rating
    min: 1
    max: 5
"#;

    fn content() -> ContentTypeConfig {
        let mut content: ContentTypeConfig = serde_yaml::from_str(YAML).unwrap();
        content.prompt_template = "Summarize {{ title }} by {{author}} ({{id}}).".to_string();
        content
    }

    fn handler() -> TemplateHandler {
        let mut base = Map::new();
        base.insert("temperature".to_string(), json!(0.2));
        TemplateHandler::new(content(), "default-model", &base)
    }

    fn item() -> WorkItem {
        WorkItem::new("b1", json!({"title": "Dune", "author": "Herbert"}))
    }

    #[test]
    fn test_yaml_defaults() {
        let content: ContentTypeConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(content.expected_count.as_ref().unwrap().policy, CountPolicy::Reject);
        assert!(content.outputs[0].required);
        assert!(!content.outputs[2].required);
        assert_eq!(content.work_query().target_fields, vec!["ai_summary", "ai_keywords", "ai_rating"]);
    }

    #[test]
    fn test_build_request_renders_template() {
        let payload = handler().build_request(&item()).unwrap();
        assert_eq!(payload.model, "default-model");
        assert_eq!(payload.input, json!("Summarize Dune by Herbert (b1)."));
        assert_eq!(payload.parameters, json!({"temperature": 0.2}));
        // the engine's retry policy decides the per-attempt timeout
        assert!(payload.timeout.is_none());
    }

    #[test]
    fn test_build_request_missing_field() {
        let item = WorkItem::new("b1", json!({"title": "Dune"}));
        let err = handler().build_request(&item).unwrap_err();
        assert_eq!(err, ValidationError::missing("author"));
    }

    fn with_template(template: &str) -> TemplateHandler {
        let mut content = content();
        content.required_fields.clear();
        content.prompt_template = template.to_string();
        TemplateHandler::new(content, "m", &Map::new())
    }

    #[test]
    fn test_render_nested_and_each() {
        let handler = with_template("{{title}} ({{meta.year}}):{{#each tags}} {{this}}{{/each}}");
        let item = WorkItem::new(
            "b2",
            json!({"title": "Dune", "meta": {"year": 1965}, "tags": ["sand", "spice"]}),
        );
        assert_eq!(handler.render(&item).unwrap(), "Dune (1965): sand spice");
    }

    #[test]
    fn test_render_does_not_escape() {
        let handler = with_template("Text: {{title}}");
        let item = WorkItem::new("b3", json!({"title": "<b>Tom & Jerry</b>"}));
        assert_eq!(handler.render(&item).unwrap(), "Text: <b>Tom & Jerry</b>");
    }

    #[test]
    fn test_render_missing_variable_is_missing_field() {
        let handler = with_template("Hi {{meta.publisher}}");
        assert_eq!(handler.render(&item()).unwrap_err(), ValidationError::missing("meta.publisher"));
    }

    #[test]
    fn test_render_malformed_template() {
        let handler = with_template("Hi {{title}} {{#if}}");
        assert!(matches!(
            handler.render(&item()),
            Err(ValidationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_validate_maps_outputs() {
        let reply = RawReply::new(r#"{"summary": "Spice", "keywords": ["a", "b", "c"], "rating": 4}"#);
        let result = handler().validate(&reply, &item()).unwrap();
        assert_eq!(result.work_item_id, "b1");
        assert_eq!(result.update_fields["ai_summary"], json!("Spice"));
        assert_eq!(result.update_fields["ai_keywords"], json!(["a", "b", "c"]));
        assert_eq!(result.update_fields["ai_rating"], json!(4));
    }

    #[test]
    fn test_validate_count_mismatch_rejected() {
        let reply = RawReply::new(r#"{"summary": "Spice", "keywords": ["a", "b", "c", "d"]}"#);
        let err = handler().validate(&reply, &item()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CountMismatch {
                field: "keywords".to_string(),
                expected: 3,
                actual: 4
            }
        );
    }

    #[test]
    fn test_validate_truncate_policy() {
        let mut content = content();
        content.expected_count.as_mut().unwrap().policy = CountPolicy::Truncate;
        let handler = TemplateHandler::new(content, "m", &Map::new());

        let reply = RawReply::new(r#"{"summary": "Spice", "keywords": ["a", "b", "c", "d"]}"#);
        let result = handler.validate(&reply, &item()).unwrap();
        assert_eq!(result.update_fields["ai_keywords"], json!(["a", "b", "c"]));

        let short = RawReply::new(r#"{"summary": "Spice", "keywords": ["a"]}"#);
        assert!(matches!(
            handler.validate(&short, &item()),
            Err(ValidationError::CountMismatch { actual: 1, .. })
        ));
    }

    #[test]
    fn test_validate_out_of_range() {
        let reply = RawReply::new(r#"{"summary": "Spice", "keywords": ["a", "b", "c"], "rating": 9}"#);
        let err = handler().validate(&reply, &item()).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { ref field, .. } if field == "rating"));
    }

    #[test]
    fn test_validate_missing_required_output() {
        let reply = RawReply::new(r#"{"keywords": ["a", "b", "c"]}"#);
        assert_eq!(
            handler().validate(&reply, &item()).unwrap_err(),
            ValidationError::missing("summary")
        );
    }

    #[test]
    fn test_model_override() {
        let mut content = content();
        content.model = Some("special".to_string());
        let handler = TemplateHandler::new(content, "default-model", &Map::new());
        assert_eq!(handler.build_request(&item()).unwrap().model, "special");
    }
}
