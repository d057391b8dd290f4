//! Event records and normalization
//!
//! Converts the raw arguments of [`Publisher::track`](super::Publisher::track)
//! into the canonical [`EventRecord`] that is queued and sent.
//!
//! ## Wire format
//!
//! Records serialize with camelCase keys. Context fields from configuration
//! are flattened into the top level of each record:
//!
//! ```json
//! {"timestamp":"2026-10-18T12:00:00Z","sessionId":"1760788800000-3f2a9c1be",
//!  "metricName":"Click","contentId":"btn-1","attributes":{},
//!  "userAgent":"metricpost/0.1.0","device":"tv-1"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by the record itself; context entries with these names are dropped
pub const RESERVED_KEYS: &[&str] = &[
    "timestamp",
    "sessionId",
    "metricName",
    "value",
    "contentId",
    "attributes",
    "experimentGroup",
    "userAgent",
];

/// User agent recorded when the environment cannot supply one
pub const UNKNOWN_USER_AGENT: &str = "unknown";

/// A single canonical event
///
/// Records are never mutated once queued; batches move them by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Capture time (client clock)
    pub timestamp: DateTime<Utc>,

    /// Identifier shared by every event of one publisher instance
    pub session_id: String,

    /// Caller-supplied category
    pub metric_name: String,

    /// Optional numeric measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// Optional identifier of the subject being measured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,

    /// Free-form attributes; unparsable input is kept under `raw`
    #[serde(default)]
    pub attributes: Map<String, Value>,

    /// Optional cohort tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_group: Option<String>,

    /// Capture-time environment string
    pub user_agent: String,

    /// Static context merged from configuration
    #[serde(flatten)]
    pub context: Map<String, Value>,
}

/// Attributes as supplied by a caller
///
/// Callers either hand over a structured map or a serialized JSON string.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeInput {
    /// Already structured
    Structured(Map<String, Value>),
    /// A JSON string to parse
    Serialized(String),
}

impl AttributeInput {
    /// Resolve into a map, never failing
    ///
    /// A string that does not parse to a JSON object is preserved as
    /// `{"raw": <original string>}`.
    pub fn into_map(self) -> Map<String, Value> {
        match self {
            AttributeInput::Structured(map) => map,
            AttributeInput::Serialized(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    tracing::debug!(raw = %text, "Attributes are not a JSON object, keeping raw");
                    raw_attributes(text)
                }
            },
        }
    }
}

fn raw_attributes(text: String) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("raw".to_string(), Value::String(text));
    map
}

impl From<&str> for AttributeInput {
    fn from(text: &str) -> Self {
        AttributeInput::Serialized(text.to_string())
    }
}

impl From<String> for AttributeInput {
    fn from(text: String) -> Self {
        AttributeInput::Serialized(text)
    }
}

impl From<Map<String, Value>> for AttributeInput {
    fn from(map: Map<String, Value>) -> Self {
        AttributeInput::Structured(map)
    }
}

impl From<Value> for AttributeInput {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => AttributeInput::Structured(map),
            Value::String(text) => AttributeInput::Serialized(text),
            other => AttributeInput::Serialized(other.to_string()),
        }
    }
}

/// Builds [`EventRecord`]s for one publisher instance
#[derive(Debug, Clone)]
pub struct Normalizer {
    session_id: String,
    user_agent: String,
    context: Map<String, Value>,
}

impl Normalizer {
    /// Create a normalizer; reserved keys are stripped from `context` up front
    pub fn new(session_id: String, user_agent: Option<String>, context: Map<String, Value>) -> Self {
        let context = context
            .into_iter()
            .filter(|(key, _)| {
                let reserved = RESERVED_KEYS.contains(&key.as_str());
                if reserved {
                    tracing::warn!(key = %key, "Ignoring context key that shadows an event field");
                }
                !reserved
            })
            .collect();

        Self {
            session_id,
            user_agent: user_agent
                .filter(|ua| !ua.is_empty())
                .unwrap_or_else(|| UNKNOWN_USER_AGENT.to_string()),
            context,
        }
    }

    /// Session identifier stamped on every record
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Convert raw call arguments into a canonical record
    pub fn normalize(
        &self,
        metric_name: &str,
        value: Option<f64>,
        content_id: Option<&str>,
        attributes: Option<AttributeInput>,
        experiment_group: Option<&str>,
    ) -> EventRecord {
        EventRecord {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            metric_name: metric_name.to_string(),
            value,
            content_id: content_id.map(str::to_string),
            attributes: attributes.map(AttributeInput::into_map).unwrap_or_default(),
            experiment_group: experiment_group.map(str::to_string),
            user_agent: self.user_agent.clone(),
            context: self.context.clone(),
        }
    }
}

/// Ordered snapshot of queued events, sent as one request
///
/// Serializes as a bare JSON array of records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventBatch {
    events: Vec<EventRecord>,
}

impl EventBatch {
    /// Wrap events, keeping their order
    pub fn new(events: Vec<EventRecord>) -> Self {
        Self { events }
    }

    /// Events in insertion order
    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    /// Number of events in the batch
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when the batch holds no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialize the request body
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        let mut context = Map::new();
        context.insert("device".to_string(), json!("tv-1"));
        Normalizer::new("sess-1".to_string(), Some("test-agent".to_string()), context)
    }

    #[test]
    fn test_normalize_basic_event() {
        let record = normalizer().normalize("Click", Some(1.5), Some("btn-1"), None, Some("B"));

        assert_eq!(record.metric_name, "Click");
        assert_eq!(record.value, Some(1.5));
        assert_eq!(record.content_id.as_deref(), Some("btn-1"));
        assert_eq!(record.experiment_group.as_deref(), Some("B"));
        assert_eq!(record.session_id, "sess-1");
        assert_eq!(record.user_agent, "test-agent");
        assert!(record.attributes.is_empty());
        assert_eq!(record.context["device"], "tv-1");
    }

    #[test]
    fn test_malformed_attributes_kept_raw() {
        let record =
            normalizer().normalize("Click", None, None, Some("{bad json".into()), None);
        assert_eq!(Value::Object(record.attributes), json!({"raw": "{bad json"}));
    }

    #[test]
    fn test_serialized_attributes_parsed() {
        let record = normalizer().normalize(
            "Play",
            None,
            None,
            Some(r#"{"position": 12, "muted": true}"#.into()),
            None,
        );
        assert_eq!(record.attributes["position"], 12);
        assert_eq!(record.attributes["muted"], true);
    }

    #[test]
    fn test_non_object_json_kept_raw() {
        let attrs = AttributeInput::from("[1, 2]").into_map();
        assert_eq!(Value::Object(attrs), json!({"raw": "[1, 2]"}));
    }

    #[test]
    fn test_attribute_input_from_value() {
        assert_eq!(
            AttributeInput::from(json!({"a": 1})),
            AttributeInput::Structured(json!({"a": 1}).as_object().unwrap().clone())
        );
        assert_eq!(
            AttributeInput::from(json!("{\"a\":1}")),
            AttributeInput::Serialized("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn test_missing_user_agent_is_unknown() {
        let normalizer = Normalizer::new("s".to_string(), None, Map::new());
        let record = normalizer.normalize("Load", None, None, None, None);
        assert_eq!(record.user_agent, UNKNOWN_USER_AGENT);
    }

    #[test]
    fn test_reserved_context_keys_dropped() {
        let mut context = Map::new();
        context.insert("sessionId".to_string(), json!("spoofed"));
        context.insert("locale".to_string(), json!("en-US"));
        let normalizer = Normalizer::new("real".to_string(), None, context);

        let record = normalizer.normalize("Load", None, None, None, None);
        let wire = serde_json::to_value(&record).unwrap();

        assert_eq!(wire["sessionId"], "real");
        assert_eq!(wire["locale"], "en-US");
        assert!(!record.context.contains_key("sessionId"));
    }

    #[test]
    fn test_wire_format() {
        let record = normalizer().normalize("Click", None, Some("btn-1"), None, None);
        let wire = serde_json::to_value(&record).unwrap();

        assert_eq!(wire["metricName"], "Click");
        assert_eq!(wire["contentId"], "btn-1");
        assert_eq!(wire["userAgent"], "test-agent");
        assert_eq!(wire["device"], "tv-1");
        assert!(wire.get("value").is_none());
        assert!(wire.get("experimentGroup").is_none());
        assert!(wire["timestamp"].is_string());
    }

    #[test]
    fn test_batch_serializes_as_array() {
        let n = normalizer();
        let batch = EventBatch::new(vec![
            n.normalize("A", None, None, None, None),
            n.normalize("B", None, None, None, None),
        ]);

        let body: Value = serde_json::from_str(&batch.to_json().unwrap()).unwrap();
        let names: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["metricName"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
