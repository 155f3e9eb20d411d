//! Implementation of the CloudEvent model.

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// The event type carrying an approval decision.
pub const APPROVAL_EVENT_TYPE: &str = "com.thand.approval";

/// The event type carrying a monitored alert.
pub const ALERT_EVENT_TYPE: &str = "com.thand.alert";

/// The event type carrying a form submission.
pub const FORM_EVENT_TYPE: &str = "com.thand.form";

/// The extension attribute carrying the identity of the sender.
pub const USER_EXTENSION: &str = "user";

/// The default CloudEvents specification version.
fn default_specversion() -> String {
    "1.0".to_string()
}

/// Represents a CloudEvent.
///
/// Unknown attributes deserialize into the extension map, per the
/// CloudEvents extension attribute convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// The specification version.
    #[serde(rename = "specversion", default = "default_specversion")]
    pub spec_version: String,
    /// The identifier of the event.
    #[serde(default)]
    pub id: String,
    /// The source of the event.
    pub source: String,
    /// The type of the event.
    #[serde(rename = "type")]
    pub ty: String,
    /// The subject of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// The time the event occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// The content type of the data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// The schema the data adheres to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    /// The event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// The extension attributes of the event.
    #[serde(flatten)]
    pub extensions: IndexMap<String, Value>,
}

impl CloudEvent {
    /// Constructs a new event with the given source and type.
    ///
    /// A fresh identifier is generated; the time is left unset so callers in
    /// deterministic contexts can stamp it from their own clock.
    pub fn new(source: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            spec_version: default_specversion(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            ty: ty.into(),
            subject: None,
            time: None,
            datacontenttype: None,
            dataschema: None,
            data: None,
            extensions: Default::default(),
        }
    }

    /// Sets the event payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets an extension attribute.
    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Gets an extension attribute.
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }

    /// Gets a named attribute of the event.
    ///
    /// Context attributes are resolved first, then extension attributes.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "specversion" => Some(Value::String(self.spec_version.clone())),
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "type" => Some(Value::String(self.ty.clone())),
            "subject" => self.subject.clone().map(Value::String),
            "time" => self.time.map(|t| Value::String(t.to_rfc3339())),
            "datacontenttype" => self.datacontenttype.clone().map(Value::String),
            "dataschema" => self.dataschema.clone().map(Value::String),
            "data" => self.data.clone(),
            _ => self.extensions.get(name).cloned(),
        }
    }

    /// Returns `true` if every entry of the given property map matches the
    /// corresponding event attribute.
    ///
    /// The property values must already be evaluated to literals; expression
    /// evaluation is the engine's concern.
    pub fn matches(&self, with: &IndexMap<String, Value>) -> bool {
        with.iter().all(|(name, expected)| {
            self.attribute(name)
                .map(|actual| &actual == expected)
                .unwrap_or(false)
        })
    }

    /// Gets the identity carried by the `user` extension attribute.
    pub fn user(&self) -> Option<&str> {
        self.extension(USER_EXTENSION).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn extensions_flatten() {
        let event: CloudEvent = serde_json::from_value(json!({
            "specversion": "1.0",
            "id": "1",
            "source": "https://thand.io",
            "type": APPROVAL_EVENT_TYPE,
            "data": { "approved": true },
            "user": "alice@example.com",
        }))
        .expect("event should deserialize");

        assert_eq!(event.user(), Some("alice@example.com"));
        assert_eq!(event.attribute("type"), Some(json!(APPROVAL_EVENT_TYPE)));
    }

    #[test]
    fn filter_matching() {
        let event = CloudEvent::new("https://thand.io", ALERT_EVENT_TYPE)
            .with_data(json!({ "level": "critical" }));

        let mut with = IndexMap::new();
        with.insert("type".to_string(), json!(ALERT_EVENT_TYPE));
        assert!(event.matches(&with));

        with.insert("source".to_string(), json!("elsewhere"));
        assert!(!event.matches(&with));
    }

    #[test]
    fn matching_is_exhaustive_over_missing_attributes() {
        let event = CloudEvent::new("https://thand.io", FORM_EVENT_TYPE);

        let mut with = IndexMap::new();
        with.insert("subject".to_string(), json!("anything"));
        assert!(!event.matches(&with));
    }
}
