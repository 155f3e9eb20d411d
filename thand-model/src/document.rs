//! Implementation of the workflow document envelope.

use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de;
use serde::ser::SerializeMap;
use serde_json::Value;

use crate::TaskDefinition;

/// Represents a parsed workflow document.
///
/// A document is an envelope of metadata, an optional workflow-level input
/// block, an optional workflow-level output block, and the ordered list of
/// root tasks under `do`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// The document metadata.
    pub document: DocumentMetadata,
    /// The workflow-level input schema and transform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputBlock>,
    /// The workflow-level output schema and transform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputBlock>,
    /// The root task list.
    #[serde(rename = "do")]
    pub do_: TaskList,
}

impl WorkflowDocument {
    /// Gets the name of the workflow.
    pub fn name(&self) -> &str {
        &self.document.name
    }
}

/// Represents the metadata of a workflow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// The DSL version the document was authored against.
    #[serde(default)]
    pub dsl: String,
    /// The namespace of the workflow.
    #[serde(default)]
    pub namespace: String,
    /// The name of the workflow.
    pub name: String,
    /// The version of the workflow.
    #[serde(default)]
    pub version: String,
}

/// Represents an `input` block: an optional schema and an optional `from`
/// transform applied to the raw input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputBlock {
    /// The schema the raw input must validate against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    /// The transform producing the effective input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
}

/// Represents an `output` block: an optional schema and an optional `as`
/// transform applied to the raw output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputBlock {
    /// The schema the transformed output must validate against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    /// The transform producing the effective output.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

/// Represents an `export` block: an optional schema and an optional `as`
/// transform whose result is merged into the instance context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportBlock {
    /// The schema the exported value must validate against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    /// The transform producing the exported value.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

/// Represents a schema definition attached to an input, output, or export
/// block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// The format of the schema document.
    ///
    /// Defaults to JSON schema when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// The inline schema document.
    pub document: Value,
}

/// Represents a flow target: either one of the reserved endpoints or the key
/// of a task within the current task list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowTarget {
    /// Continue with the next task in document order.
    Continue,
    /// Exit the current task list.
    Exit,
    /// End the workflow.
    End,
    /// Jump to the task with the given key.
    Task(String),
}

impl FlowTarget {
    /// Gets the task key if the target names a task.
    pub fn as_task(&self) -> Option<&str> {
        match self {
            Self::Task(key) => Some(key),
            Self::Continue | Self::Exit | Self::End => None,
        }
    }

    /// Gets the string form of the target.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Continue => "continue",
            Self::Exit => "exit",
            Self::End => "end",
            Self::Task(key) => key,
        }
    }
}

impl fmt::Display for FlowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for FlowTarget {
    fn from(s: &str) -> Self {
        match s {
            "continue" => Self::Continue,
            "exit" => Self::Exit,
            "end" => Self::End,
            _ => Self::Task(s.to_string()),
        }
    }
}

impl Serialize for FlowTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FlowTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Represents a named item within an ordered sequence.
///
/// The document dialect encodes ordered, named collections (task lists,
/// switch cases) as sequences of single-entry maps; this type is one such
/// entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Named<T> {
    /// The name of the item.
    pub name: String,
    /// The item itself.
    pub item: T,
}

impl<T: Serialize> Serialize for Named<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.item)?;
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Named<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut entries = IndexMap::<String, T>::deserialize(deserializer)?;
        if entries.len() != 1 {
            return Err(de::Error::custom(format!(
                "expected a map with exactly one entry, found {len} entries",
                len = entries.len()
            )));
        }

        let (name, item) = entries.swap_remove_index(0).expect("map has one entry");
        Ok(Self { name, item })
    }
}

/// Represents an ordered list of named tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskList(pub Vec<Named<TaskDefinition>>);

impl TaskList {
    /// Gets the number of tasks in the list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the list contains no tasks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gets the task at the given index.
    pub fn get(&self, index: usize) -> Option<&Named<TaskDefinition>> {
        self.0.get(index)
    }

    /// Gets the index of the task with the given key.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.0.iter().position(|t| t.name == key)
    }

    /// Iterates the tasks in document order.
    pub fn iter(&self) -> impl Iterator<Item = &Named<TaskDefinition>> {
        self.0.iter()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flow_target_round_trips() {
        for (s, target) in [
            ("continue", FlowTarget::Continue),
            ("exit", FlowTarget::Exit),
            ("end", FlowTarget::End),
            ("approvals", FlowTarget::Task("approvals".to_string())),
        ] {
            let parsed: FlowTarget = serde_json::from_value(Value::String(s.to_string()))
                .expect("target should deserialize");
            assert_eq!(parsed, target);
            assert_eq!(
                serde_json::to_value(&parsed).expect("target should serialize"),
                Value::String(s.to_string())
            );
        }
    }

    #[test]
    fn named_rejects_multiple_entries() {
        let e = serde_json::from_str::<Named<Value>>(r#"{"a": 1, "b": 2}"#)
            .expect_err("should reject a two-entry map");
        assert!(e.to_string().contains("exactly one entry"));
    }

    #[test]
    fn task_list_lookup() {
        let doc: WorkflowDocument = serde_yaml_ng::from_str(
            r#"
document:
  dsl: "1.0.0"
  namespace: test
  name: lookup
  version: "0.1.0"
do:
  - first:
      set:
        x: 1
  - second:
      set:
        y: 2
"#,
        )
        .expect("document should parse");

        assert_eq!(doc.name(), "lookup");
        assert_eq!(doc.do_.len(), 2);
        assert_eq!(doc.do_.position("second"), Some(1));
        assert_eq!(doc.do_.position("missing"), None);
    }
}
