/// `scripting/record.rs` — script records and the published script index
///
/// Both are stored in the content store as JSON payloads and decoded with serde.
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{error::LoadError, trigger::LifecycleEvent};
use crate::content::ContentData;

/// One user script as published in the content store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, rename = "scriptType", skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "script")]
    pub source: String,
}

impl ScriptRecord {
    pub const DATA_TYPE: &'static str = "LifecycleScript";

    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event: None,
            type_filter: None,
            description: None,
            source: source.into(),
        }
    }

    pub fn with_event(mut self, event: LifecycleEvent) -> Self {
        self.event = Some(event.as_str().to_string());
        self
    }

    pub fn with_type_filter(mut self, filter: impl Into<String>) -> Self {
        self.type_filter = Some(filter.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The stage this record is attached to, if `event` names a known one.
    pub fn lifecycle_event(&self) -> Option<LifecycleEvent> {
        self.event.as_deref()?.parse().ok()
    }

    pub fn to_content(&self) -> ContentData {
        let mut data = json!({ "id": self.id, "script": self.source });
        if let Some(event) = &self.event {
            data["event"] = json!(event);
        }
        if let Some(filter) = &self.type_filter {
            data["scriptType"] = json!(filter);
        }
        if let Some(description) = &self.description {
            data["description"] = json!(description);
        }
        ContentData::new(Self::DATA_TYPE, data)
    }

    pub fn from_content(external_id: &str, content: &ContentData) -> Result<Self, LoadError> {
        serde_json::from_value(content.data.clone()).map_err(|source| LoadError::Malformed {
            id: external_id.to_string(),
            source,
        })
    }
}

/// Ordered list of the external ids of all active scripts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScriptIndex {
    #[serde(default)]
    pub scripts: Vec<String>,
}

impl ScriptIndex {
    pub const DATA_TYPE: &'static str = "ScriptList";

    pub fn new<I, S>(scripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scripts: scripts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn to_content(&self) -> ContentData {
        ContentData::new(Self::DATA_TYPE, json!({ "scripts": self.scripts }))
    }

    pub fn from_content(external_id: &str, content: &ContentData) -> Result<Self, LoadError> {
        serde_json::from_value(content.data.clone()).map_err(|source| LoadError::Malformed {
            id: external_id.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stored_field_names() {
        let content = ContentData::new(
            ScriptRecord::DATA_TYPE,
            json!({
                "id": "set-partition",
                "event": "PRE_STORE",
                "scriptType": "news.*",
                "script": "x = 1",
            }),
        );
        let record = ScriptRecord::from_content("lifecycle.script.set-partition", &content).unwrap();
        assert_eq!(record.id, "set-partition");
        assert_eq!(record.type_filter.as_deref(), Some("news.*"));
        assert_eq!(record.source, "x = 1");
        assert_eq!(record.lifecycle_event(), Some(LifecycleEvent::PreStore));
        assert_eq!(record.description, None);
    }

    #[test]
    fn content_payload_decodes_back_to_the_record() {
        let record = ScriptRecord::new("a", "return")
            .with_event(LifecycleEvent::PostDelete)
            .with_type_filter("image")
            .with_description("cleanup");
        let decoded = ScriptRecord::from_content("a", &record.to_content()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn unknown_event_is_not_a_lifecycle_event() {
        let mut record = ScriptRecord::new("a", "");
        record.event = Some("ON_PUBLISH".into());
        assert_eq!(record.lifecycle_event(), None);
    }

    #[test]
    fn record_without_source_is_malformed() {
        let content = ContentData::new(ScriptRecord::DATA_TYPE, json!({ "id": "a" }));
        let err = ScriptRecord::from_content("ext.a", &content).unwrap_err();
        assert!(matches!(err, LoadError::Malformed { ref id, .. } if id == "ext.a"));
    }

    #[test]
    fn index_without_scripts_is_empty() {
        let content = ContentData::new(ScriptIndex::DATA_TYPE, json!({}));
        assert_eq!(ScriptIndex::from_content("idx", &content).unwrap(), ScriptIndex::default());
        let index = ScriptIndex::new(["a", "b", "a"]);
        assert_eq!(index.scripts, vec!["a", "b", "a"]);
    }
}
