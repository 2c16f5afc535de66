// Event payload detection: when no explicit event name is given, the
// payload's shape is matched against an embedded JSON schema. The first
// `oneOf` entry whose required/properties constraints accept the document
// names the event; unknown properties disqualify a candidate.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;

const EVENT_SCHEMA_JSON: &str = include_str!("events.json");

static EVENT_SCHEMA: Lazy<SchemaEntry> = Lazy::new(|| {
    serde_json::from_str(EVENT_SCHEMA_JSON).expect("embedded event schema is valid JSON")
});

/// A minimal JSON-schema node: just the parts event matching consults.
#[derive(Debug, Clone, Default, Deserialize)]
struct SchemaEntry {
    #[serde(rename = "$ref")]
    reference: Option<String>,
    #[serde(default)]
    definitions: HashMap<String, SchemaEntry>,
    #[serde(rename = "type")]
    kind: Option<serde_json::Value>,
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    properties: HashMap<String, SchemaEntry>,
    #[serde(rename = "oneOf", default)]
    one_of: Vec<SchemaEntry>,
}

impl SchemaEntry {
    /// Follow a `#/definitions/...` reference within the root document.
    fn resolve<'a>(&'a self, root: &'a SchemaEntry) -> &'a SchemaEntry {
        match &self.reference {
            Some(reference) => reference
                .strip_prefix("#/definitions/")
                .and_then(|name| root.definitions.get(name))
                .unwrap_or(self),
            None => self,
        }
    }

    /// Whether this schema accepts the object: every required key present,
    /// no key outside the declared properties.
    fn validate(&self, root: &SchemaEntry, object: &serde_json::Map<String, serde_json::Value>) -> bool {
        if !self.one_of.is_empty() {
            return self
                .one_of
                .iter()
                .any(|entry| entry.resolve(root).validate(root, object));
        }
        if self.kind.as_ref().and_then(|k| k.as_str()) == Some("object") {
            for key in &self.required {
                if !object.contains_key(key) {
                    return false;
                }
            }
            for key in object.keys() {
                if !self.properties.contains_key(key) {
                    return false;
                }
            }
            return true;
        }
        false
    }
}

/// Infer the event name from an event payload document. Returns `None` when
/// no schema entry accepts the document.
pub fn event_name_from_payload(payload: &serde_json::Value) -> Option<String> {
    let object = payload.as_object()?;
    let root = &*EVENT_SCHEMA;

    for candidate in &root.one_of {
        if candidate.resolve(root).validate(root, object) {
            let name = candidate
                .reference
                .as_deref()?
                .strip_prefix("#/definitions/")?
                .trim_end_matches("_event");
            return Some(name.to_string());
        }
    }
    None
}

/// Read an event payload file and infer its event name.
pub fn event_name_from_file(path: &Path) -> Result<Option<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event payload {}", path.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Event payload {} is not valid JSON", path.display()))?;
    Ok(event_name_from_payload(&payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_payload() {
        let payload = json!({
            "ref": "refs/heads/main",
            "commits": [],
            "head_commit": {"id": "abc"},
            "repository": {"full_name": "o/r"},
            "pusher": {"name": "me"}
        });
        assert_eq!(event_name_from_payload(&payload).as_deref(), Some("push"));
    }

    #[test]
    fn test_pull_request_payload() {
        let payload = json!({
            "action": "opened",
            "number": 7,
            "pull_request": {"head": {}, "base": {}},
            "repository": {}
        });
        assert_eq!(
            event_name_from_payload(&payload).as_deref(),
            Some("pull_request")
        );
    }

    #[test]
    fn test_release_payload() {
        let payload = json!({
            "action": "published",
            "release": {"tag_name": "v1.0.0"}
        });
        assert_eq!(event_name_from_payload(&payload).as_deref(), Some("release"));
    }

    #[test]
    fn test_unknown_property_disqualifies() {
        // Shaped like a push event but with an undeclared key.
        let payload = json!({
            "ref": "refs/heads/main",
            "commits": [],
            "totally_unknown_key": true
        });
        assert_eq!(event_name_from_payload(&payload), None);
    }

    #[test]
    fn test_missing_required_disqualifies() {
        let payload = json!({
            "action": "opened",
            "number": 7
        });
        assert_eq!(event_name_from_payload(&payload), None);
    }

    #[test]
    fn test_non_object_payload() {
        assert_eq!(event_name_from_payload(&json!("push")), None);
        assert_eq!(event_name_from_payload(&json!(null)), None);
    }

    #[test]
    fn test_event_name_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(
            &path,
            r#"{"action": "opened", "issue": {"number": 1}, "sender": {}}"#,
        )
        .unwrap();
        assert_eq!(
            event_name_from_file(&path).unwrap().as_deref(),
            Some("issues")
        );
    }
}
