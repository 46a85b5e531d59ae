//! Per-type snapshot definitions: which element a node type renders and what
//! each of its dynamic parts means.

use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const RAW_TEXT_TAG: &str = "raw-text";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DynamicPart {
    Attribute { key: String },
    Style,
    Text,
    /// Object of props applied key by key.
    Spread,
    /// Background ref; rendered as a `react-ref-{id}-{index}` selector attribute.
    Ref,
    MainThreadRef,
    MainThreadEvent { name: String },
    Gesture,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDefinition {
    pub tag: String,
    #[serde(default)]
    pub parts: Vec<DynamicPart>,
    #[serde(default, rename = "cssId", skip_serializing_if = "Option::is_none")]
    pub css_id: Option<i64>,
    #[serde(default, rename = "entryName", skip_serializing_if = "Option::is_none")]
    pub entry_name: Option<String>,
}

impl SnapshotDefinition {
    pub fn new(tag: impl Into<String>, parts: Vec<DynamicPart>) -> Self {
        Self {
            tag: tag.into(),
            parts,
            css_id: None,
            entry_name: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotDefinitions {
    definitions: HashMap<String, SnapshotDefinition>,
}

impl SnapshotDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `{ "<type>": { "tag": ..., "parts": [...] }, ... }`.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let definitions = serde_json::from_str(text)?;
        Ok(Self { definitions })
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let text = fs::read_to_string(path).map_err(|err| HostError::Definitions {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_json_str(&text).map_err(|err| HostError::Definitions {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn insert(
        &mut self,
        node_type: impl Into<String>,
        definition: SnapshotDefinition,
    ) -> Option<SnapshotDefinition> {
        self.definitions.insert(node_type.into(), definition)
    }

    pub fn get(&self, node_type: &str) -> Option<&SnapshotDefinition> {
        self.definitions.get(node_type)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.definitions.contains_key(node_type)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Element tag for a node type. Untyped nodes are raw text; unknown types
    /// render as an element named after the type.
    pub fn tag_for(&self, node_type: Option<&str>) -> String {
        match node_type {
            None => RAW_TEXT_TAG.to_string(),
            Some(node_type) => self
                .get(node_type)
                .map(|definition| definition.tag.clone())
                .unwrap_or_else(|| node_type.to_string()),
        }
    }

    pub fn part_for(&self, node_type: Option<&str>, index: usize) -> DynamicPart {
        let fallback = || DynamicPart::Attribute {
            key: index.to_string(),
        };
        match node_type {
            None if index == 0 => DynamicPart::Text,
            None => fallback(),
            Some(node_type) => self
                .get(node_type)
                .and_then(|definition| definition.parts.get(index).cloned())
                .unwrap_or_else(fallback),
        }
    }

    /// Registers a definition shipped with a hot update. An existing
    /// definition under the same key is kept. Returns whether one was added.
    #[cfg(feature = "dev")]
    pub fn add_from_source(
        &mut self,
        uniq_id: &str,
        source: &str,
        css_id: Option<i64>,
        entry_name: Option<&str>,
    ) -> Result<bool, crate::error::ApplyError> {
        let key = match entry_name {
            Some(entry_name) => format!("{entry_name}:{uniq_id}"),
            None => uniq_id.to_string(),
        };
        if self.contains(&key) {
            log::debug!("snapshot '{key}' already defined; keeping existing definition");
            return Ok(false);
        }

        let mut definition: SnapshotDefinition =
            serde_json::from_str(source).map_err(|err| crate::error::ApplyError::DevEvaluation {
                uniq_id: uniq_id.to_string(),
                message: err.to_string(),
            })?;
        definition.css_id = css_id;
        definition.entry_name = entry_name.map(str::to_string);
        self.insert(key, definition);
        Ok(true)
    }

    #[cfg(feature = "dev")]
    pub fn set_entry_name(&mut self, uniq_id: &str, entry_name: &str) -> bool {
        match self.definitions.get_mut(uniq_id) {
            Some(definition) => {
                definition.entry_name = Some(entry_name.to_string());
                true
            }
            None => {
                log::warn!("cannot set entry name of unknown snapshot '{uniq_id}'");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotDefinitions {
        SnapshotDefinitions::from_json_str(
            r#"{
                "__snapshot_card": {
                    "tag": "view",
                    "parts": [
                        { "kind": "attribute", "key": "id" },
                        { "kind": "style" },
                        { "kind": "main_thread_event", "name": "bindtap" },
                        { "kind": "gesture" }
                    ]
                }
            }"#,
        )
        .expect("parse definitions")
    }

    #[test]
    fn parses_tagged_parts() {
        let definitions = sample();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions.tag_for(Some("__snapshot_card")), "view");
        assert_eq!(
            definitions.part_for(Some("__snapshot_card"), 0),
            DynamicPart::Attribute { key: "id".to_string() }
        );
        assert_eq!(
            definitions.part_for(Some("__snapshot_card"), 2),
            DynamicPart::MainThreadEvent {
                name: "bindtap".to_string()
            }
        );
    }

    #[test]
    fn unknown_types_and_parts_fall_back() {
        let definitions = sample();
        assert_eq!(definitions.tag_for(Some("image")), "image");
        assert_eq!(
            definitions.part_for(Some("image"), 3),
            DynamicPart::Attribute { key: "3".to_string() }
        );
        assert_eq!(
            definitions.part_for(Some("__snapshot_card"), 9),
            DynamicPart::Attribute { key: "9".to_string() }
        );
    }

    #[test]
    fn untyped_nodes_are_raw_text() {
        let definitions = SnapshotDefinitions::new();
        assert_eq!(definitions.tag_for(None), RAW_TEXT_TAG);
        assert_eq!(definitions.part_for(None, 0), DynamicPart::Text);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SnapshotDefinitions::load(Path::new("/nonexistent/definitions.json"))
            .expect_err("missing file");
        assert!(err.to_string().contains("/nonexistent/definitions.json"));
    }

    #[cfg(feature = "dev")]
    #[test]
    fn add_from_source_keeps_existing_definition() {
        let mut definitions = SnapshotDefinitions::new();
        assert!(definitions
            .add_from_source("__snapshot_a", r#"{"tag":"view"}"#, Some(3), Some("main"))
            .expect("first add"));
        assert!(!definitions
            .add_from_source("__snapshot_a", r#"{"tag":"text"}"#, None, Some("main"))
            .expect("second add"));

        let definition = definitions.get("main:__snapshot_a").expect("keyed by entry");
        assert_eq!(definition.tag, "view");
        assert_eq!(definition.css_id, Some(3));

        assert!(definitions
            .add_from_source("__snapshot_b", "not json", None, None)
            .is_err());
        assert!(definitions.set_entry_name("main:__snapshot_a", "other"));
        assert!(!definitions.set_entry_name("__snapshot_missing", "other"));
    }
}
