use crate::error::TreeError;
use crate::patch::{AttributeKey, PatchOp, SnapshotPatch};
use crate::registry::NodeId;
use serde_json::Value;
use std::collections::HashSet;

/// Accumulates instructions for the next patch.
///
/// Ids stay known across patches: a node created in one commit can be
/// referenced by every later one until [`PatchEncoder::reset`].
#[derive(Debug, Default)]
pub struct PatchEncoder {
    patch: SnapshotPatch,
    created: HashSet<NodeId>,
}

impl PatchEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_element(&mut self, node_type: Option<&str>, id: NodeId) {
        self.created.insert(id);
        self.patch.push(PatchOp::CreateElement {
            node_type: node_type.map(str::to_string),
            id,
        });
    }

    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        before: Option<NodeId>,
    ) -> Result<(), TreeError> {
        self.ensure_created(parent)?;
        self.ensure_created(child)?;
        if let Some(before) = before {
            self.ensure_created(before)?;
        }
        self.patch.push(PatchOp::InsertBefore {
            parent,
            child,
            before,
        });
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        self.ensure_created(parent)?;
        self.ensure_created(child)?;
        self.patch.push(PatchOp::RemoveChild { parent, child });
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        id: NodeId,
        index: usize,
        value: Value,
    ) -> Result<(), TreeError> {
        self.ensure_created(id)?;
        self.patch.push(PatchOp::SetAttribute {
            id,
            key: AttributeKey::Index(index),
            value,
        });
        Ok(())
    }

    pub fn set_attributes(&mut self, id: NodeId, values: Value) -> Result<(), TreeError> {
        self.ensure_created(id)?;
        self.patch.push(PatchOp::SetAttributes { id, values });
        Ok(())
    }

    #[cfg(feature = "dev")]
    pub fn add_snapshot(
        &mut self,
        uniq_id: &str,
        definition: &str,
        css_id: Option<i64>,
        entry_name: Option<&str>,
    ) {
        self.patch.push(PatchOp::DevAddSnapshot {
            uniq_id: uniq_id.to_string(),
            definition: definition.to_string(),
            css_id,
            entry_name: entry_name.map(str::to_string),
        });
    }

    #[cfg(feature = "dev")]
    pub fn set_snapshot_entry_name(&mut self, uniq_id: &str, entry_name: &str) {
        self.patch.push(PatchOp::DevSetSnapshotEntryName {
            uniq_id: uniq_id.to_string(),
            entry_name: entry_name.to_string(),
        });
    }

    /// Node is gone for good; later references are errors.
    pub fn forget(&mut self, id: NodeId) {
        self.created.remove(&id);
    }

    pub fn pending(&self) -> usize {
        self.patch.len()
    }

    /// Hands out the accumulated patch and starts an empty one.
    pub fn take_patch(&mut self) -> SnapshotPatch {
        std::mem::take(&mut self.patch)
    }

    pub fn reset(&mut self) {
        self.patch = SnapshotPatch::new();
        self.created.clear();
    }

    fn ensure_created(&self, id: NodeId) -> Result<(), TreeError> {
        if self.created.contains(&id) {
            Ok(())
        } else {
            Err(TreeError::NotCreated(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_instructions_in_call_order() {
        let mut encoder = PatchEncoder::new();
        encoder.create_element(Some("view"), 1);
        encoder.create_element(None, 2);
        encoder.insert_before(1, 2, None).expect("insert");
        encoder.set_attribute(2, 0, json!("hello")).expect("set");

        let patch = encoder.take_patch();
        assert_eq!(
            serde_json::to_value(&patch).expect("encode"),
            json!([0, "view", 1, 0, null, 2, 1, 1, 2, null, 3, 2, 0, "hello"])
        );
        assert_eq!(encoder.pending(), 0);
    }

    #[test]
    fn uncreated_ids_are_rejected() {
        let mut encoder = PatchEncoder::new();
        encoder.create_element(Some("view"), 1);
        assert_eq!(encoder.insert_before(1, 7, None), Err(TreeError::NotCreated(7)));
        assert_eq!(encoder.set_attributes(8, json!([])), Err(TreeError::NotCreated(8)));
        assert_eq!(encoder.pending(), 1);
    }

    #[test]
    fn created_ids_survive_take_patch() {
        let mut encoder = PatchEncoder::new();
        encoder.create_element(Some("view"), 1);
        encoder.create_element(Some("text"), 2);
        encoder.take_patch();

        encoder.insert_before(1, 2, None).expect("later commit");
        encoder.remove_child(1, 2).expect("remove");
        encoder.forget(2);
        assert_eq!(encoder.remove_child(1, 2), Err(TreeError::NotCreated(2)));

        encoder.reset();
        assert_eq!(encoder.set_attribute(1, 0, json!(1)), Err(TreeError::NotCreated(1)));
    }

    #[cfg(feature = "dev")]
    #[test]
    fn dev_instructions_use_dev_opcodes() {
        let mut encoder = PatchEncoder::new();
        encoder.add_snapshot("__snapshot_a", "{\"tag\":\"view\"}", Some(0), None);
        encoder.set_snapshot_entry_name("__snapshot_a", "main");
        let flat = encoder.take_patch().to_flat();
        assert_eq!(flat[0], json!(50));
        assert_eq!(flat[5], json!(52));
    }
}
