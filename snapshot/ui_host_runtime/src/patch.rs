//! Snapshot patch wire format.
//!
//! A patch is a flat JSON array `[op, operands..., op, operands...]`. Each
//! opcode has a fixed operand count, so the buffer is decoded in one pass and
//! a malformed buffer is rejected before anything is applied.

use crate::error::PatchDecodeError;
use crate::registry::NodeId;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Reserved attribute key replacing the whole slot record of a node.
pub const VALUES_KEY: &str = "values";

/// Highest dynamic-part index a `SetAttribute` may address. Slot records are
/// dense, so anything beyond this is treated as a malformed buffer.
pub const MAX_SLOT_INDEX: usize = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOperation {
    CreateElement = 0,
    InsertBefore = 1,
    RemoveChild = 2,
    SetAttribute = 3,
    SetAttributes = 4,
    DevAddSnapshot = 50,
    DevSetSnapshotEntryName = 52,
}

impl SnapshotOperation {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::CreateElement),
            1 => Some(Self::InsertBefore),
            2 => Some(Self::RemoveChild),
            3 => Some(Self::SetAttribute),
            4 => Some(Self::SetAttributes),
            50 => Some(Self::DevAddSnapshot),
            52 => Some(Self::DevSetSnapshotEntryName),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateElement => "CreateElement",
            Self::InsertBefore => "InsertBefore",
            Self::RemoveChild => "RemoveChild",
            Self::SetAttribute => "SetAttribute",
            Self::SetAttributes => "SetAttributes",
            Self::DevAddSnapshot => "DevAddSnapshot",
            Self::DevSetSnapshotEntryName => "DevSetSnapshotEntryName",
        }
    }

    pub fn is_dev_only(self) -> bool {
        matches!(self, Self::DevAddSnapshot | Self::DevSetSnapshotEntryName)
    }
}

/// Target of an attribute instruction: a dynamic part index, or the reserved
/// `"values"` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKey {
    Index(usize),
    Values,
}

impl AttributeKey {
    fn to_value(self) -> Value {
        match self {
            AttributeKey::Index(index) => json!(index),
            AttributeKey::Values => Value::String(VALUES_KEY.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    CreateElement {
        node_type: Option<String>,
        id: NodeId,
    },
    InsertBefore {
        parent: NodeId,
        child: NodeId,
        before: Option<NodeId>,
    },
    RemoveChild {
        parent: NodeId,
        child: NodeId,
    },
    SetAttribute {
        id: NodeId,
        key: AttributeKey,
        value: Value,
    },
    SetAttributes {
        id: NodeId,
        values: Value,
    },
    DevAddSnapshot {
        uniq_id: String,
        definition: String,
        css_id: Option<i64>,
        entry_name: Option<String>,
    },
    DevSetSnapshotEntryName {
        uniq_id: String,
        entry_name: String,
    },
}

impl PatchOp {
    pub fn operation(&self) -> SnapshotOperation {
        match self {
            PatchOp::CreateElement { .. } => SnapshotOperation::CreateElement,
            PatchOp::InsertBefore { .. } => SnapshotOperation::InsertBefore,
            PatchOp::RemoveChild { .. } => SnapshotOperation::RemoveChild,
            PatchOp::SetAttribute { .. } => SnapshotOperation::SetAttribute,
            PatchOp::SetAttributes { .. } => SnapshotOperation::SetAttributes,
            PatchOp::DevAddSnapshot { .. } => SnapshotOperation::DevAddSnapshot,
            PatchOp::DevSetSnapshotEntryName { .. } => SnapshotOperation::DevSetSnapshotEntryName,
        }
    }

    fn write_flat(&self, out: &mut Vec<Value>) {
        out.push(json!(self.operation().code()));
        match self {
            PatchOp::CreateElement { node_type, id } => {
                out.push(json!(node_type));
                out.push(json!(id));
            }
            PatchOp::InsertBefore {
                parent,
                child,
                before,
            } => {
                out.push(json!(parent));
                out.push(json!(child));
                out.push(json!(before));
            }
            PatchOp::RemoveChild { parent, child } => {
                out.push(json!(parent));
                out.push(json!(child));
            }
            PatchOp::SetAttribute { id, key, value } => {
                out.push(json!(id));
                out.push(key.to_value());
                out.push(value.clone());
            }
            PatchOp::SetAttributes { id, values } => {
                out.push(json!(id));
                out.push(values.clone());
            }
            PatchOp::DevAddSnapshot {
                uniq_id,
                definition,
                css_id,
                entry_name,
            } => {
                out.push(json!(uniq_id));
                out.push(json!(definition));
                out.push(json!(css_id));
                out.push(json!(entry_name));
            }
            PatchOp::DevSetSnapshotEntryName {
                uniq_id,
                entry_name,
            } => {
                out.push(json!(uniq_id));
                out.push(json!(entry_name));
            }
        }
    }
}

/// Ordered instruction list for one batch of tree mutations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPatch {
    ops: Vec<PatchOp>,
}

impl SnapshotPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PatchOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn to_flat(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.ops.len() * 4);
        for op in &self.ops {
            op.write_flat(&mut out);
        }
        out
    }

    pub fn from_flat(items: &[Value]) -> Result<Self, PatchDecodeError> {
        let mut cursor = FlatCursor { items, pos: 0 };
        let mut ops = Vec::new();

        while cursor.pos < items.len() {
            let offset = cursor.pos;
            let raw = &items[offset];
            cursor.pos += 1;

            let operation = raw
                .as_u64()
                .and_then(SnapshotOperation::from_code)
                .ok_or_else(|| PatchDecodeError::UnknownOpcode {
                    offset,
                    opcode: raw.to_string(),
                })?;
            let op = operation.name();

            let decoded = match operation {
                SnapshotOperation::CreateElement => PatchOp::CreateElement {
                    node_type: cursor.optional_string(op, "type")?,
                    id: cursor.node_id(op, "id")?,
                },
                SnapshotOperation::InsertBefore => PatchOp::InsertBefore {
                    parent: cursor.node_id(op, "parentId")?,
                    child: cursor.node_id(op, "childId")?,
                    before: cursor.optional_node_id(op, "beforeId")?,
                },
                SnapshotOperation::RemoveChild => PatchOp::RemoveChild {
                    parent: cursor.node_id(op, "parentId")?,
                    child: cursor.node_id(op, "childId")?,
                },
                SnapshotOperation::SetAttribute => PatchOp::SetAttribute {
                    id: cursor.node_id(op, "id")?,
                    key: cursor.attribute_key(op)?,
                    value: cursor.next(op, "value")?.clone(),
                },
                SnapshotOperation::SetAttributes => PatchOp::SetAttributes {
                    id: cursor.node_id(op, "id")?,
                    values: cursor.next(op, "values")?.clone(),
                },
                SnapshotOperation::DevAddSnapshot => PatchOp::DevAddSnapshot {
                    uniq_id: cursor.string(op, "uniqId")?,
                    definition: cursor.string(op, "definition")?,
                    css_id: cursor.optional_i64(op, "cssId")?,
                    entry_name: cursor.optional_string(op, "entryName")?,
                },
                SnapshotOperation::DevSetSnapshotEntryName => PatchOp::DevSetSnapshotEntryName {
                    uniq_id: cursor.string(op, "uniqId")?,
                    entry_name: cursor.string(op, "entryName")?,
                },
            };
            ops.push(decoded);
        }

        Ok(Self { ops })
    }
}

impl From<Vec<PatchOp>> for SnapshotPatch {
    fn from(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }
}

impl IntoIterator for SnapshotPatch {
    type Item = PatchOp;
    type IntoIter = std::vec::IntoIter<PatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl Serialize for SnapshotPatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.to_flat())
    }
}

impl<'de> Deserialize<'de> for SnapshotPatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<Value>::deserialize(deserializer)?;
        SnapshotPatch::from_flat(&items).map_err(de::Error::custom)
    }
}

struct FlatCursor<'a> {
    items: &'a [Value],
    pos: usize,
}

impl<'a> FlatCursor<'a> {
    fn next(
        &mut self,
        op: &'static str,
        operand: &'static str,
    ) -> Result<&'a Value, PatchDecodeError> {
        let value = self
            .items
            .get(self.pos)
            .ok_or(PatchDecodeError::MissingOperand {
                offset: self.pos,
                op,
                operand,
            })?;
        self.pos += 1;
        Ok(value)
    }

    fn invalid(
        &self,
        op: &'static str,
        operand: &'static str,
        expected: &'static str,
    ) -> PatchDecodeError {
        PatchDecodeError::InvalidOperand {
            offset: self.pos - 1,
            op,
            operand,
            expected,
        }
    }

    fn node_id(
        &mut self,
        op: &'static str,
        operand: &'static str,
    ) -> Result<NodeId, PatchDecodeError> {
        let value = self.next(op, operand)?;
        value
            .as_u64()
            .and_then(|raw| NodeId::try_from(raw).ok())
            .ok_or_else(|| self.invalid(op, operand, "a non-negative node id"))
    }

    fn optional_node_id(
        &mut self,
        op: &'static str,
        operand: &'static str,
    ) -> Result<Option<NodeId>, PatchDecodeError> {
        let value = self.next(op, operand)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_u64()
            .and_then(|raw| NodeId::try_from(raw).ok())
            .map(Some)
            .ok_or_else(|| self.invalid(op, operand, "a node id or null"))
    }

    fn string(
        &mut self,
        op: &'static str,
        operand: &'static str,
    ) -> Result<String, PatchDecodeError> {
        let value = self.next(op, operand)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(op, operand, "a string"))
    }

    fn optional_string(
        &mut self,
        op: &'static str,
        operand: &'static str,
    ) -> Result<Option<String>, PatchDecodeError> {
        match self.next(op, operand)? {
            Value::Null => Ok(None),
            Value::String(text) => Ok(Some(text.clone())),
            _ => Err(self.invalid(op, operand, "a string or null")),
        }
    }

    fn optional_i64(
        &mut self,
        op: &'static str,
        operand: &'static str,
    ) -> Result<Option<i64>, PatchDecodeError> {
        let value = self.next(op, operand)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_i64()
            .map(Some)
            .ok_or_else(|| self.invalid(op, operand, "an integer or null"))
    }

    fn attribute_key(&mut self, op: &'static str) -> Result<AttributeKey, PatchDecodeError> {
        let value = self.next(op, "slotIndex")?;
        match value {
            Value::String(key) if key == VALUES_KEY => Ok(AttributeKey::Values),
            _ => value
                .as_u64()
                .and_then(|raw| usize::try_from(raw).ok())
                .filter(|index| *index <= MAX_SLOT_INDEX)
                .map(AttributeKey::Index)
                .ok_or_else(|| self.invalid(op, "slotIndex", "a slot index or \"values\"")),
        }
    }
}

/// `[id, initValue, type]`: a background-minted main-thread value the main
/// side has not seen yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitValuePatch(pub i64, pub Value, #[serde(default)] pub Option<String>);

impl InitValuePatch {
    pub fn id(&self) -> i64 {
        self.0
    }

    pub fn init_value(&self) -> &Value {
        &self.1
    }

    pub fn type_name(&self) -> Option<&str> {
        self.2.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPatchEntry {
    pub snapshot_patch: SnapshotPatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchList {
    #[serde(default)]
    pub patch_list: Vec<SnapshotPatchEntry>,
    #[serde(default, rename = "workletRefInitValuePatch")]
    pub worklet_ref_init_values: Vec<InitValuePatch>,
    #[serde(default)]
    pub flush_options: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOptions {
    #[serde(default)]
    pub reload_version: u64,
    #[serde(default)]
    pub is_hydration: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_task_id: Option<u64>,
}
