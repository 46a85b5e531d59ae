use crate::registry::NodeId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A malformed instruction buffer. The buffer is rejected as a whole.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchDecodeError {
    #[error("unknown snapshot opcode {opcode} at offset {offset}")]
    UnknownOpcode { offset: usize, opcode: String },

    #[error("{op} at offset {offset} is missing operand '{operand}'")]
    MissingOperand {
        offset: usize,
        op: &'static str,
        operand: &'static str,
    },

    #[error("{op} at offset {offset} has invalid operand '{operand}': expected {expected}")]
    InvalidOperand {
        offset: usize,
        op: &'static str,
        operand: &'static str,
        expected: &'static str,
    },
}

/// Misuse of the background tree by the tree-diff producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("node {0} is not registered")]
    NodeNotFound(NodeId),

    #[error("node {0} is referenced before it was created")]
    NotCreated(NodeId),

    #[error("node {0} cannot be inserted into itself")]
    SelfInsertion(NodeId),

    #[error("inserting node {child} under node {parent} would create a cycle")]
    WouldCycle { parent: NodeId, child: NodeId },

    #[error("node {child} is not a child of node {parent}")]
    NotAChild { parent: NodeId, child: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefError {
    #[error("MainThreadRef: main-thread:ref must be of type MainThreadRef or main-thread function.")]
    InvalidMainThreadRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadAccessError {
    #[error("{type_name}: value cannot be accessed on the background thread.")]
    Get { type_name: String },

    #[error("{type_name}: value cannot be set on the background thread.")]
    Set { type_name: String },
}

/// Failures that escape patch application. Dangling ids never end up here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Ref(#[from] RefError),

    #[error("ui backend error: {0}")]
    Backend(String),

    #[cfg(feature = "dev")]
    #[error("failed to evaluate snapshot definition '{uniq_id}': {message}")]
    DevEvaluation { uniq_id: String, message: String },
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to load snapshot definitions from {path}: {message}")]
    Definitions { path: PathBuf, message: String },

    #[error("outbound queue closed")]
    QueueClosed,
}
