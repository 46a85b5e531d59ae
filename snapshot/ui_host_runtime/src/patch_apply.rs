use crate::backend::UiBackend;
use crate::error::ApplyError;
use crate::main_tree::MainTree;
use crate::patch::{
    AttributeKey, PatchList, PatchOp, PatchOptions, SnapshotOperation, SnapshotPatch,
};
use crate::protocol::{BackgroundEnvelope, MainEnvelope};
use crate::registry::NodeId;

/// An instruction skipped because it named nodes the main side does not have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextNotFound {
    pub op: SnapshotOperation,
    pub ids: Vec<NodeId>,
}

impl ContextNotFound {
    pub fn to_envelope(&self) -> MainEnvelope {
        MainEnvelope::ContextNotFound {
            op: self.op.name().to_string(),
            ids: self.ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub applied: usize,
    /// Dev-only instructions in a build without the `dev` feature.
    pub ignored: usize,
    pub missing: Vec<ContextNotFound>,
}

/// Replays `patch` against `tree` in order. Dangling ids skip their
/// instruction and are reported in the outcome; ref and backend failures
/// abort the pass.
pub fn apply_snapshot_patch<B: UiBackend>(
    tree: &mut MainTree<B>,
    patch: &SnapshotPatch,
) -> Result<PatchOutcome, ApplyError> {
    let mut outcome = PatchOutcome::default();

    for op in patch.ops() {
        let required = match op {
            PatchOp::InsertBefore { parent, child, .. }
            | PatchOp::RemoveChild { parent, child } => vec![*parent, *child],
            PatchOp::SetAttribute { id, .. } | PatchOp::SetAttributes { id, .. } => vec![*id],
            _ => Vec::new(),
        };
        let missing: Vec<NodeId> = required.into_iter().filter(|id| !tree.contains(*id)).collect();
        if !missing.is_empty() {
            log::warn!(
                "{}: node(s) {missing:?} not found; instruction skipped",
                op.operation().name()
            );
            outcome.missing.push(ContextNotFound {
                op: op.operation(),
                ids: missing,
            });
            continue;
        }

        match op {
            PatchOp::CreateElement { node_type, id } => tree.create(node_type.as_deref(), *id),
            PatchOp::InsertBefore {
                parent,
                child,
                before,
            } => {
                tree.insert_before(*parent, *child, *before)?;
            }
            PatchOp::RemoveChild { parent, child } => {
                tree.remove_child(*parent, *child)?;
            }
            PatchOp::SetAttribute { id, key, value } => {
                tree.set_attribute(*id, *key, value.clone())?
            }
            PatchOp::SetAttributes { id, values } => {
                tree.set_attribute(*id, AttributeKey::Values, values.clone())?
            }
            PatchOp::DevAddSnapshot { .. } | PatchOp::DevSetSnapshotEntryName { .. } => {
                if !apply_dev_op(tree, op)? {
                    outcome.ignored += 1;
                    continue;
                }
            }
        }
        outcome.applied += 1;
    }

    Ok(outcome)
}

#[cfg(feature = "dev")]
fn apply_dev_op<B: UiBackend>(tree: &mut MainTree<B>, op: &PatchOp) -> Result<bool, ApplyError> {
    match op {
        PatchOp::DevAddSnapshot {
            uniq_id,
            definition,
            css_id,
            entry_name,
        } => {
            tree.definitions_mut()
                .add_from_source(uniq_id, definition, *css_id, entry_name.as_deref())?;
        }
        PatchOp::DevSetSnapshotEntryName {
            uniq_id,
            entry_name,
        } => {
            tree.definitions_mut().set_entry_name(uniq_id, entry_name);
        }
        _ => {}
    }
    Ok(true)
}

#[cfg(not(feature = "dev"))]
fn apply_dev_op<B: UiBackend>(_tree: &mut MainTree<B>, op: &PatchOp) -> Result<bool, ApplyError> {
    log::debug!("ignoring dev-only {} instruction", op.operation().name());
    Ok(false)
}

/// Main-side endpoint for everything the background side sends.
pub struct MainThreadContext<B: UiBackend> {
    tree: MainTree<B>,
    reload_version: u64,
    hydrating: bool,
}

impl<B: UiBackend> MainThreadContext<B> {
    pub fn new(tree: MainTree<B>) -> Self {
        Self {
            tree,
            reload_version: 0,
            hydrating: false,
        }
    }

    pub fn tree(&self) -> &MainTree<B> {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut MainTree<B> {
        &mut self.tree
    }

    pub fn reload_version(&self) -> u64 {
        self.reload_version
    }

    /// True only while a hydration patch list is being applied.
    pub fn is_hydrating(&self) -> bool {
        self.hydrating
    }

    pub fn handle_envelope(
        &mut self,
        envelope: BackgroundEnvelope,
    ) -> Result<Vec<MainEnvelope>, ApplyError> {
        match envelope {
            BackgroundEnvelope::UpdateMainThread { data, options } => {
                self.update_main_thread(data, options)
            }
            BackgroundEnvelope::ReleaseMainThreadValue { id } => {
                if !self.tree.values_mut().release(id) {
                    log::debug!("release of unknown main-thread value {id}");
                }
                Ok(Vec::new())
            }
            BackgroundEnvelope::Reload { reload_version } => {
                if reload_version < self.reload_version {
                    log::debug!(
                        "ignoring reload to version {reload_version}; already at {}",
                        self.reload_version
                    );
                    return Ok(Vec::new());
                }
                self.tree.reset()?;
                self.reload_version = reload_version;
                log::info!("main tree reset for reload version {reload_version}");
                Ok(Vec::new())
            }
        }
    }

    /// Applies one commit: init values first, then every patch in order,
    /// then the queued worklet refs.
    pub fn update_main_thread(
        &mut self,
        data: PatchList,
        options: PatchOptions,
    ) -> Result<Vec<MainEnvelope>, ApplyError> {
        if options.reload_version < self.reload_version {
            log::debug!(
                "dropping patch list for reload version {} (current {})",
                options.reload_version,
                self.reload_version
            );
            return Ok(Vec::new());
        }

        self.hydrating = options.is_hydration;
        let result = self.apply_patch_list(&data);
        self.hydrating = false;
        let mut replies = result?;

        if options.is_hydration {
            self.tree.values_mut().clear_first_screen();
        }
        if let Some(commit_task_id) = options.commit_task_id {
            replies.push(MainEnvelope::Committed { commit_task_id });
        }
        Ok(replies)
    }

    fn apply_patch_list(&mut self, data: &PatchList) -> Result<Vec<MainEnvelope>, ApplyError> {
        self.tree
            .values_mut()
            .apply_init_value_changes(&data.worklet_ref_init_values);

        let mut replies = Vec::new();
        for entry in &data.patch_list {
            let outcome = apply_snapshot_patch(&mut self.tree, &entry.snapshot_patch)?;
            log::debug!(
                "patch {:?}: applied {}, ignored {}, missing {}",
                entry.id,
                outcome.applied,
                outcome.ignored,
                outcome.missing.len()
            );
            replies.extend(outcome.missing.iter().map(ContextNotFound::to_envelope));
        }

        let attached = self.tree.apply_ref_queue();
        if attached > 0 {
            log::debug!("attached {attached} worklet ref(s)");
        }
        Ok(replies)
    }
}
