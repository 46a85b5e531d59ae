use std::collections::BTreeMap;

/// Small integer handle, unique per side for one tree generation.
pub type NodeId = u32;

/// Nodes keyed by [`NodeId`].
///
/// Ids come from the other side and may be arbitrarily large, so storage is
/// sparse. Lookups of unknown ids return `None`; deciding whether that is an
/// error is left to the caller.
#[derive(Debug)]
pub struct NodeRegistry<N> {
    nodes: BTreeMap<NodeId, N>,
    next_id: NodeId,
}

impl<N> Default for NodeRegistry<N> {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<N> NodeRegistry<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Stores `node` under `id`, returning whatever was registered there before.
    pub fn register(&mut self, id: NodeId, node: N) -> Option<N> {
        // Ids handed out by the other side must never be minted again here.
        if id >= self.next_id {
            self.next_id = id.wrapping_add(1);
        }
        self.nodes.insert(id, node)
    }

    pub fn unregister(&mut self, id: NodeId) -> Option<N> {
        self.nodes.remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&N> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut N> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Drops every node and restarts id assignment for a new tree generation.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.next_id = 1;
    }
}
