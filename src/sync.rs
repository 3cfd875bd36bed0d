//! Change ledger between saves.
//!
//! [`SyncPending`] records which nodes need writing, and which aspects of each
//! node are dirty, since the last successful save. It is owned by the
//! [`StorageControl`](crate::control::StorageControl) and handed to the backend
//! by reference on save; a successful save clears it.

use std::collections::{HashMap, HashSet};

use crate::document::NodeId;

/// Dirty aspects of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeState {
    /// The node already exists in the persisted form.
    pub is_update_of_existing: bool,
    /// Name, syntax, tags, flags.
    pub prop: bool,
    /// Text and widgets.
    pub buff: bool,
    /// Parent or sequence.
    pub hier: bool,
}

impl NodeState {
    fn existing() -> Self {
        Self { is_update_of_existing: true, ..Self::default() }
    }

    /// A node never written before, with every aspect dirty.
    pub fn new_node() -> Self {
        Self { is_update_of_existing: false, prop: true, buff: true, hier: true }
    }

    pub fn is_new(&self) -> bool {
        !self.is_update_of_existing
    }

    pub fn any_dirty(&self) -> bool {
        self.prop || self.buff || self.hier
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPending {
    pub nodes_to_write: HashMap<NodeId, NodeState>,
    pub nodes_to_rm: HashSet<NodeId>,
    pub bookmarks_to_write: bool,
}

impl SyncPending {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_new(&mut self, id: NodeId) {
        self.nodes_to_rm.remove(&id);
        self.nodes_to_write.insert(id, NodeState::new_node());
    }

    pub fn pending_edit_prop(&mut self, id: NodeId) {
        self.state_mut(id).prop = true;
    }

    pub fn pending_edit_buff(&mut self, id: NodeId) {
        self.state_mut(id).buff = true;
    }

    pub fn pending_edit_hier(&mut self, id: NodeId) {
        self.state_mut(id).hier = true;
    }

    fn state_mut(&mut self, id: NodeId) -> &mut NodeState {
        self.nodes_to_write.entry(id).or_insert_with(NodeState::existing)
    }

    /// Schedules removal. A node that was never saved is simply forgotten.
    pub fn pending_rm(&mut self, id: NodeId) {
        match self.nodes_to_write.remove(&id) {
            Some(state) if state.is_new() => {}
            _ => {
                self.nodes_to_rm.insert(id);
            }
        }
    }

    pub fn pending_bookmarks(&mut self) {
        self.bookmarks_to_write = true;
    }

    pub fn state(&self, id: NodeId) -> Option<&NodeState> {
        self.nodes_to_write.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_to_write.is_empty() && self.nodes_to_rm.is_empty() && !self.bookmarks_to_write
    }

    pub fn clear(&mut self) {
        self.nodes_to_write.clear();
        self.nodes_to_rm.clear();
        self.bookmarks_to_write = false;
    }
}
