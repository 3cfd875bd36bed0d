use std::collections::{HashMap, HashSet};

use super::tree::{Document, MasterNode, NodeKind, TreeNode};
use super::NodeId;
use crate::errors::{Result, StorageError};

/// Which part of the document a save writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportScope {
    /// A normal save of the whole document.
    #[default]
    NoneSave,
    Node(NodeId),
    NodeAndSubnodes(NodeId),
    /// A character range of one node's text.
    TextSelection { node: NodeId, start: usize, end: usize },
    AllTree,
}

impl ExportScope {
    pub fn is_export(&self) -> bool {
        !matches!(self, ExportScope::NoneSave)
    }
}

/// Outside master id -> exported alias that takes over as master.
pub type MasterReassign = HashMap<NodeId, NodeId>;

/// One node as it will be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    pub id: NodeId,
    /// Parent in the written document; export roots are written at top level.
    pub parent: NodeId,
    /// 1-based.
    pub sequence: usize,
    /// Top level is 1.
    pub depth: usize,
    /// `Some` when written as a shared alias of that master.
    pub master: Option<NodeId>,
    /// Node whose props and content are written for a non-alias.
    pub source: NodeId,
    /// Character range for text selections.
    pub range: Option<(usize, usize)>,
}

impl PlannedNode {
    pub fn is_alias(&self) -> bool {
        self.master.is_some()
    }
}

/// Nodes to write, root to leaf.
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub nodes: Vec<PlannedNode>,
    pub bookmarks: Vec<NodeId>,
}

impl WritePlan {
    pub fn get(&self, id: NodeId) -> Option<&PlannedNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn ids(&self) -> HashSet<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Children of `parent` in write order.
    pub fn children_of(&self, parent: NodeId) -> Vec<NodeId> {
        let mut kids: Vec<&PlannedNode> = self.nodes.iter().filter(|n| n.parent == parent).collect();
        kids.sort_by_key(|n| n.sequence);
        kids.into_iter().map(|n| n.id).collect()
    }
}

impl Document {
    /// For an exported subtree, picks the first alias (pre-order) of every outside
    /// master to become the master inside the export.
    pub fn expo_master_reassign(&self, root: NodeId) -> MasterReassign {
        let exported: HashSet<NodeId> = self.subtree(root).into_iter().collect();
        let mut map = MasterReassign::new();
        for id in self.subtree(root) {
            if let Some(master) = self.node(id).and_then(TreeNode::alias_master) {
                if !exported.contains(&master) {
                    map.entry(master).or_insert(id);
                }
            }
        }
        map
    }

    /// Lists the nodes `scope` writes, sorted by depth so parents precede children.
    pub fn write_plan(&self, scope: ExportScope, reassign: &MasterReassign) -> Result<WritePlan> {
        let (roots, range): (Vec<NodeId>, Option<(usize, usize)>) = match scope {
            ExportScope::NoneSave | ExportScope::AllTree => (self.children(NodeId::ROOT).to_vec(), None),
            ExportScope::Node(id) | ExportScope::NodeAndSubnodes(id) => {
                self.require(id)?;
                (vec![id], None)
            }
            ExportScope::TextSelection { node, start, end } => {
                self.require(node)?;
                (vec![node], Some((start.min(end), end.max(start))))
            }
        };
        let recurse = !matches!(scope, ExportScope::Node(_) | ExportScope::TextSelection { .. });

        let mut nodes = Vec::new();
        let mut stack: Vec<(NodeId, NodeId, usize, usize)> =
            roots.iter().enumerate().rev().map(|(i, r)| (*r, NodeId::ROOT, i + 1, 1)).collect();
        while let Some((id, parent, sequence, depth)) = stack.pop() {
            nodes.push((id, parent, sequence, depth));
            if recurse {
                for (i, child) in self.children(id).iter().enumerate().rev() {
                    stack.push((*child, id, i + 1, depth + 1));
                }
            }
        }
        let exported: HashSet<NodeId> = nodes.iter().map(|n| n.0).collect();

        let mut planned: Vec<PlannedNode> = nodes
            .into_iter()
            .map(|(id, parent, sequence, depth)| {
                let (master, source) = match self.node(id).and_then(TreeNode::alias_master) {
                    None => (None, id),
                    Some(m) if exported.contains(&m) => (Some(m), m),
                    Some(m) => match reassign.get(&m) {
                        Some(new_master) if *new_master == id => (None, m),
                        Some(new_master) if exported.contains(new_master) => (Some(*new_master), m),
                        // no exported master, write a standalone copy
                        _ => (None, m),
                    },
                };
                PlannedNode { id, parent, sequence, depth, master, source, range }
            })
            .collect();
        planned.sort_by_key(|n| n.depth);

        let bookmarks = self.bookmarks().iter().copied().filter(|b| exported.contains(b)).collect();
        Ok(WritePlan { nodes: planned, bookmarks })
    }

    /// Copies every node of `other` under `parent` with fresh ids, remapping shared
    /// links inside the copied set. Returns the new ids, parents first.
    pub fn graft(&mut self, other: &Document, parent: NodeId) -> Result<Vec<NodeId>> {
        if !parent.is_root() {
            self.require(parent)?;
        }
        let order = other.traverse();
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        for old in &order {
            let fresh = self.allocate_id();
            remap.insert(*old, fresh);
        }

        let mut added = Vec::with_capacity(order.len());
        for old in order {
            let Some(node) = other.node(old) else { continue };
            let id = remap[&old];
            let new_parent = if node.parent.is_root() { parent } else { remap[&node.parent] };
            let kind = match &node.kind {
                NodeKind::Master(m) => NodeKind::Master(m.clone()),
                NodeKind::Alias { master } => match remap.get(master) {
                    Some(new_master) => NodeKind::Alias { master: *new_master },
                    None => {
                        let props = other.props(old).cloned().unwrap_or_default();
                        let content = other.content(old).cloned();
                        NodeKind::Master(Box::new(MasterNode { props, content }))
                    }
                },
            };
            self.insert_with_id(TreeNode { id, parent: new_parent, kind });
            added.push(id);
        }
        log::debug!("grafted {} nodes under {}", added.len(), parent);
        Ok(added)
    }

    fn require(&self, id: NodeId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(StorageError::NodeNotFound(id))
        }
    }
}
