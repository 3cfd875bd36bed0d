use std::collections::{HashMap, HashSet};

use super::content::NodeContent;
use super::node::NodeProps;
use super::NodeId;
use crate::errors::{Result, StorageError};

/// Data owned by a master node.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterNode {
    pub props: NodeProps,
    /// `None` until the content is materialized.
    pub content: Option<NodeContent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Master(Box<MasterNode>),
    /// Shared alias resolving to `master` for props and content.
    Alias { master: NodeId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub id: NodeId,
    pub parent: NodeId,
    pub kind: NodeKind,
}

impl TreeNode {
    pub fn alias_master(&self) -> Option<NodeId> {
        match self.kind {
            NodeKind::Alias { master } => Some(master),
            NodeKind::Master(_) => None,
        }
    }
}

/// A surviving alias that took over from a removed master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPromotion {
    pub old_master: NodeId,
    pub new_master: NodeId,
    /// Other surviving aliases, now pointing at `new_master`.
    pub retargeted: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSubtree {
    /// Removed ids, parents before children.
    pub removed: Vec<NodeId>,
    pub former_parent: NodeId,
    pub promotions: Vec<MasterPromotion>,
    pub bookmarks_changed: bool,
}

/// The node tree of one open document.
#[derive(Debug, Clone, Default)]
pub struct Document {
    nodes: HashMap<NodeId, TreeNode>,
    children: HashMap<NodeId, Vec<NodeId>>,
    bookmarks: Vec<NodeId>,
    max_id: i64,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    /// Highest id ever allocated or inserted.
    pub fn max_id(&self) -> i64 {
        self.max_id
    }

    /// Allocates a fresh id. Ids are never reused, even after removal.
    pub fn allocate_id(&mut self) -> NodeId {
        self.max_id += 1;
        NodeId(self.max_id)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).map(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 1-based position among siblings.
    pub fn sequence_of(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent_of(id)?;
        self.children(parent).iter().position(|c| *c == id).map(|p| p + 1)
    }

    /// Top-level nodes have depth 1.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cur = id;
        while let Some(node) = self.nodes.get(&cur) {
            depth += 1;
            cur = node.parent;
            if cur.is_root() || depth > self.nodes.len() {
                break;
            }
        }
        depth
    }

    /// The node holding the data for `id`: itself for masters, the master for aliases.
    pub fn resolve(&self, id: NodeId) -> Option<NodeId> {
        match &self.nodes.get(&id)?.kind {
            NodeKind::Master(_) => Some(id),
            NodeKind::Alias { master } => Some(*master),
        }
    }

    pub fn is_alias(&self, id: NodeId) -> bool {
        self.nodes.get(&id).and_then(TreeNode::alias_master).is_some()
    }

    /// Aliases pointing at `master`, ascending.
    pub fn aliases_of(&self, master: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.alias_master() == Some(master))
            .map(|n| n.id)
            .collect();
        ids.sort();
        ids
    }

    fn master_node(&self, id: NodeId) -> Option<&MasterNode> {
        let data_id = self.resolve(id)?;
        match &self.nodes.get(&data_id)?.kind {
            NodeKind::Master(m) => Some(m),
            NodeKind::Alias { .. } => None,
        }
    }

    fn master_node_mut(&mut self, id: NodeId) -> Option<&mut MasterNode> {
        let data_id = self.resolve(id)?;
        match &mut self.nodes.get_mut(&data_id)?.kind {
            NodeKind::Master(m) => Some(m),
            NodeKind::Alias { .. } => None,
        }
    }

    pub fn props(&self, id: NodeId) -> Option<&NodeProps> {
        self.master_node(id).map(|m| &m.props)
    }

    pub fn props_mut(&mut self, id: NodeId) -> Option<&mut NodeProps> {
        self.master_node_mut(id).map(|m| &mut m.props)
    }

    pub fn content(&self, id: NodeId) -> Option<&NodeContent> {
        self.master_node(id).and_then(|m| m.content.as_ref())
    }

    pub fn is_content_loaded(&self, id: NodeId) -> bool {
        self.content(id).is_some()
    }

    pub fn set_content(&mut self, id: NodeId, content: NodeContent) -> Result<()> {
        let master = self.master_node_mut(id).ok_or(StorageError::NodeNotFound(id))?;
        master.content = Some(content);
        Ok(())
    }

    /// Adds a master node under `parent` at 0-based `position` (appended when `None`).
    pub fn add_node(
        &mut self,
        parent: NodeId,
        position: Option<usize>,
        props: NodeProps,
        content: Option<NodeContent>,
    ) -> Result<NodeId> {
        self.check_parent(parent)?;
        let id = self.allocate_id();
        let kind = NodeKind::Master(Box::new(MasterNode { props, content }));
        self.attach(TreeNode { id, parent, kind }, position);
        Ok(id)
    }

    /// Adds a shared alias of `master` under `parent`.
    pub fn add_shared_alias(&mut self, master: NodeId, parent: NodeId, position: Option<usize>) -> Result<NodeId> {
        let master = self.resolve(master).ok_or(StorageError::NodeNotFound(master))?;
        self.check_parent(parent)?;
        let id = self.allocate_id();
        self.attach(TreeNode { id, parent, kind: NodeKind::Alias { master } }, position);
        Ok(id)
    }

    /// Inserts a node with a known id, appended to its parent. Used by loaders and grafting.
    pub(crate) fn insert_with_id(&mut self, node: TreeNode) {
        self.max_id = self.max_id.max(node.id.0);
        self.attach(node, None);
    }

    pub(crate) fn replace_kind(&mut self, id: NodeId, kind: NodeKind) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.kind = kind;
        }
    }

    /// Bumps the allocator so that future ids are above `id`.
    pub(crate) fn reserve_id(&mut self, id: i64) {
        self.max_id = self.max_id.max(id);
    }

    fn check_parent(&self, parent: NodeId) -> Result<()> {
        if parent.is_root() || self.nodes.contains_key(&parent) {
            Ok(())
        } else {
            Err(StorageError::NodeNotFound(parent))
        }
    }

    fn attach(&mut self, node: TreeNode, position: Option<usize>) {
        let siblings = self.children.entry(node.parent).or_default();
        match position {
            Some(pos) if pos < siblings.len() => siblings.insert(pos, node.id),
            _ => siblings.push(node.id),
        }
        self.nodes.insert(node.id, node);
    }

    fn detach(&mut self, id: NodeId, parent: NodeId) {
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|c| *c != id);
        }
    }

    /// Moves `id` under `new_parent` at 0-based `position`.
    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId, position: Option<usize>) -> Result<()> {
        let old_parent = self.parent_of(id).ok_or(StorageError::NodeNotFound(id))?;
        self.check_parent(new_parent)?;
        if !new_parent.is_root() && self.subtree(id).contains(&new_parent) {
            return Err(StorageError::SaveFailed(format!("cannot move node {id} under its own subtree")));
        }
        self.detach(id, old_parent);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = new_parent;
        }
        let siblings = self.children.entry(new_parent).or_default();
        match position {
            Some(pos) if pos < siblings.len() => siblings.insert(pos, id),
            _ => siblings.push(id),
        }
        Ok(())
    }

    /// `id` and all its descendants, parents before children.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if !self.nodes.contains_key(&cur) {
                continue;
            }
            out.push(cur);
            for child in self.children(cur).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Every node in pre-order.
    pub fn traverse(&self) -> Vec<NodeId> {
        self.children(NodeId::ROOT)
            .iter()
            .flat_map(|top| self.subtree(*top))
            .collect()
    }

    /// Removes `id` with its descendants.
    ///
    /// A removed master whose aliases survive elsewhere hands its data to the lowest-id
    /// surviving alias; the other survivors are retargeted to it.
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<RemovedSubtree> {
        let former_parent = self.parent_of(id).ok_or(StorageError::NodeNotFound(id))?;
        let removed = self.subtree(id);
        let removed_set: HashSet<NodeId> = removed.iter().copied().collect();

        let mut promotions = Vec::new();
        for rid in &removed {
            if self.is_alias(*rid) {
                continue;
            }
            let survivors: Vec<NodeId> = self
                .aliases_of(*rid)
                .into_iter()
                .filter(|a| !removed_set.contains(a))
                .collect();
            let Some((&new_master, rest)) = survivors.split_first() else {
                continue;
            };
            let data = match self.nodes.get_mut(rid) {
                Some(node) => std::mem::replace(&mut node.kind, NodeKind::Alias { master: new_master }),
                None => continue,
            };
            if let Some(node) = self.nodes.get_mut(&new_master) {
                node.kind = data;
            }
            for alias in rest {
                if let Some(node) = self.nodes.get_mut(alias) {
                    node.kind = NodeKind::Alias { master: new_master };
                }
            }
            log::debug!("node {rid} removed, alias {new_master} promoted to master");
            promotions.push(MasterPromotion { old_master: *rid, new_master, retargeted: rest.to_vec() });
        }

        self.detach(id, former_parent);
        for rid in &removed {
            self.nodes.remove(rid);
            self.children.remove(rid);
        }
        let before = self.bookmarks.len();
        self.bookmarks.retain(|b| !removed_set.contains(b));

        Ok(RemovedSubtree {
            removed,
            former_parent,
            promotions,
            bookmarks_changed: before != self.bookmarks.len(),
        })
    }

    pub fn bookmarks(&self) -> &[NodeId] {
        &self.bookmarks
    }

    /// Replaces the bookmark list, dropping unknown ids and duplicates.
    pub fn set_bookmarks(&mut self, bookmarks: Vec<NodeId>) {
        let mut seen = HashSet::new();
        self.bookmarks = bookmarks
            .into_iter()
            .filter(|b| self.nodes.contains_key(b) && seen.insert(*b))
            .collect();
    }

    pub fn add_bookmark(&mut self, id: NodeId) -> bool {
        if self.nodes.contains_key(&id) && !self.bookmarks.contains(&id) {
            self.bookmarks.push(id);
            true
        } else {
            false
        }
    }

    /// Ids in the document without materialized content (masters only).
    pub fn unloaded_masters(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| matches!(&n.kind, NodeKind::Master(m) if m.content.is_none()))
            .map(|n| n.id)
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(name: &str) -> NodeProps {
        NodeProps::new(name)
    }

    fn sample() -> (Document, NodeId, NodeId, NodeId) {
        let mut doc = Document::new();
        let a = doc.add_node(NodeId::ROOT, None, props("A"), Some(NodeContent::rich("a"))).unwrap();
        let b = doc.add_node(a, None, props("B"), Some(NodeContent::rich("b"))).unwrap();
        let c = doc.add_node(NodeId::ROOT, None, props("C"), Some(NodeContent::rich("c"))).unwrap();
        (doc, a, b, c)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let (mut doc, a, b, c) = sample();
        assert_eq!((a.0, b.0, c.0), (1, 2, 3));
        doc.remove_subtree(c).unwrap();
        let d = doc.allocate_id();
        assert_eq!(d.0, 4);
    }

    #[test]
    fn sequence_and_depth() {
        let (mut doc, a, b, c) = sample();
        assert_eq!(doc.sequence_of(a), Some(1));
        assert_eq!(doc.sequence_of(c), Some(2));
        assert_eq!(doc.depth(a), 1);
        assert_eq!(doc.depth(b), 2);

        let d = doc.add_node(NodeId::ROOT, Some(0), props("D"), None).unwrap();
        assert_eq!(doc.sequence_of(d), Some(1));
        assert_eq!(doc.sequence_of(a), Some(2));
        assert_eq!(doc.traverse(), vec![d, a, b, c]);
    }

    #[test]
    fn alias_reads_resolve_to_master() {
        let (mut doc, a, _b, c) = sample();
        let alias = doc.add_shared_alias(a, c, None).unwrap();
        assert_eq!(doc.props(alias).unwrap().name, "A");

        doc.props_mut(a).unwrap().name = "A2".into();
        assert_eq!(doc.props(alias).unwrap().name, "A2");

        doc.set_content(alias, NodeContent::rich("shared")).unwrap();
        assert_eq!(doc.content(a).unwrap().text.plain_text(), "shared");

        // aliasing an alias points at the real master
        let alias2 = doc.add_shared_alias(alias, NodeId::ROOT, None).unwrap();
        assert_eq!(doc.resolve(alias2), Some(a));
    }

    #[test]
    fn removing_master_promotes_lowest_surviving_alias() {
        let (mut doc, a, _b, c) = sample();
        let x = doc.add_shared_alias(a, c, None).unwrap();
        let y = doc.add_shared_alias(a, NodeId::ROOT, None).unwrap();

        let removed = doc.remove_subtree(a).unwrap();
        assert_eq!(removed.promotions.len(), 1);
        assert_eq!(removed.promotions[0].new_master, x);
        assert_eq!(removed.promotions[0].retargeted, vec![y]);
        assert!(!doc.is_alias(x));
        assert_eq!(doc.resolve(y), Some(x));
        assert_eq!(doc.props(y).unwrap().name, "A");
        assert_eq!(doc.content(y).unwrap().text.plain_text(), "a");
    }

    #[test]
    fn removing_subtree_drops_aliases_inside_it() {
        let (mut doc, a, b, _c) = sample();
        // B sits under A and shares A's content
        let alias = doc.add_shared_alias(a, b, None).unwrap();
        let removed = doc.remove_subtree(a).unwrap();
        assert_eq!(removed.removed, vec![a, b, alias]);
        assert!(removed.promotions.is_empty());
        for n in doc.traverse() {
            if let Some(m) = doc.node(n).and_then(TreeNode::alias_master) {
                assert!(doc.contains(m), "dangling alias {n}");
            }
        }
    }

    #[test]
    fn move_rejects_cycles_and_reorders() {
        let (mut doc, a, b, c) = sample();
        assert!(doc.move_node(a, b, None).is_err());
        doc.move_node(c, a, Some(0)).unwrap();
        assert_eq!(doc.children(a), &[c, b]);
        assert_eq!(doc.parent_of(c), Some(a));
        assert_eq!(doc.children(NodeId::ROOT), &[a]);
    }

    #[test]
    fn bookmarks_follow_removal() {
        let (mut doc, a, b, c) = sample();
        doc.set_bookmarks(vec![b, c, b, NodeId(99)]);
        assert_eq!(doc.bookmarks(), &[b, c]);
        let removed = doc.remove_subtree(a).unwrap();
        assert!(removed.bookmarks_changed);
        assert_eq!(doc.bookmarks(), &[c]);
    }
}
