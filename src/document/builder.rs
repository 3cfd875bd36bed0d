use std::collections::HashMap;

use super::content::NodeContent;
use super::node::NodeProps;
use super::tree::{Document, MasterNode, NodeKind, TreeNode};
use super::NodeId;

/// One node as read from disk, before ids and aliases are checked.
#[derive(Debug, Clone)]
pub struct LoadedNode {
    pub id: NodeId,
    /// Sort key among siblings; gaps are fine.
    pub sequence: i64,
    /// `Some` for shared aliases. Aliases carry no props or content.
    pub master: Option<NodeId>,
    pub props: NodeProps,
    pub content: Option<NodeContent>,
}

#[derive(Debug, Clone, Copy)]
enum ParentLink {
    Root,
    /// Index of an earlier row (nested formats).
    Row(usize),
    /// Parent id (flat formats), resolved to its first occurrence at build time.
    Id(NodeId),
}

struct Row {
    node: LoadedNode,
    parent: ParentLink,
}

/// Outcome of [`DocumentBuilder::build`].
#[derive(Debug, Default)]
pub struct BuildReport {
    pub warnings: Vec<String>,
    /// `(duplicate id as read, fresh id assigned)`.
    pub reassigned: Vec<(NodeId, NodeId)>,
    /// Final id of every pushed row, by row index.
    pub row_ids: Vec<NodeId>,
}

/// Collects loaded rows and turns them into a [`Document`].
///
/// Later duplicates of an id get a fresh id, and alias-to-master links are only
/// checked once every row is known, so a master may appear after its aliases.
#[derive(Default)]
pub struct DocumentBuilder {
    rows: Vec<Row>,
    bookmarks: Vec<NodeId>,
    max_id: i64,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Adds a node nested under an earlier row (`None` for top level). Returns its row index.
    pub fn push_nested(&mut self, parent_row: Option<usize>, node: LoadedNode) -> usize {
        let parent = match parent_row {
            Some(row) if row < self.rows.len() => ParentLink::Row(row),
            _ => ParentLink::Root,
        };
        self.push(parent, node)
    }

    /// Adds a node whose parent is known only by id.
    pub fn push_flat(&mut self, parent: NodeId, node: LoadedNode) -> usize {
        let link = if parent.is_root() { ParentLink::Root } else { ParentLink::Id(parent) };
        self.push(link, node)
    }

    fn push(&mut self, parent: ParentLink, node: LoadedNode) -> usize {
        self.max_id = self.max_id.max(node.id.0);
        self.rows.push(Row { node, parent });
        self.rows.len() - 1
    }

    pub fn set_bookmarks(&mut self, bookmarks: Vec<NodeId>) {
        self.bookmarks = bookmarks;
    }

    pub fn build(self) -> (Document, BuildReport) {
        let mut report = BuildReport::default();
        let mut next_id = self.max_id;

        // First occurrence keeps its id, later duplicates get fresh ones.
        let mut first_row: HashMap<NodeId, usize> = HashMap::new();
        let mut final_ids = Vec::with_capacity(self.rows.len());
        for (idx, row) in self.rows.iter().enumerate() {
            if first_row.contains_key(&row.node.id) || row.node.id.0 <= 0 {
                next_id += 1;
                let fresh = NodeId(next_id);
                log::warn!("duplicate node id {} reassigned to {}", row.node.id, fresh);
                report.warnings.push(format!("node id {} is duplicated, reassigned to {}", row.node.id, fresh));
                report.reassigned.push((row.node.id, fresh));
                final_ids.push(fresh);
            } else {
                first_row.insert(row.node.id, idx);
                final_ids.push(row.node.id);
            }
        }

        // children per parent row (None = root), ordered by sequence then read order
        let mut kids: HashMap<Option<usize>, Vec<usize>> = HashMap::new();
        for (idx, row) in self.rows.iter().enumerate() {
            let parent = match row.parent {
                ParentLink::Root => None,
                ParentLink::Row(p) => Some(p),
                ParentLink::Id(pid) => match first_row.get(&pid) {
                    Some(p) => Some(*p),
                    None => {
                        report.warnings.push(format!("node {} has missing parent {}, moved to top level", row.node.id, pid));
                        None
                    }
                },
            };
            kids.entry(parent).or_default().push(idx);
        }
        for list in kids.values_mut() {
            list.sort_by_key(|idx| self.rows[*idx].node.sequence);
        }

        let mut doc = Document::new();
        doc.reserve_id(next_id);
        let mut visited = vec![false; self.rows.len()];
        let mut alias_props: HashMap<NodeId, NodeProps> = HashMap::new();
        let mut rows: Vec<Option<Row>> = self.rows.into_iter().map(Some).collect();
        let mut graft = Graft { rows: &mut rows, final_ids: &final_ids, kids: &kids, alias_props: &mut alias_props };

        let top: Vec<usize> = kids.get(&None).cloned().unwrap_or_default();
        graft.insert(&top, &mut doc, &mut visited);
        // rows stuck in a parent cycle never reach the root
        for idx in 0..visited.len() {
            if !visited[idx] {
                report.warnings.push(format!("node {} is not reachable from the root, moved to top level", final_ids[idx]));
                graft.insert(&[idx], &mut doc, &mut visited);
            }
        }

        resolve_aliases(&mut doc, &alias_props, &mut report);
        doc.set_bookmarks(self.bookmarks);
        report.row_ids = final_ids;
        (doc, report)
    }
}

struct Graft<'a> {
    rows: &'a mut Vec<Option<Row>>,
    final_ids: &'a [NodeId],
    kids: &'a HashMap<Option<usize>, Vec<usize>>,
    alias_props: &'a mut HashMap<NodeId, NodeProps>,
}

impl Graft<'_> {
    /// Inserts `start` rows at top level, then their descendants depth first.
    fn insert(&mut self, start: &[usize], doc: &mut Document, visited: &mut [bool]) {
        let mut stack: Vec<(usize, NodeId)> = start.iter().rev().map(|i| (*i, NodeId::ROOT)).collect();
        while let Some((idx, parent)) = stack.pop() {
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            let Some(row) = self.rows[idx].take() else { continue };
            let id = self.final_ids[idx];
            let kind = match row.node.master {
                Some(master) => {
                    self.alias_props.insert(id, row.node.props);
                    NodeKind::Alias { master }
                }
                None => NodeKind::Master(Box::new(MasterNode { props: row.node.props, content: row.node.content })),
            };
            doc.insert_with_id(TreeNode { id, parent, kind });
            if let Some(children) = self.kids.get(&Some(idx)) {
                for child in children.iter().rev() {
                    stack.push((*child, id));
                }
            }
        }
    }
}

/// Deferred alias check: chains collapse onto the real master, dangling aliases become
/// empty independent nodes.
fn resolve_aliases(doc: &mut Document, alias_props: &HashMap<NodeId, NodeProps>, report: &mut BuildReport) {
    for id in doc.traverse() {
        let Some(master) = doc.node(id).and_then(TreeNode::alias_master) else { continue };
        let target = doc.node(master).map(|m| m.alias_master().unwrap_or(master));
        let fixed = match target {
            Some(t) if t != id && doc.node(t).map(|n| n.alias_master().is_none()).unwrap_or(false) => {
                NodeKind::Alias { master: t }
            }
            _ => {
                log::warn!("shared node {id} refers to missing master {master}");
                report.warnings.push(format!("shared node {id} refers to missing master {master}, detached"));
                let props = alias_props.get(&id).cloned().unwrap_or_else(|| NodeProps::new(format!("?{master}")));
                let content = Some(NodeContent::empty_for(&props.syntax));
                NodeKind::Master(Box::new(MasterNode { props, content }))
            }
        };
        doc.replace_kind(id, fixed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(id: i64, seq: i64) -> LoadedNode {
        LoadedNode {
            id: NodeId(id),
            sequence: seq,
            master: None,
            props: NodeProps::new(format!("n{id}")),
            content: Some(NodeContent::rich(format!("c{id}"))),
        }
    }

    #[test]
    fn flat_rows_ordered_by_sequence() {
        let mut b = DocumentBuilder::new();
        b.push_flat(NodeId(1), loaded(3, 5));
        b.push_flat(NodeId::ROOT, loaded(1, 1));
        b.push_flat(NodeId(1), loaded(2, 2));
        let (doc, report) = b.build();
        assert!(report.warnings.is_empty());
        assert_eq!(doc.children(NodeId(1)), &[NodeId(2), NodeId(3)]);
        assert_eq!(doc.max_id(), 3);
    }

    #[test]
    fn duplicate_ids_get_fresh_ids() {
        let mut b = DocumentBuilder::new();
        let top = b.push_nested(None, loaded(1, 1));
        b.push_nested(Some(top), loaded(2, 1));
        let dup = b.push_nested(None, loaded(2, 2));
        b.push_nested(Some(dup), loaded(3, 1));
        let (doc, report) = b.build();

        assert_eq!(report.reassigned, vec![(NodeId(2), NodeId(4))]);
        assert_eq!(doc.len(), 4);
        assert_eq!(doc.children(NodeId::ROOT), &[NodeId(1), NodeId(4)]);
        assert_eq!(doc.children(NodeId(4)), &[NodeId(3)]);
        assert_eq!(doc.props(NodeId(4)).unwrap().name, "n2");
        assert_eq!(doc.max_id(), 4);
    }

    #[test]
    fn alias_before_master_is_resolved() {
        let mut b = DocumentBuilder::new();
        let mut alias = loaded(1, 1);
        alias.master = Some(NodeId(2));
        b.push_flat(NodeId::ROOT, alias);
        b.push_flat(NodeId::ROOT, loaded(2, 2));
        let (doc, report) = b.build();
        assert!(report.warnings.is_empty());
        assert_eq!(doc.resolve(NodeId(1)), Some(NodeId(2)));
        assert_eq!(doc.props(NodeId(1)).unwrap().name, "n2");
    }

    #[test]
    fn dangling_alias_is_detached() {
        let mut b = DocumentBuilder::new();
        let mut alias = loaded(1, 1);
        alias.master = Some(NodeId(42));
        b.push_flat(NodeId::ROOT, alias);
        let (doc, report) = b.build();
        assert_eq!(report.warnings.len(), 1);
        assert!(!doc.is_alias(NodeId(1)));
    }

    #[test]
    fn missing_parent_goes_to_top_level() {
        let mut b = DocumentBuilder::new();
        b.push_flat(NodeId(9), loaded(1, 1));
        let (doc, report) = b.build();
        assert_eq!(doc.children(NodeId::ROOT), &[NodeId(1)]);
        assert_eq!(report.warnings.len(), 1);
    }
}
