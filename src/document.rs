//! In-memory document model.
//!
//! A document is a tree of nodes. Every node has a numeric [`NodeId`] that is
//! unique within the document and allocated monotonically. Position in the tree
//! is given by the parent id ([`NodeId::ROOT`] for top-level nodes) and the
//! 1-based index among the parent's children.
//!
//! # Shared nodes
//!
//! A node can be a *shared alias* of another node (its *master*). Aliases have
//! their own id and their own place in the tree, but no properties or content of
//! their own: every read resolves through the master, so a document never holds
//! two copies of shared content. When a master is removed while aliases survive,
//! the lowest-id surviving alias is promoted to master.
//!
//! # Lazy content
//!
//! Node content ([`NodeContent`]) is optional on a loaded document. Backends may
//! populate only the tree skeleton and fill content on first access through
//! [`crate::storage::StorageEntity::get_delayed_text_buffer`].
//!
//! # Available types
//!
//! - [`Document`]: the node arena plus ordering and bookmarks.
//! - [`NodeProps`]: name, syntax, flags and timestamps of a node.
//! - [`NodeContent`], [`TextContent`], [`RichSegment`]: the text buffer.
//! - [`AnchoredWidget`], [`WidgetKind`]: embedded objects anchored in the text.
//! - [`DocumentBuilder`]: accumulates rows read by a backend and resolves
//!   duplicate ids and forward alias references.
//! - [`WritePlan`], [`ExportScope`]: the ordered list of nodes a save writes.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub mod builder;
pub mod content;
pub mod node;
pub mod plan;
pub mod tree;

pub use builder::{BuildReport, DocumentBuilder, LoadedNode};
pub use content::{AnchoredWidget, Justification, NodeContent, RichSegment, TextContent, WidgetKind};
pub use node::NodeProps;
pub use plan::{ExportScope, MasterReassign, PlannedNode, WritePlan};
pub use tree::{Document, MasterPromotion, NodeKind, RemovedSubtree, TreeNode};

/// Numeric node identifier. `NodeId::ROOT` (0) is the virtual parent of top-level nodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub i64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for NodeId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time as unix seconds.
pub(crate) fn now_ts() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
