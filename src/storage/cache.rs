use std::collections::{HashMap, HashSet};

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::document::{Document, NodeId};

/// A widget by owning (master) node and position in its widget list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WidgetKey {
    pub node: NodeId,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlob {
    /// Lowercase hex digest of the raw bytes.
    pub sha256: String,
    pub base64: Option<String>,
}

/// Blob digests and encodings computed once, in parallel, ahead of a save.
#[derive(Debug, Default)]
pub struct StorageCache {
    blobs: HashMap<WidgetKey, CachedBlob>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl StorageCache {
    /// Collects the blob widgets of `ids` (every node when `None`) and hashes them,
    /// base64-encoding too when `with_base64` is set.
    pub fn generate(doc: &Document, ids: Option<&[NodeId]>, with_base64: bool) -> Self {
        let owners: Vec<NodeId> = match ids {
            Some(ids) => ids.to_vec(),
            None => doc.traverse(),
        };
        let mut seen = HashSet::new();
        let mut work: Vec<(WidgetKey, &[u8])> = Vec::new();
        for id in owners {
            let Some(master) = doc.resolve(id) else { continue };
            if !seen.insert(master) {
                continue;
            }
            let Some(content) = doc.content(master) else { continue };
            for (index, widget) in content.widgets.iter().enumerate() {
                if let Some(bytes) = widget.kind.blob() {
                    work.push((WidgetKey { node: master, index }, bytes));
                }
            }
        }
        if work.is_empty() {
            return Self::default();
        }

        let width = num_cpus::get().max(1);
        let chunk = work.len().div_ceil(width);
        let blobs = std::thread::scope(|s| {
            let handles: Vec<_> = work
                .chunks(chunk)
                .map(|part| {
                    s.spawn(move || {
                        part.iter()
                            .map(|(key, bytes)| {
                                let encoded = with_base64.then(|| base64::engine::general_purpose::STANDARD.encode(bytes));
                                (*key, CachedBlob { sha256: sha256_hex(bytes), base64: encoded })
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let mut out = HashMap::new();
            for handle in handles {
                match handle.join() {
                    Ok(part) => out.extend(part),
                    Err(_) => log::error!("blob cache worker panicked, entries will be computed on demand"),
                }
            }
            out
        });
        log::debug!("cached {} blobs (base64: {with_base64})", blobs.len());
        Self { blobs }
    }

    pub fn get(&self, key: WidgetKey) -> Option<&CachedBlob> {
        self.blobs.get(&key)
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, key: WidgetKey, blob: CachedBlob) {
        self.blobs.insert(key, blob);
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{AnchoredWidget, NodeContent, NodeProps, WidgetKind};

    #[test]
    fn caches_blob_widgets_of_requested_nodes() {
        let mut doc = Document::new();
        let content = NodeContent::rich("img")
            .with_widget(AnchoredWidget::new(0, WidgetKind::Image { png: vec![1, 2, 3], link: String::new() }))
            .with_widget(AnchoredWidget::new(1, WidgetKind::Anchor { name: "x".into() }))
            .with_widget(AnchoredWidget::new(2, WidgetKind::Latex { source: "x^2".into() }));
        let a = doc.add_node(NodeId::ROOT, None, NodeProps::new("A"), Some(content)).unwrap();
        let alias = doc.add_shared_alias(a, NodeId::ROOT, None).unwrap();
        let b = doc
            .add_node(NodeId::ROOT, None, NodeProps::new("B"), Some(NodeContent::rich("b").with_widget(
                AnchoredWidget::new(0, WidgetKind::Image { png: vec![9], link: String::new() }),
            )))
            .unwrap();

        let cache = StorageCache::generate(&doc, Some(&[alias]), true);
        assert_eq!(cache.len(), 2);
        let img = cache.get(WidgetKey { node: a, index: 0 }).unwrap();
        assert_eq!(img.base64.as_deref(), Some("AQID"));
        assert_eq!(img.sha256, sha256_hex(&[1, 2, 3]));
        assert!(cache.get(WidgetKey { node: a, index: 1 }).is_none());
        assert!(cache.get(WidgetKey { node: b, index: 0 }).is_none());

        let all = StorageCache::generate(&doc, None, false);
        assert_eq!(all.len(), 3);
        assert!(all.get(WidgetKey { node: b, index: 0 }).unwrap().base64.is_none());
    }
}
