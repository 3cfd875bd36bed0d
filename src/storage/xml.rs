use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use super::xml_codec::{self, BlobMode, BlobWrite};
use super::{check_writable, content_for, import_with, write_atomic};
use super::{DelayedBuffers, DocType, LoadMode, PopulateReport, SaveRequest, StorageEntity};
use crate::document::{Document, DocumentBuilder, LoadedNode, NodeContent, NodeId, PlannedNode};
use crate::errors::StorageError;

/// Single-file XML document (`.ctd`). Every save rewrites the whole file.
#[derive(Debug, Default)]
pub struct XmlEntity {
    path: Option<PathBuf>,
    delayed: DelayedBuffers,
}

impl XmlEntity {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_subtree<W: Write>(
        &self,
        w: &mut Writer<W>,
        req: &SaveRequest<'_>,
        kids: &HashMap<NodeId, Vec<&PlannedNode>>,
        node: &PlannedNode,
    ) -> Result<()> {
        let doc = req.document;
        let props = doc.props(node.source).ok_or(StorageError::NodeNotFound(node.source))?;
        xml_codec::write_node_start(w, node.id, node.master, props)?;
        if node.master.is_none() {
            let content = content_for(doc, &self.delayed, node.source)?;
            let blobs = BlobWrite { mode: BlobMode::Inline, cache: req.cache, owner: None };
            match node.range {
                Some((start, end)) => xml_codec::write_content(w, &content.slice(start, end), &blobs)?,
                None => xml_codec::write_content(w, content, &BlobWrite { owner: Some(node.source), ..blobs })?,
            }
        }
        if let Some(children) = kids.get(&node.id) {
            for child in children {
                self.write_subtree(w, req, kids, child)?;
            }
        }
        xml_codec::write_node_end(w)
    }

    fn encode(&self, req: &SaveRequest<'_>) -> Result<Vec<u8>> {
        let plan = req.plan()?;
        let mut kids: HashMap<NodeId, Vec<&PlannedNode>> = HashMap::new();
        for node in &plan.nodes {
            kids.entry(node.parent).or_default().push(node);
        }
        for list in kids.values_mut() {
            list.sort_by_key(|n| n.sequence);
        }

        let mut w = xml_codec::new_writer();
        xml_codec::write_decl(&mut w)?;
        w.write_event(Event::Start(BytesStart::new("cherrytree")))?;
        let mut bookmarks = BytesStart::new("bookmarks");
        let list = xml_codec::format_id_list(&plan.bookmarks);
        bookmarks.push_attribute(("list", list.as_str()));
        w.write_event(Event::Empty(bookmarks))?;
        for top in kids.get(&NodeId::ROOT).map(Vec::as_slice).unwrap_or(&[]) {
            self.write_subtree(&mut w, req, &kids, top)?;
        }
        w.write_event(Event::End(BytesEnd::new("cherrytree")))?;
        Ok(w.into_inner())
    }
}

impl StorageEntity for XmlEntity {
    fn doc_type(&self) -> DocType {
        DocType::Xml
    }

    fn populate_treestore(&mut self, path: &Path, doc: &mut Document, mode: LoadMode) -> Result<PopulateReport> {
        let xml = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let tree = xml_codec::parse_tree(&xml, &|sha, _| Err(anyhow!("unexpected external blob {sha}")))
            .with_context(|| format!("parsing {}", path.display()))?;

        let mut builder = DocumentBuilder::new();
        let mut contents = Vec::with_capacity(tree.nodes.len());
        for (idx, parsed) in tree.nodes.into_iter().enumerate() {
            let row = LoadedNode {
                id: parsed.id,
                sequence: idx as i64,
                master: parsed.master,
                props: parsed.props,
                content: None,
            };
            builder.push_nested(parsed.parent, row);
            contents.push(parsed.master.is_none().then_some(parsed.content));
        }
        builder.set_bookmarks(tree.bookmarks.unwrap_or_default());
        let (built, build) = builder.build();

        let report = PopulateReport {
            warnings: build.warnings,
            recovered_paths: Vec::new(),
            reassigned_ids: build.reassigned,
        };
        if mode == LoadMode::DryRun {
            log::debug!("dry run of {} ok, {} nodes", path.display(), built.len());
            return Ok(report);
        }

        self.delayed.clear();
        for (id, content) in build.row_ids.into_iter().zip(contents) {
            if let Some(content) = content {
                self.delayed.insert(id, content);
            }
        }
        *doc = built;
        self.path = Some(path.to_path_buf());
        log::info!("loaded {} nodes from {}", doc.len(), path.display());
        Ok(report)
    }

    fn save_treestore(&mut self, req: &SaveRequest<'_>) -> Result<()> {
        let bytes = self.encode(req)?;
        write_atomic(req.path, &bytes)?;
        if !req.export.is_export() {
            self.path = Some(req.path.to_path_buf());
        }
        log::debug!("wrote {} bytes to {}", bytes.len(), req.path.display());
        Ok(())
    }

    fn get_delayed_text_buffer(&mut self, id: NodeId, _syntax: &str) -> Result<NodeContent> {
        self.delayed.take(id).ok_or_else(|| anyhow!("no delayed content for node {id}"))
    }

    fn import_nodes(&mut self, path: &Path, doc: &mut Document, parent: NodeId) -> Result<Vec<NodeId>> {
        import_with(Box::new(XmlEntity::new()), path, doc, parent)
    }

    fn test_connection(&mut self) -> Result<()> {
        match &self.path {
            Some(path) => check_writable(path),
            None => Ok(()),
        }
    }
}
