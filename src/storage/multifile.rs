use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use walkdir::WalkDir;

use super::cache::{sha256_hex, WidgetKey};
use super::xml_codec::{self, BlobMode, BlobWrite, ParsedNode};
use super::{check_writable, import_with, write_atomic};
use super::{DelayedBuffers, DiskJobs, DocType, LoadMode, PopulateReport, SaveRequest, StorageCache, StorageEntity};
use crate::document::{Document, DocumentBuilder, LoadedNode, NodeContent, NodeId, NodeProps};
use crate::errors::StorageError;

pub(crate) const NODE_XML: &str = "node.xml";
pub(crate) const SUBNODES_LST: &str = "subnodes.lst";
pub(crate) const BOOKMARKS_LST: &str = "bookmarks.lst";
/// Staging dir holding the previous version of a rewritten node.
pub(crate) const BEFORE_DIR: &str = ".before";

/// Backup generation `generation` (1 = newest) of a node directory: `.bkp~`, `.bkp~~`, ...
pub(crate) fn node_backup_dir(node_dir: &Path, generation: usize) -> PathBuf {
    node_dir.join(format!(".bkp{}", "~".repeat(generation)))
}

/// Node dirs are named by id; staging, backups and tilde copies are not.
fn is_node_dir_name(name: &std::ffi::OsStr) -> bool {
    name.to_str().map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn read_list(path: &Path) -> Result<Vec<NodeId>> {
    match fs::read_to_string(path) {
        Ok(s) => xml_codec::parse_id_list(&s).with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn write_list(path: &Path, ids: &[NodeId]) -> Result<()> {
    write_atomic(path, xml_codec::format_id_list(ids).as_bytes())
}

/// Parses one `node.xml`, resolving blobs in `blob_dirs` in order. Without
/// `with_blobs` no blob file is read and blob widgets come back empty.
fn parse_node_file(xml_path: &Path, blob_dirs: &[&Path], with_blobs: bool) -> Result<ParsedNode> {
    let xml = fs::read_to_string(xml_path).with_context(|| format!("reading {}", xml_path.display()))?;
    let load = |sha: &str, ext: &str| -> Result<Vec<u8>> {
        if !with_blobs {
            return Ok(Vec::new());
        }
        let name = format!("{sha}.{ext}");
        for dir in blob_dirs {
            let candidate = dir.join(&name);
            if candidate.is_file() {
                return fs::read(&candidate).with_context(|| format!("reading {}", candidate.display()));
            }
        }
        bail!("blob {name} not found")
    };
    let tree = xml_codec::parse_tree(&xml, &load).with_context(|| format!("parsing {}", xml_path.display()))?;
    tree.nodes.into_iter().next().ok_or_else(|| anyhow!("{} holds no <node>", xml_path.display()))
}

/// Reads a node directory, falling back to its staged and backup copies newest first.
/// Returns the backup directory used, if any.
fn read_node(node_dir: &Path, with_blobs: bool) -> Result<(ParsedNode, Option<PathBuf>)> {
    let xml_path = node_dir.join(NODE_XML);
    let err = match parse_node_file(&xml_path, &[node_dir], with_blobs) {
        Ok(node) => return Ok((node, None)),
        Err(err) => err,
    };
    let mut candidates = vec![node_dir.join(BEFORE_DIR)];
    let mut generation = 1;
    while node_backup_dir(node_dir, generation).is_dir() {
        candidates.push(node_backup_dir(node_dir, generation));
        generation += 1;
    }
    for bkp in candidates {
        let bkp_xml = bkp.join(NODE_XML);
        if !bkp_xml.is_file() {
            continue;
        }
        match parse_node_file(&bkp_xml, &[bkp.as_path(), node_dir], with_blobs) {
            Ok(node) => {
                log::warn!("{} unreadable ({err:#}), recovered from {}", xml_path.display(), bkp.display());
                return Ok((node, Some(bkp)));
            }
            Err(e) => log::debug!("backup {} unusable: {e:#}", bkp_xml.display()),
        }
    }
    Err(err.context(format!("no readable backup for {}", xml_path.display())))
}

/// Serializes one node as a standalone `<node>` fragment with blobs referenced by digest.
fn encode_node(
    id: NodeId,
    master: Option<NodeId>,
    props: &NodeProps,
    content: Option<&NodeContent>,
    cache: Option<&StorageCache>,
    owner: Option<NodeId>,
) -> Result<Vec<u8>> {
    let mut w = xml_codec::new_writer();
    xml_codec::write_decl(&mut w)?;
    xml_codec::write_node_start(&mut w, id, master, props)?;
    if let Some(content) = content {
        xml_codec::write_content(&mut w, content, &BlobWrite { mode: BlobMode::Sha256, cache, owner })?;
    }
    xml_codec::write_node_end(&mut w)?;
    Ok(w.into_inner())
}

/// Writes each blob of `content` as `<sha256>.<ext>` unless already present.
/// Digests come from `cache` when `owner` is the node the widget list belongs to.
fn save_blobs(
    node_dir: &Path,
    content: &NodeContent,
    cache: Option<&StorageCache>,
    owner: Option<NodeId>,
) -> Result<usize> {
    let mut written = 0;
    for (index, widget) in content.widgets.iter().enumerate() {
        let Some(bytes) = widget.kind.blob() else { continue };
        let cached = owner.zip(cache).and_then(|(node, cache)| cache.get(WidgetKey { node, index }));
        let digest = match cached {
            Some(blob) => blob.sha256.clone(),
            None => sha256_hex(bytes),
        };
        let path = node_dir.join(format!("{digest}.{}", widget.kind.blob_ext()));
        if path.exists() {
            continue;
        }
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        written += 1;
    }
    Ok(written)
}

/// One node per directory, nested like the tree.
///
/// ```text
/// root/
///   subnodes.lst          1,4
///   bookmarks.lst         4
///   1/
///     node.xml
///     subnodes.lst        2
///     <sha256>.png
///     2/node.xml
///   4/node.xml
/// ```
///
/// Loading reads props only; a node's content is parsed on first access. Saves
/// rewrite only dirty nodes. The previous `node.xml` of a rewritten node is kept
/// in `.before/` until the background worker rotates it into `.bkp~`. Removed
/// node dirs are rotated into `<id>~` copies, children before their parent.
#[derive(Debug, Default)]
pub struct MultiFileEntity {
    root: Option<PathBuf>,
    dirs: HashMap<NodeId, PathBuf>,
    /// Content of nodes whose `node.xml` was recovered from a backup on load.
    delayed: DelayedBuffers,
    jobs: DiskJobs,
}

impl MultiFileEntity {
    pub fn new() -> Self {
        Self::default()
    }

    fn root(&self) -> Result<&Path> {
        Ok(self.root.as_deref().ok_or(StorageError::NotOpened)?)
    }

    fn dir_of(&self, id: NodeId) -> Result<PathBuf> {
        if id.is_root() {
            return Ok(self.root()?.to_path_buf());
        }
        self.dirs.get(&id).cloned().ok_or_else(|| anyhow!("no directory known for node {id}"))
    }

    /// Parent id of a node directory, by reverse lookup.
    fn owner_of_dir(&self, dir: &Path) -> Option<NodeId> {
        if self.root.as_deref() == Some(dir) {
            return Some(NodeId::ROOT);
        }
        self.dirs.iter().find(|(_, d)| d.as_path() == dir).map(|(id, _)| *id)
    }

    /// Looks for a directory named `id` anywhere below the root, skipping backups.
    fn search_dir(&self, id: NodeId) -> Result<Option<PathBuf>> {
        let name = id.0.to_string();
        let walker = WalkDir::new(self.root()?).min_depth(1).into_iter();
        for entry in walker.filter_entry(|e| e.depth() == 0 || is_node_dir_name(e.file_name())) {
            let entry = entry?;
            if entry.file_type().is_dir() && entry.file_name().to_str() == Some(name.as_str()) {
                return Ok(Some(entry.into_path()));
            }
        }
        Ok(None)
    }

    /// Re-points `from` and everything indexed below it at `to`.
    fn rebase_index(&mut self, from: &Path, to: &Path) {
        for dir in self.dirs.values_mut() {
            if let Ok(rest) = dir.strip_prefix(from) {
                *dir = if rest.as_os_str().is_empty() { to.to_path_buf() } else { to.join(rest) };
            }
        }
    }

    /// Reads the content of `id` from its directory, falling back to backups.
    fn read_content(&self, id: NodeId) -> Result<NodeContent> {
        let dir = self.dir_of(id)?;
        let (parsed, _) = read_node(&dir, true).with_context(|| format!("loading content of node {id}"))?;
        Ok(parsed.content)
    }

    /// Content of master `id` from memory, or from disk when it was never loaded.
    fn owned_content(&self, doc: &Document, id: NodeId) -> Result<NodeContent> {
        match doc.content(id).or_else(|| self.delayed.peek(id)) {
            Some(content) => Ok(content.clone()),
            None => self.read_content(id),
        }
    }

    fn write_full(&mut self, req: &SaveRequest<'_>) -> Result<HashMap<NodeId, PathBuf>> {
        let plan = req.plan()?;
        if req.path.exists() {
            fs::remove_dir_all(req.path).with_context(|| format!("clearing {}", req.path.display()))?;
        }
        fs::create_dir_all(req.path).with_context(|| format!("creating {}", req.path.display()))?;

        let mut dirs: HashMap<NodeId, PathBuf> = HashMap::new();
        for node in &plan.nodes {
            let parent_dir = if node.parent.is_root() {
                req.path.to_path_buf()
            } else {
                dirs.get(&node.parent).cloned().ok_or_else(|| anyhow!("parent of node {} not written", node.id))?
            };
            let dir = parent_dir.join(node.id.0.to_string());
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

            let props = req.document.props(node.source).ok_or(StorageError::NodeNotFound(node.source))?;
            let bytes = if node.master.is_some() {
                encode_node(node.id, node.master, props, None, None, None)?
            } else {
                let content = self.owned_content(req.document, node.source)?;
                match node.range {
                    Some((start, end)) => {
                        let sliced = content.slice(start, end);
                        save_blobs(&dir, &sliced, None, None)?;
                        encode_node(node.id, None, props, Some(&sliced), req.cache, None)?
                    }
                    None => {
                        save_blobs(&dir, &content, req.cache, Some(node.source))?;
                        encode_node(node.id, None, props, Some(&content), req.cache, Some(node.source))?
                    }
                }
            };
            fs::write(dir.join(NODE_XML), bytes).with_context(|| format!("writing node {} in {}", node.id, dir.display()))?;
            dirs.insert(node.id, dir);
        }

        write_list(&req.path.join(SUBNODES_LST), &plan.children_of(NodeId::ROOT))?;
        for (id, dir) in &dirs {
            let kids = plan.children_of(*id);
            if !kids.is_empty() {
                write_list(&dir.join(SUBNODES_LST), &kids)?;
            }
        }
        write_list(&req.path.join(BOOKMARKS_LST), &plan.bookmarks)?;
        log::debug!("wrote {} node directories under {}", dirs.len(), req.path.display());
        Ok(dirs)
    }

    /// Rewrites `node.xml` of an existing node, staging the old file and re-parsing the new one.
    fn rewrite_node(
        &mut self,
        dir: &Path,
        bytes: &[u8],
        content: Option<&NodeContent>,
        cache: Option<&StorageCache>,
        owner: NodeId,
    ) -> Result<()> {
        let live = dir.join(NODE_XML);
        let staged_dir = dir.join(BEFORE_DIR);
        let staged = staged_dir.join(NODE_XML);
        let had_old = live.is_file();
        if had_old {
            fs::create_dir_all(&staged_dir).with_context(|| format!("creating {}", staged_dir.display()))?;
            fs::rename(&live, &staged).with_context(|| format!("staging {}", live.display()))?;
        }
        let result = (|| -> Result<()> {
            if let Some(content) = content {
                save_blobs(dir, content, cache, Some(owner))?;
            }
            fs::write(&live, bytes).with_context(|| format!("writing {}", live.display()))?;
            parse_node_file(&live, &[dir], true).context("re-reading the written node")?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                if had_old && !self.jobs.staged.contains(&staged_dir) {
                    self.jobs.staged.push(staged_dir);
                }
                Ok(())
            }
            Err(err) => {
                if had_old {
                    if let Err(e) = fs::rename(&staged, &live) {
                        log::error!("could not restore {} from {}: {e}", live.display(), staged.display());
                    }
                }
                Err(err)
            }
        }
    }

    /// Puts the directory of `id` under its parent's directory, moving it if it lives elsewhere.
    /// Returns the parent whose list lost the node, if it moved.
    fn place_dir(&mut self, id: NodeId, parent: NodeId) -> Result<(PathBuf, Option<NodeId>)> {
        let expected = self.dir_of(parent)?.join(id.0.to_string());
        let current = match self.dirs.get(&id) {
            Some(d) if d.is_dir() => Some(d.clone()),
            _ => self.search_dir(id)?,
        };
        let mut old_parent = None;
        match current {
            Some(cur) if cur != expected => {
                old_parent = cur.parent().and_then(|p| self.owner_of_dir(p));
                fs::rename(&cur, &expected)
                    .with_context(|| format!("moving {} to {}", cur.display(), expected.display()))?;
                log::debug!("moved node {id} from {} to {}", cur.display(), expected.display());
                self.rebase_index(&cur, &expected);
            }
            Some(_) => {}
            None => fs::create_dir_all(&expected).with_context(|| format!("creating {}", expected.display()))?,
        }
        self.dirs.insert(id, expected.clone());
        Ok((expected, old_parent))
    }

    fn write_incremental(&mut self, req: &SaveRequest<'_>) -> Result<()> {
        let doc = req.document;
        let pending = req.sync_pending;
        let mut relist: BTreeSet<NodeId> = BTreeSet::new();

        let mut dirty: Vec<_> = pending
            .nodes_to_write
            .iter()
            .filter(|(id, _)| doc.contains(**id))
            .map(|(id, st)| (*id, *st))
            .collect();
        dirty.sort_by_key(|(id, _)| (doc.depth(*id), *id));

        for (id, state) in &dirty {
            let parent = doc.parent_of(*id).unwrap_or(NodeId::ROOT);
            let dir = if state.is_new() || state.hier {
                let (dir, old_parent) = self.place_dir(*id, parent)?;
                relist.insert(parent);
                relist.extend(old_parent);
                dir
            } else {
                self.dir_of(*id)?
            };
            if !(state.is_new() || state.prop || state.buff) {
                continue;
            }
            let node = doc.node(*id).ok_or(StorageError::NodeNotFound(*id))?;
            let master = node.alias_master();
            let props = doc.props(*id).ok_or(StorageError::NodeNotFound(*id))?;
            let content = match master {
                Some(_) => None,
                None => Some(self.owned_content(doc, *id)?),
            };
            let bytes = encode_node(*id, master, props, content.as_ref(), req.cache, Some(*id))?;
            // a recovered copy is stale once the node is rewritten
            self.delayed.take(*id);
            self.rewrite_node(&dir, &bytes, content.as_ref(), req.cache, *id)
                .with_context(|| format!("saving node {id} in {}", dir.display()))?;
        }

        let mut to_rm: Vec<NodeId> = pending.nodes_to_rm.iter().copied().collect();
        to_rm.sort();
        for id in to_rm {
            let Some(dir) = self.dirs.get(&id).cloned().filter(|d| d.is_dir()) else {
                log::debug!("removed node {id} has no directory");
                continue;
            };
            if let Some(parent) = dir.parent().and_then(|p| self.owner_of_dir(p)) {
                relist.insert(parent);
            }
            let walker = WalkDir::new(&dir)
                .contents_first(true)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || is_node_dir_name(e.file_name()));
            for entry in walker {
                let entry = entry?;
                if entry.file_type().is_dir() && !self.jobs.removed.iter().any(|d| d.as_path() == entry.path()) {
                    self.jobs.removed.push(entry.into_path());
                }
            }
            self.dirs.retain(|_, d| !d.starts_with(&dir));
        }

        for parent in relist {
            if !parent.is_root() && !doc.contains(parent) {
                continue;
            }
            let dir = self.dir_of(parent)?;
            write_list(&dir.join(SUBNODES_LST), doc.children(parent))?;
        }
        if pending.bookmarks_to_write {
            write_list(&self.root()?.join(BOOKMARKS_LST), doc.bookmarks())?;
        }
        log::debug!("incremental save: {} nodes written, {} removed", dirty.len(), pending.nodes_to_rm.len());
        Ok(())
    }
}

impl StorageEntity for MultiFileEntity {
    fn doc_type(&self) -> DocType {
        DocType::MultiFile
    }

    fn populate_treestore(&mut self, path: &Path, doc: &mut Document, mode: LoadMode) -> Result<PopulateReport> {
        if !path.is_dir() {
            return Err(StorageError::FileMissing(path.to_path_buf()).into());
        }
        let mut report = PopulateReport::default();
        let mut builder = DocumentBuilder::new();
        let mut recovered_contents = Vec::new();
        let mut row_dirs = Vec::new();
        // a normal load only reads props; content is parsed on first access
        let with_blobs = mode == LoadMode::DryRun;

        let mut queue: VecDeque<(PathBuf, Option<usize>)> = VecDeque::from([(path.to_path_buf(), None)]);
        while let Some((dir, parent_row)) = queue.pop_front() {
            for (seq, id) in read_list(&dir.join(SUBNODES_LST))?.into_iter().enumerate() {
                let node_dir = dir.join(id.0.to_string());
                if !node_dir.is_dir() {
                    report.warnings.push(format!("node {id} listed in {} has no directory", dir.display()));
                    continue;
                }
                let (parsed, recovered) = read_node(&node_dir, with_blobs)?;
                let mut recovered_content = None;
                if let Some(bkp) = recovered {
                    let xml_path = node_dir.join(NODE_XML);
                    report.warnings.push(format!("{} was unreadable, loaded backup {}", xml_path.display(), bkp.display()));
                    report.recovered_paths.push(xml_path);
                    // backup slots shift on the next rotation, so keep what was recovered
                    if parsed.master.is_none() && mode == LoadMode::Normal {
                        recovered_content = Some(read_node(&node_dir, true)?.0.content);
                    }
                }
                let row = builder.push_nested(
                    parent_row,
                    LoadedNode {
                        id: parsed.id,
                        sequence: seq as i64,
                        master: parsed.master,
                        props: parsed.props,
                        content: None,
                    },
                );
                recovered_contents.push(recovered_content);
                row_dirs.push(node_dir.clone());
                queue.push_back((node_dir, Some(row)));
            }
        }
        let bookmarks = read_list(&path.join(BOOKMARKS_LST))?;
        builder.set_bookmarks(bookmarks);
        let (built, build) = builder.build();
        report.warnings.extend(build.warnings);
        report.reassigned_ids = build.reassigned;

        if mode == LoadMode::DryRun {
            log::debug!("dry run of {} ok, {} nodes", path.display(), built.len());
            return Ok(report);
        }
        self.delayed.clear();
        self.dirs.clear();
        self.jobs = DiskJobs::default();
        for ((id, content), dir) in build.row_ids.into_iter().zip(recovered_contents).zip(row_dirs) {
            if let Some(content) = content {
                self.delayed.insert(id, content);
            }
            self.dirs.insert(id, dir);
        }
        self.root = Some(path.to_path_buf());
        *doc = built;
        log::info!("loaded {} nodes from {}", doc.len(), path.display());
        Ok(report)
    }

    fn save_treestore(&mut self, req: &SaveRequest<'_>) -> Result<()> {
        if !req.export.is_export() && self.root.as_deref() == Some(req.path) {
            return self.write_incremental(req);
        }
        let dirs = self.write_full(req).with_context(|| format!("writing {}", req.path.display()))?;
        if !req.export.is_export() {
            self.root = Some(req.path.to_path_buf());
            self.dirs = dirs;
            self.delayed.clear();
            self.jobs = DiskJobs::default();
        }
        Ok(())
    }

    fn get_delayed_text_buffer(&mut self, id: NodeId, _syntax: &str) -> Result<NodeContent> {
        match self.delayed.take(id) {
            Some(content) => Ok(content),
            None => self.read_content(id),
        }
    }

    fn import_nodes(&mut self, path: &Path, doc: &mut Document, parent: NodeId) -> Result<Vec<NodeId>> {
        import_with(Box::new(MultiFileEntity::new()), path, doc, parent)
    }

    fn test_connection(&mut self) -> Result<()> {
        let Some(root) = self.root.clone() else { return Ok(()) };
        if !root.is_dir() {
            return Err(StorageError::FileMissing(root).into());
        }
        check_writable(&root)
    }

    fn take_disk_jobs(&mut self) -> DiskJobs {
        std::mem::take(&mut self.jobs)
    }
}
