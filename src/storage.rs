//! Persistence backends.
//!
//! A document is stored in one of three physical formats, all behind the
//! [`StorageEntity`] trait:
//!
//! - **SQLite** ([`sqlite::SqliteEntity`]): one database file (`.ctb`), six
//!   tables, incremental writes per dirty aspect.
//! - **XML** ([`xml::XmlEntity`]): one `<cherrytree>` XML file (`.ctd`),
//!   rewritten in full on every save.
//! - **MultiFile** ([`multifile::MultiFileEntity`]): a directory per node with
//!   `node.xml`, `subnodes.lst` and content-addressed blobs.
//!
//! Encrypted variants (`.ctx`, `.ctz`) are the same formats packed in an archive;
//! backends only ever see the plaintext copy, the
//! [`StorageControl`](crate::control::StorageControl) handles the packing.
//!
//! # Contract
//!
//! - `populate_treestore` rebuilds a [`Document`] from disk. In
//!   [`LoadMode::DryRun`] it only validates, leaving the entity untouched.
//! - `save_treestore` writes everything on the first save of an entity and only
//!   the dirty aspects in [`SyncPending`] afterwards.
//! - `get_delayed_text_buffer` materializes one node's content on demand.
//! - `import_nodes` grafts a foreign document of the same format.
//!
//! Backends report failures as `anyhow` errors with file context; a
//! [`StorageError`] raised inside survives the conversion unchanged.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::document::{Document, ExportScope, MasterReassign, NodeContent, NodeId};
use crate::errors::StorageError;
use crate::sync::SyncPending;

/// Parallel blob pre-computation for one save.
pub mod cache;
/// Directory-per-node backend.
pub mod multifile;
/// SQLite single-file backend.
#[cfg(feature = "sqlite_store")]
pub mod sqlite;
/// XML single-file backend.
pub mod xml;
/// `<node>` element codec shared by the XML and MultiFile backends.
pub mod xml_codec;

pub use cache::{CachedBlob, StorageCache, WidgetKey};
pub use multifile::MultiFileEntity;
#[cfg(feature = "sqlite_store")]
pub use sqlite::SqliteEntity;
pub use xml::XmlEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocType {
    Sqlite,
    Xml,
    MultiFile,
}

impl DocType {
    /// Whether blobs travel as text (base64) in this format.
    pub fn wants_base64(self) -> bool {
        matches!(self, DocType::Xml)
    }
}

/// On-disk format of a document path: backend plus archive wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocFormat {
    pub doc_type: DocType,
    pub encrypted: bool,
}

impl DocFormat {
    pub const fn new(doc_type: DocType, encrypted: bool) -> Self {
        Self { doc_type, encrypted }
    }

    /// Detects the format from the extension. Directories and extension-less paths
    /// are MultiFile documents.
    pub fn detect(path: &Path) -> crate::errors::Result<Self> {
        if path.is_dir() {
            return Ok(Self::new(DocType::MultiFile, false));
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("ctb") => Ok(Self::new(DocType::Sqlite, false)),
            Some("ctx") => Ok(Self::new(DocType::Sqlite, true)),
            Some("ctd") => Ok(Self::new(DocType::Xml, false)),
            Some("ctz") => Ok(Self::new(DocType::Xml, true)),
            None => Ok(Self::new(DocType::MultiFile, false)),
            Some(_) => Err(StorageError::UnknownDocType(path.to_path_buf())),
        }
    }

    /// Extension of the plaintext file the backend reads and writes.
    pub fn plain_extension(&self) -> Option<&'static str> {
        match self.doc_type {
            DocType::Sqlite => Some("ctb"),
            DocType::Xml => Some("ctd"),
            DocType::MultiFile => None,
        }
    }

    pub fn is_single_file(&self) -> bool {
        self.doc_type != DocType::MultiFile
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Populate the document and keep the entity bound to the file.
    #[default]
    Normal,
    /// Parse and validate everything; the entity stays unbound.
    DryRun,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateReport {
    pub warnings: Vec<String>,
    /// Files that could not be read and were replaced by a backup copy.
    pub recovered_paths: Vec<PathBuf>,
    /// `(id as stored, id assigned)` for duplicate ids found on load.
    pub reassigned_ids: Vec<(NodeId, NodeId)>,
}

/// Everything one call to [`StorageEntity::save_treestore`] needs.
pub struct SaveRequest<'a> {
    pub path: &'a Path,
    pub document: &'a Document,
    pub sync_pending: &'a SyncPending,
    pub export: ExportScope,
    pub master_reassign: MasterReassign,
    pub cache: Option<&'a StorageCache>,
}

impl<'a> SaveRequest<'a> {
    pub fn new(path: &'a Path, document: &'a Document, sync_pending: &'a SyncPending) -> Self {
        Self {
            path,
            document,
            sync_pending,
            export: ExportScope::NoneSave,
            master_reassign: MasterReassign::new(),
            cache: None,
        }
    }

    pub fn with_export(mut self, export: ExportScope, reassign: MasterReassign) -> Self {
        self.export = export;
        self.master_reassign = reassign;
        self
    }

    pub fn with_cache(mut self, cache: &'a StorageCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn plan(&self) -> crate::errors::Result<crate::document::WritePlan> {
        self.document.write_plan(self.export, &self.master_reassign)
    }
}

/// Filesystem leftovers of a MultiFile save, handed to the background worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskJobs {
    /// `.before` directories holding the previous version of rewritten nodes.
    pub staged: Vec<PathBuf>,
    /// Directories of removed nodes, children before parents.
    pub removed: Vec<PathBuf>,
}

impl DiskJobs {
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty() && self.removed.is_empty()
    }
}

/// Node content parsed at load time and handed out on first access.
#[derive(Debug, Default)]
pub struct DelayedBuffers {
    buffers: HashMap<NodeId, NodeContent>,
}

impl DelayedBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: NodeId, content: NodeContent) {
        self.buffers.insert(id, content);
    }

    /// Returns the buffer and forgets it.
    pub fn take(&mut self, id: NodeId) -> Option<NodeContent> {
        self.buffers.remove(&id)
    }

    pub fn peek(&self, id: NodeId) -> Option<&NodeContent> {
        self.buffers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

/// One persisted document format.
pub trait StorageEntity: Send {
    fn doc_type(&self) -> DocType;

    /// Rebuilds `doc` from the file or directory at `path`.
    fn populate_treestore(&mut self, path: &Path, doc: &mut Document, mode: LoadMode) -> Result<PopulateReport>;

    /// Writes the document; see the module docs for full vs incremental behaviour.
    fn save_treestore(&mut self, req: &SaveRequest<'_>) -> Result<()>;

    /// Content of `id` that was left out of the populated document.
    fn get_delayed_text_buffer(&mut self, id: NodeId, syntax: &str) -> Result<NodeContent>;

    /// Grafts every node of the document at `path` under `parent`, returning the new ids.
    fn import_nodes(&mut self, path: &Path, doc: &mut Document, parent: NodeId) -> Result<Vec<NodeId>>;

    fn close_connect(&mut self) {}

    fn reopen_connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Checks the bound file is still usable, reconnecting if needed.
    fn test_connection(&mut self) -> Result<()> {
        Ok(())
    }

    fn vacuum(&mut self) -> Result<()> {
        Ok(())
    }

    /// Filesystem work left behind by the last save.
    fn take_disk_jobs(&mut self) -> DiskJobs {
        DiskJobs::default()
    }
}

/// A fresh, unbound entity for `doc_type`.
pub fn entity_for(doc_type: DocType) -> crate::errors::Result<Box<dyn StorageEntity>> {
    match doc_type {
        #[cfg(feature = "sqlite_store")]
        DocType::Sqlite => Ok(Box::new(SqliteEntity::new())),
        #[cfg(not(feature = "sqlite_store"))]
        DocType::Sqlite => Err(StorageError::BackendUnavailable("sqlite")),
        DocType::Xml => Ok(Box::new(XmlEntity::new())),
        DocType::MultiFile => Ok(Box::new(MultiFileEntity::new())),
    }
}

/// Loads `path` with a throwaway entity, materializes all content, and grafts it
/// under `parent`.
pub(crate) fn import_with(
    mut foreign: Box<dyn StorageEntity>,
    path: &Path,
    doc: &mut Document,
    parent: NodeId,
) -> Result<Vec<NodeId>> {
    let mut other = Document::new();
    foreign
        .populate_treestore(path, &mut other, LoadMode::Normal)
        .with_context(|| format!("importing {}", path.display()))?;
    materialize_all(foreign.as_mut(), &mut other)?;
    foreign.close_connect();
    let added = doc.graft(&other, parent)?;
    log::info!("imported {} nodes from {}", added.len(), path.display());
    Ok(added)
}

/// Fills in every content buffer the entity left out.
pub(crate) fn materialize_all(entity: &mut dyn StorageEntity, doc: &mut Document) -> Result<()> {
    for id in doc.unloaded_masters() {
        let syntax = doc.props(id).map(|p| p.syntax.clone()).unwrap_or_default();
        let content = entity.get_delayed_text_buffer(id, &syntax)?;
        doc.set_content(id, content)?;
    }
    Ok(())
}

/// Content to write for `source`: the document's copy, or the entity's delayed one.
pub(crate) fn content_for<'a>(
    doc: &'a Document,
    delayed: &'a DelayedBuffers,
    source: NodeId,
) -> Result<&'a NodeContent> {
    doc.content(source)
        .or_else(|| delayed.peek(source))
        .ok_or_else(|| anyhow::anyhow!("content of node {source} is not loaded"))
}

/// Writes `bytes` to `path` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).with_context(|| format!("creating temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, bytes).with_context(|| format!("writing {}", path.display()))?;
    tmp.persist(path).map_err(|e| e.error).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Fails with a typed error when `path` cannot be written. A file is replaced
/// through its directory on save, so that directory must be writable too.
pub(crate) fn check_writable(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|_| StorageError::FileMissing(path.to_path_buf()))?;
    if meta.permissions().readonly() {
        return Err(StorageError::NotWritable(path.to_path_buf()).into());
    }
    if meta.is_file() {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            check_writable(dir)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_formats_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(DocFormat::detect(Path::new("a.ctb")).unwrap(), DocFormat::new(DocType::Sqlite, false));
        assert_eq!(DocFormat::detect(Path::new("a.ctx")).unwrap(), DocFormat::new(DocType::Sqlite, true));
        assert_eq!(DocFormat::detect(Path::new("a.ctd")).unwrap(), DocFormat::new(DocType::Xml, false));
        assert_eq!(DocFormat::detect(Path::new("a.ctz")).unwrap(), DocFormat::new(DocType::Xml, true));
        assert_eq!(DocFormat::detect(dir.path()).unwrap().doc_type, DocType::MultiFile);
        assert!(matches!(DocFormat::detect(Path::new("a.txt")), Err(StorageError::UnknownDocType(_))));
    }

    #[test]
    fn delayed_take_evicts() {
        let mut d = DelayedBuffers::new();
        d.insert(NodeId(1), NodeContent::plain("x"));
        assert!(d.peek(NodeId(1)).is_some());
        assert_eq!(d.take(NodeId(1)), Some(NodeContent::plain("x")));
        assert!(d.take(NodeId(1)).is_none());
        assert!(d.is_empty());
    }

    #[test]
    fn write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.txt");
        write_atomic(&p, b"one").unwrap();
        write_atomic(&p, b"two").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"two");
    }

    #[cfg(unix)]
    #[test]
    fn read_only_directory_is_not_writable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("doc.ctd");
        fs::write(&p, b"x").unwrap();
        check_writable(&p).unwrap();

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555)).unwrap();
        let err = check_writable(&p).unwrap_err();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
        match StorageError::from(err) {
            StorageError::NotWritable(path) => assert_eq!(path, dir.path()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_typed() {
        let err = check_writable(Path::new("/nonexistent/x.ctb")).unwrap_err();
        assert!(matches!(StorageError::from(err), StorageError::FileMissing(_)));
    }
}
