//! Orchestration of one open document.
//!
//! [`StorageControl`] owns the in-memory [`Document`], the [`SyncPending`] ledger
//! and the [`StorageEntity`] bound to the file on disk. It drives the save
//! protocol:
//!
//! 1. set the live file aside as `<name>.<micros>` (copied for plain SQLite,
//!    whose connection must keep its file, moved otherwise),
//! 2. let the entity write the pending deltas,
//! 3. on failure put the set-aside copy back, so the file on disk is never worse
//!    than before the save,
//! 4. on success queue a job for the background worker: tilde rotation of the
//!    set-aside copy and, for encrypted documents, re-archiving the plaintext.
//!
//! Encrypted documents (`.ctx`, `.ctz`) are extracted into a private temp
//! directory on load; the entity only ever sees that plaintext copy, which is
//! deleted when the document is closed or fails to load.
//!
//! Errors raised by the worker never fail a save. They are logged and can be
//! read from [`StorageControl::errors`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use tempfile::TempDir;

use crate::config::StorageConfig;
use crate::document::{now_ts, Document, ExportScope, MasterReassign, NodeContent, NodeId, NodeProps, RemovedSubtree};
use crate::errors::{Result, StorageError};
use crate::storage::{
    check_writable, entity_for, materialize_all, DocFormat, DocType, LoadMode, PopulateReport, SaveRequest, StorageCache,
    StorageEntity,
};
use crate::sync::SyncPending;

mod backup;
pub mod packaging;
mod worker;

pub use packaging::{Packager, SevenZipPackager, STATUS_BAD_ARCHIVE, STATUS_OK, STATUS_WRONG_PASSWORD};
use worker::{BackupJob, BackupKind, BackupWorker, EncryptJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Unopened,
    Clean,
    Dirty,
    Saving,
}

/// Supplies passwords for encrypted documents.
pub trait PasswordPrompt {
    /// Asks for the password of `archive`. `None` cancels.
    fn password(&mut self, archive: &Path) -> Option<String>;
}

impl<F> PasswordPrompt for F
where
    F: FnMut(&Path) -> Option<String>,
{
    fn password(&mut self, archive: &Path) -> Option<String> {
        self(archive)
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded { control: Box<StorageControl>, report: PopulateReport },
    /// The password prompt was dismissed.
    Cancelled,
}

/// The file a document is bound to.
struct Binding {
    format: DocFormat,
    /// Path the user sees; the archive for encrypted documents.
    path: PathBuf,
    /// Path the entity reads and writes.
    plain_path: PathBuf,
    password: Option<String>,
    entity: Box<dyn StorageEntity>,
    /// Plaintext copy of an encrypted document, deleted on drop.
    extracted: Option<TempDir>,
    /// The entity has read or written `plain_path` at least once.
    bound: bool,
}

impl Binding {
    /// An unbound entity for writing a new document at `path`.
    fn for_target(path: &Path, password: Option<String>, config: &StorageConfig) -> Result<Self> {
        let format = DocFormat::detect(path)?;
        let (plain_path, extracted, password) = if format.encrypted {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| StorageError::WrongPassword(path.to_path_buf()))?;
            let dir = scratch_dir(config)?;
            let plain = dir.path().join(plain_name(path, format));
            (plain, Some(dir), Some(password))
        } else {
            if password.is_some() {
                log::warn!("{} is not an encrypted format, password ignored", path.display());
            }
            (path.to_path_buf(), None, None)
        };
        Ok(Self {
            format,
            path: path.to_path_buf(),
            plain_path,
            password,
            entity: entity_for(format.doc_type)?,
            extracted,
            bound: false,
        })
    }
}

/// Where the live file went during a save.
struct SetAside {
    backup: PathBuf,
    moved: bool,
}

struct Extracted {
    dir: TempDir,
    plain: PathBuf,
    password: String,
}

pub struct StorageControl {
    config: StorageConfig,
    packager: Arc<dyn Packager>,
    document: Document,
    sync: SyncPending,
    binding: Option<Binding>,
    worker: BackupWorker,
    errors: Receiver<StorageError>,
    state: ControlState,
}

impl fmt::Debug for StorageControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageControl")
            .field("path", &self.path())
            .field("state", &self.state)
            .field("nodes", &self.document.len())
            .finish()
    }
}

impl StorageControl {
    fn open(config: StorageConfig, packager: Arc<dyn Packager>, document: Document, binding: Binding) -> Result<Self> {
        let (err_tx, errors) = unbounded();
        let worker = BackupWorker::spawn(config.clone(), packager.clone(), err_tx)?;
        Ok(Self {
            config,
            packager,
            document,
            sync: SyncPending::new(),
            binding: Some(binding),
            worker,
            errors,
            state: ControlState::Clean,
        })
    }

    /// Writes `document` as a new file at `path`. Encrypted formats need a password.
    pub fn create_new(
        document: Document,
        path: &Path,
        password: Option<String>,
        config: StorageConfig,
        packager: Arc<dyn Packager>,
    ) -> Result<Self> {
        let binding = Binding::for_target(path, password, &config)?;
        let mut control = Self::open(config, packager, document, binding)?;
        for id in control.document.unloaded_masters() {
            let syntax = control.document.props(id).map(|p| p.syntax.clone()).unwrap_or_default();
            control.document.set_content(id, NodeContent::empty_for(&syntax))?;
        }
        control.mark_all_new();
        control.save(false)?;
        log::info!("created {} with {} nodes", path.display(), control.document.len());
        Ok(control)
    }

    /// Opens the document at `path`, asking `prompt` for the password of an
    /// encrypted one until it is right or the prompt is cancelled.
    pub fn load_from(
        path: &Path,
        config: StorageConfig,
        packager: Arc<dyn Packager>,
        prompt: &mut dyn PasswordPrompt,
    ) -> Result<LoadOutcome> {
        if !path.exists() {
            return Err(StorageError::FileMissing(path.to_path_buf()));
        }
        let format = DocFormat::detect(path)?;
        let (plain_path, extracted, password) = if format.encrypted {
            match extract(path, format, &config, packager.as_ref(), prompt)? {
                Some(x) => (x.plain, Some(x.dir), Some(x.password)),
                None => {
                    log::info!("opening {} cancelled", path.display());
                    return Ok(LoadOutcome::Cancelled);
                }
            }
        } else {
            (path.to_path_buf(), None, None)
        };

        // an early return drops `extracted`, taking the plaintext with it
        let mut entity = entity_for(format.doc_type)?;
        let mut document = Document::new();
        let report = entity.populate_treestore(&plain_path, &mut document, LoadMode::Normal)?;
        for warning in &report.warnings {
            log::warn!("{}: {warning}", path.display());
        }

        let binding = Binding {
            format,
            path: path.to_path_buf(),
            plain_path,
            password,
            entity,
            extracted,
            bound: true,
        };
        let mut control = Self::open(config, packager, document, binding)?;
        for (stored, assigned) in &report.reassigned_ids {
            log::warn!("duplicate node id {stored} in {} now {assigned}", path.display());
            control.sync.pending_new(*assigned);
            for child in control.document.children(*assigned).to_vec() {
                control.sync.pending_edit_hier(child);
            }
        }
        if !control.sync.is_empty() {
            control.state = ControlState::Dirty;
        }
        log::info!("loaded {} ({} nodes)", path.display(), control.document.len());
        Ok(LoadOutcome::Loaded { control: Box::new(control), report })
    }

    /// Writes the pending changes. A bound document without pending changes is left alone.
    pub fn save(&mut self, need_vacuum: bool) -> Result<()> {
        let binding = self.binding.as_ref().ok_or(StorageError::NotOpened)?;
        if binding.bound && self.sync.is_empty() && !need_vacuum {
            log::debug!("nothing to save in {}", binding.path.display());
            return Ok(());
        }
        self.state = ControlState::Saving;
        match self.save_inner(need_vacuum) {
            Ok(()) => {
                self.sync.clear();
                self.state = ControlState::Clean;
                Ok(())
            }
            Err(err) => {
                log::error!("save failed: {err}");
                self.state = ControlState::Dirty;
                Err(err)
            }
        }
    }

    fn save_inner(&mut self, need_vacuum: bool) -> Result<()> {
        self.load_pending_content()?;
        let Self { config, document, sync, binding, worker, .. } = self;
        let binding = binding.as_mut().ok_or(StorageError::NotOpened)?;
        if binding.bound {
            binding.entity.test_connection()?;
        } else if let Some(dir) = binding.path.parent().filter(|d| d.is_dir()) {
            check_writable(dir)?;
        }
        if !binding.format.is_single_file() {
            // `.before` dirs of the previous save must be rotated before new ones appear
            worker.flush();
        }

        let target_existed = fs::symlink_metadata(&binding.plain_path).is_ok();
        let set_aside = set_aside_live(binding)?;
        let encrypt = match write_document(binding, document, sync).and_then(|()| stage_encryption(binding)) {
            Ok(encrypt) => encrypt,
            Err(err) => {
                rollback(binding, set_aside.as_ref(), target_existed);
                return Err(err);
            }
        };
        binding.bound = true;

        if need_vacuum {
            if let Err(e) = binding.entity.vacuum() {
                log::warn!("vacuum of {} failed: {e:#}", binding.plain_path.display());
            }
        }

        let backup = match set_aside {
            Some(SetAside { backup, .. }) => BackupKind::SingleFile {
                backup,
                live: binding.path.clone(),
                rotate: config.wants_backup(),
            },
            None => {
                let jobs = binding.entity.take_disk_jobs();
                if jobs.is_empty() {
                    BackupKind::None
                } else {
                    BackupKind::NodeDirs { staged: jobs.staged, removed: jobs.removed, rotate: config.wants_backup() }
                }
            }
        };
        if backup != BackupKind::None || encrypt.is_some() {
            worker.push(BackupJob { backup, encrypt })?;
        }
        log::info!("saved {}", binding.path.display());
        Ok(())
    }

    /// Materializes the content of every node the next save writes in full.
    fn load_pending_content(&mut self) -> Result<()> {
        let binding = self.binding.as_mut().ok_or(StorageError::NotOpened)?;
        if !binding.bound {
            return Ok(());
        }
        let mut wanted: Vec<NodeId> = self
            .sync
            .nodes_to_write
            .iter()
            .filter(|(_, st)| st.is_new() || st.buff)
            .filter_map(|(id, _)| self.document.resolve(*id))
            .filter(|id| !self.document.is_content_loaded(*id))
            .collect();
        wanted.sort();
        wanted.dedup();
        for id in wanted {
            load_content(binding.entity.as_mut(), &mut self.document, id)?;
        }
        Ok(())
    }

    /// Writes the whole document to `path` and keeps working on the new file.
    pub fn save_as(&mut self, path: &Path, password: Option<String>) -> Result<()> {
        let current = self.binding.as_mut().ok_or(StorageError::NotOpened)?;
        if current.path == path && current.password == password {
            return self.save(false);
        }
        materialize_all(current.entity.as_mut(), &mut self.document)?;

        let target = Binding::for_target(path, password, &self.config)?;
        let previous = self.binding.replace(target);
        let previous_sync = std::mem::take(&mut self.sync);
        self.mark_all_new();
        match self.save(false) {
            Ok(()) => {
                if let Some(mut old) = previous {
                    old.entity.close_connect();
                    // queued jobs may still read from the old plaintext dir
                    self.worker.flush();
                    log::info!("{} saved as {}", old.path.display(), path.display());
                }
                Ok(())
            }
            Err(err) => {
                self.binding = previous;
                self.sync = previous_sync;
                self.state = if self.sync.is_empty() { ControlState::Clean } else { ControlState::Dirty };
                Err(err)
            }
        }
    }

    /// Writes `scope` to a separate file. The open document stays bound where it was.
    pub fn export_to(&mut self, path: &Path, scope: ExportScope, password: Option<String>) -> Result<()> {
        let binding = self.binding.as_mut().ok_or(StorageError::NotOpened)?;
        materialize_all(binding.entity.as_mut(), &mut self.document)?;

        let scope = match scope {
            ExportScope::NoneSave => ExportScope::AllTree,
            other => other,
        };
        let reassign = match scope {
            ExportScope::Node(id) | ExportScope::NodeAndSubnodes(id) | ExportScope::TextSelection { node: id, .. } => {
                self.document.expo_master_reassign(id)
            }
            _ => MasterReassign::new(),
        };

        let mut target = Binding::for_target(path, password, &self.config)?;
        let cache = StorageCache::generate(&self.document, None, target.format.doc_type.wants_base64());
        let sp = SyncPending::new();
        let req = SaveRequest::new(&target.plain_path, &self.document, &sp)
            .with_export(scope, reassign)
            .with_cache(&cache);
        target.entity.save_treestore(&req)?;
        target.entity.close_connect();

        if let Some(password) = &target.password {
            archive_now(self.packager.as_ref(), &target.plain_path, path, password)?;
        }
        log::info!("exported {scope:?} to {}", path.display());
        Ok(())
    }

    /// Grafts every node of the document at `path` under `parent`. The new nodes
    /// are written on the next save. A cancelled password prompt imports nothing.
    pub fn import_nodes(&mut self, path: &Path, parent: NodeId, prompt: &mut dyn PasswordPrompt) -> Result<Vec<NodeId>> {
        if self.binding.is_none() {
            return Err(StorageError::NotOpened);
        }
        if !parent.is_root() && !self.document.contains(parent) {
            return Err(StorageError::NodeNotFound(parent));
        }
        let format = DocFormat::detect(path)?;
        let (plain, _extracted) = if format.encrypted {
            match extract(path, format, &self.config, self.packager.as_ref(), prompt)? {
                Some(x) => (x.plain, Some(x.dir)),
                None => return Ok(Vec::new()),
            }
        } else {
            (path.to_path_buf(), None)
        };
        let added = entity_for(format.doc_type)?.import_nodes(&plain, &mut self.document, parent)?;
        for id in &added {
            self.sync.pending_new(*id);
        }
        self.touch();
        Ok(added)
    }

    /// Content of `id`, read from disk on first access.
    pub fn node_content(&mut self, id: NodeId) -> Result<&NodeContent> {
        let master = self.document.resolve(id).ok_or(StorageError::NodeNotFound(id))?;
        if !self.document.is_content_loaded(master) {
            let binding = self.binding.as_mut().ok_or(StorageError::NotOpened)?;
            load_content(binding.entity.as_mut(), &mut self.document, master)?;
        }
        self.document.content(master).ok_or(StorageError::NodeNotFound(id))
    }

    /// Replaces the content of `id` (its master for an alias).
    pub fn set_node_content(&mut self, id: NodeId, content: NodeContent) -> Result<()> {
        let master = self.document.resolve(id).ok_or(StorageError::NodeNotFound(id))?;
        self.document.set_content(master, content)?;
        self.sync.pending_edit_buff(master);
        self.touch();
        Ok(())
    }

    pub fn add_node(
        &mut self,
        parent: NodeId,
        position: Option<usize>,
        props: NodeProps,
        content: Option<NodeContent>,
    ) -> Result<NodeId> {
        let content = content.unwrap_or_else(|| NodeContent::empty_for(&props.syntax));
        let id = self.document.add_node(parent, position, props, Some(content))?;
        self.added(parent, id);
        Ok(id)
    }

    /// Adds a shared alias of `master` under `parent`.
    pub fn add_shared_node(&mut self, master: NodeId, parent: NodeId, position: Option<usize>) -> Result<NodeId> {
        let id = self.document.add_shared_alias(master, parent, position)?;
        self.added(parent, id);
        Ok(id)
    }

    fn added(&mut self, parent: NodeId, id: NodeId) {
        self.sync.pending_new(id);
        let after = self.document.sequence_of(id).unwrap_or(1);
        self.touch_children_from(parent, after);
        self.touch();
    }

    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId, position: Option<usize>) -> Result<()> {
        let old_parent = self.document.parent_of(id).ok_or(StorageError::NodeNotFound(id))?;
        let old_index = self.document.sequence_of(id).map_or(0, |s| s - 1);
        self.document.move_node(id, new_parent, position)?;
        self.sync.pending_edit_hier(id);
        self.touch_children_from(old_parent, old_index);
        let new_index = self.document.sequence_of(id).map_or(0, |s| s - 1);
        self.touch_children_from(new_parent, new_index);
        self.touch();
        Ok(())
    }

    /// Removes `id` with its subtree, promoting surviving aliases of removed masters.
    pub fn remove_node(&mut self, id: NodeId) -> Result<RemovedSubtree> {
        let subtree = self.document.subtree(id);
        if subtree.is_empty() {
            return Err(StorageError::NodeNotFound(id));
        }
        // a promoted alias inherits the master's content, so it must be in memory
        for rid in &subtree {
            let survives = self.document.aliases_of(*rid).iter().any(|a| !subtree.contains(a));
            if survives && !self.document.is_content_loaded(*rid) {
                let binding = self.binding.as_mut().ok_or(StorageError::NotOpened)?;
                load_content(binding.entity.as_mut(), &mut self.document, *rid)?;
            }
        }

        let index = self.document.sequence_of(id).map_or(0, |s| s - 1);
        let removed = self.document.remove_subtree(id)?;
        for rid in &removed.removed {
            self.sync.pending_rm(*rid);
        }
        for promotion in &removed.promotions {
            self.sync.pending_new(promotion.new_master);
            for alias in &promotion.retargeted {
                self.sync.pending_edit_prop(*alias);
                self.sync.pending_edit_hier(*alias);
            }
        }
        self.touch_children_from(removed.former_parent, index);
        if removed.bookmarks_changed {
            self.sync.pending_bookmarks();
        }
        self.touch();
        log::debug!("removed {} nodes under {id}", removed.removed.len());
        Ok(removed)
    }

    /// Marks the children of `parent` from 0-based `index` on as moved.
    fn touch_children_from(&mut self, parent: NodeId, index: usize) {
        let shifted = self.document.children(parent).get(index..).map(<[NodeId]>::to_vec).unwrap_or_default();
        for id in shifted {
            self.sync.pending_edit_hier(id);
        }
    }

    fn mark_all_new(&mut self) {
        for id in self.document.traverse() {
            self.sync.pending_new(id);
        }
        self.sync.pending_bookmarks();
        self.touch();
    }

    fn touch(&mut self) {
        if self.state == ControlState::Clean {
            self.state = ControlState::Dirty;
        }
    }

    pub fn pending_new_db_node(&mut self, id: NodeId) {
        self.sync.pending_new(id);
        self.touch();
    }

    pub fn pending_edit_db_node_prop(&mut self, id: NodeId) {
        self.sync.pending_edit_prop(id);
        self.touch();
    }

    pub fn pending_edit_db_node_buff(&mut self, id: NodeId) {
        self.sync.pending_edit_buff(id);
        self.touch();
    }

    pub fn pending_edit_db_node_hier(&mut self, id: NodeId) {
        self.sync.pending_edit_hier(id);
        self.touch();
    }

    pub fn pending_rm_db_nodes(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.sync.pending_rm(*id);
        }
        self.touch();
    }

    pub fn pending_edit_db_bookmarks(&mut self) {
        self.sync.pending_bookmarks();
        self.touch();
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Direct access for edits; report them through the `pending_*` methods.
    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn sync_pending(&self) -> &SyncPending {
        &self.sync
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.binding.as_ref().map(|b| b.path.as_path())
    }

    pub fn format(&self) -> Option<DocFormat> {
        self.binding.as_ref().map(|b| b.format)
    }

    /// Failures of background jobs, in the order they happened.
    pub fn errors(&self) -> &Receiver<StorageError> {
        &self.errors
    }

    pub fn drain_errors(&self) -> Vec<StorageError> {
        self.errors.try_iter().collect()
    }

    /// Blocks until every queued background job has finished.
    pub fn wait_idle(&self) {
        self.worker.flush();
    }

    /// Drains the worker and releases the file. Unsaved changes are dropped.
    pub fn close(&mut self) {
        self.worker.shutdown();
        if let Some(mut binding) = self.binding.take() {
            if !self.sync.is_empty() {
                log::warn!("closing {} with unsaved changes", binding.path.display());
            }
            binding.entity.close_connect();
            log::info!("closed {}", binding.path.display());
        }
        self.state = ControlState::Unopened;
    }
}

impl Drop for StorageControl {
    fn drop(&mut self) {
        self.close();
    }
}

fn load_content(entity: &mut dyn StorageEntity, doc: &mut Document, master: NodeId) -> Result<()> {
    let syntax = doc.props(master).map(|p| p.syntax.clone()).unwrap_or_default();
    let content = entity.get_delayed_text_buffer(master, &syntax)?;
    doc.set_content(master, content)
}

fn set_aside_live(binding: &Binding) -> Result<Option<SetAside>> {
    if !binding.format.is_single_file() || !binding.path.is_file() {
        return Ok(None);
    }
    let backup = backup::timestamped(&binding.path);
    // an open SQLite connection must keep its file
    let moved = binding.format.encrypted || binding.format.doc_type != DocType::Sqlite;
    if moved {
        fs::rename(&binding.path, &backup)?;
    } else {
        fs::copy(&binding.path, &backup)?;
    }
    log::debug!("{} set aside as {}", binding.path.display(), backup.display());
    Ok(Some(SetAside { backup, moved }))
}

fn write_document(binding: &mut Binding, doc: &mut Document, sync: &SyncPending) -> Result<()> {
    let now = now_ts();
    for (id, _) in sync.nodes_to_write.iter().filter(|(_, st)| st.buff) {
        if let Some(props) = doc.props_mut(*id) {
            props.ts_lastsave = now;
        }
    }
    let doc = &*doc;
    let incremental = binding.bound && binding.format.doc_type != DocType::Xml;
    let ids: Option<Vec<NodeId>> = incremental.then(|| {
        sync.nodes_to_write
            .iter()
            .filter(|(_, st)| st.is_new() || st.buff)
            .map(|(id, _)| *id)
            .collect()
    });
    let cache = StorageCache::generate(doc, ids.as_deref(), binding.format.doc_type.wants_base64());
    let req = SaveRequest::new(&binding.plain_path, doc, sync).with_cache(&cache);
    binding.entity.save_treestore(&req)?;
    Ok(())
}

/// Snapshots the saved plaintext for the worker to archive.
fn stage_encryption(binding: &Binding) -> Result<Option<EncryptJob>> {
    let (Some(dir), Some(password)) = (&binding.extracted, &binding.password) else {
        return Ok(None);
    };
    let job_dir = backup::timestamped(&dir.path().join("job"));
    fs::create_dir_all(&job_dir)?;
    let plain_copy = job_dir.join(binding.plain_path.file_name().unwrap_or_default());
    fs::copy(&binding.plain_path, &plain_copy)?;
    Ok(Some(EncryptJob {
        plain_copy,
        job_dir,
        doc_type: binding.format.doc_type,
        archive: binding.path.clone(),
        password: password.clone(),
    }))
}

/// Puts the set-aside live file back after a failed save, or removes what a
/// failed first write left at a target that did not exist before.
fn rollback(binding: &mut Binding, set_aside: Option<&SetAside>, target_existed: bool) {
    binding.entity.close_connect();
    if set_aside.is_none() && !target_existed {
        match backup::remove_any(&binding.plain_path) {
            Ok(()) => log::warn!("removed partial {} after failed save", binding.plain_path.display()),
            Err(e) => log::error!("could not remove partial {}: {e}", binding.plain_path.display()),
        }
    }
    if let Some(aside) = set_aside {
        let live = &binding.path;
        if aside.moved {
            if let Err(e) = backup::remove_any(live) {
                log::error!("could not remove partial {}: {e}", live.display());
            }
        }
        match fs::rename(&aside.backup, live) {
            Ok(()) => log::warn!("restored {} after failed save", live.display()),
            Err(e) => log::error!("could not restore {} from {}: {e}", live.display(), aside.backup.display()),
        }
    }
    if binding.bound {
        if let Err(e) = binding.entity.reopen_connect() {
            log::error!("could not reopen {}: {e:#}", binding.plain_path.display());
        }
    }
}

fn scratch_dir(config: &StorageConfig) -> Result<TempDir> {
    let parent = config.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
    fs::create_dir_all(&parent)?;
    Ok(tempfile::Builder::new().prefix(".ct-").tempdir_in(&parent)?)
}

/// `<stem>.<plain extension>` for an archive path.
fn plain_name(archive: &Path, format: DocFormat) -> PathBuf {
    let mut name = archive.file_stem().unwrap_or_default().to_os_string();
    if let Some(ext) = format.plain_extension() {
        name.push(".");
        name.push(ext);
    }
    PathBuf::from(name)
}

fn extract(
    archive: &Path,
    format: DocFormat,
    config: &StorageConfig,
    packager: &dyn Packager,
    prompt: &mut dyn PasswordPrompt,
) -> Result<Option<Extracted>> {
    loop {
        let Some(password) = prompt.password(archive) else {
            return Ok(None);
        };
        let dir = scratch_dir(config)?;
        match packager.extract(archive, dir.path(), &password, false) {
            STATUS_OK => {
                let plain = find_plaintext(archive, dir.path(), format)?;
                return Ok(Some(Extracted { dir, plain, password }));
            }
            STATUS_BAD_ARCHIVE => return Err(StorageError::BadArchive(archive.to_path_buf())),
            status => log::warn!("wrong password for {} (status {status})", archive.display()),
        }
    }
}

fn find_plaintext(archive: &Path, dir: &Path, format: DocFormat) -> Result<PathBuf> {
    let wanted = format.plain_extension();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == wanted {
            return Ok(path);
        }
    }
    Err(StorageError::LoadFailed(format!("{} holds no {} document", archive.display(), wanted.unwrap_or("plain"))))
}

/// Packs `plain` into `dest` right away, keeping a previous `dest` until it succeeds.
fn archive_now(packager: &dyn Packager, plain: &Path, dest: &Path, password: &str) -> Result<()> {
    let aside = if dest.exists() {
        let bk = backup::timestamped(dest);
        fs::rename(dest, &bk)?;
        Some(bk)
    } else {
        None
    };
    let status = packager.archive(plain, dest, password);
    if status != STATUS_OK {
        if let Err(e) = backup::remove_any(dest) {
            log::warn!("could not remove partial {}: {e}", dest.display());
        }
        if let Some(bk) = &aside {
            if let Err(e) = fs::rename(bk, dest) {
                log::error!("could not restore {}: {e}", dest.display());
            }
        }
        return Err(StorageError::ArchiveFailed { path: dest.to_path_buf(), status });
    }
    if let Some(bk) = aside {
        backup::remove_any(&bk)?;
    }
    Ok(())
}
