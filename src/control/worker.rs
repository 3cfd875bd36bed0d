//! Background backup and encryption worker.
//!
//! One worker thread per open document. The control thread pushes
//! [`WorkerMessage::Job`]s on a bounded queue and blocks when it is full; the
//! worker handles them strictly in order. Failures never propagate back to the
//! save that queued the job: they are logged and sent on the error channel.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

use super::backup;
use super::packaging::{Packager, STATUS_OK};
use crate::config::StorageConfig;
use crate::document::Document;
use crate::errors::StorageError;
use crate::storage::multifile::node_backup_dir;
use crate::storage::{entity_for, DocType, LoadMode};

/// What to do with the copy set aside before a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BackupKind {
    None,
    /// `backup` is the pre-save copy of `live`. Rotated into the tilde slots when
    /// `rotate` is set, deleted otherwise.
    SingleFile { backup: PathBuf, live: PathBuf, rotate: bool },
    /// MultiFile leftovers: staged `.before` dirs and removed node dirs, leaf first.
    /// Both are rotated into backups when `rotate` is set, deleted otherwise.
    NodeDirs { staged: Vec<PathBuf>, removed: Vec<PathBuf>, rotate: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncryptJob {
    /// Plaintext snapshot taken right after the save.
    pub plain_copy: PathBuf,
    /// Scratch directory holding `plain_copy`, removed when the job is done.
    pub job_dir: PathBuf,
    pub doc_type: DocType,
    pub archive: PathBuf,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BackupJob {
    pub backup: BackupKind,
    pub encrypt: Option<EncryptJob>,
}

pub(crate) enum WorkerMessage {
    Job(Box<BackupJob>),
    /// Answered once every earlier message has been handled.
    Flush(Sender<()>),
    Shutdown,
}

struct WorkerContext {
    config: StorageConfig,
    packager: Arc<dyn Packager>,
    err_tx: Sender<StorageError>,
}

pub(crate) struct BackupWorker {
    tx: Sender<WorkerMessage>,
    handle: Option<JoinHandle<()>>,
}

impl BackupWorker {
    pub fn spawn(config: StorageConfig, packager: Arc<dyn Packager>, err_tx: Sender<StorageError>) -> Result<Self> {
        let (tx, rx) = bounded::<WorkerMessage>(config.queue_depth.max(1));
        let ctx = WorkerContext { config, packager, err_tx };
        let handle = std::thread::Builder::new()
            .name("ct-backup".into())
            .spawn(move || ctx.run(rx))
            .context("spawning backup worker")?;
        Ok(Self { tx, handle: Some(handle) })
    }

    /// Queues a job, blocking while the queue is full.
    pub fn push(&self, job: BackupJob) -> crate::errors::Result<()> {
        self.tx
            .send(WorkerMessage::Job(Box::new(job)))
            .map_err(|_| StorageError::SaveFailed("backup worker is gone".into()))
    }

    /// Waits until every queued job has been handled.
    pub fn flush(&self) {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(WorkerMessage::Flush(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
    }

    /// Drains the queue and joins the thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else { return };
        let _ = self.tx.send(WorkerMessage::Shutdown);
        if handle.join().is_err() {
            log::error!("backup worker panicked");
        }
    }
}

impl Drop for BackupWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorkerContext {
    fn run(self, rx: Receiver<WorkerMessage>) {
        log::debug!("backup worker started");
        while let Ok(msg) = rx.recv() {
            match msg {
                WorkerMessage::Job(job) => {
                    if let Err(err) = self.process(&job) {
                        self.report(err);
                    }
                }
                WorkerMessage::Flush(reply) => {
                    let _ = reply.send(());
                }
                WorkerMessage::Shutdown => break,
            }
        }
        log::debug!("backup worker stopped");
    }

    fn report(&self, err: StorageError) {
        log::error!("background job failed: {err}");
        let _ = self.err_tx.send(err);
    }

    fn process(&self, job: &BackupJob) -> Result<(), StorageError> {
        if let Some(enc) = &job.encrypt {
            let result = self.encrypt(enc, &job.backup);
            if let Err(e) = backup::remove_any(&enc.job_dir) {
                log::warn!("could not remove {}: {e}", enc.job_dir.display());
            }
            result?;
        }
        self.rotate(&job.backup).map_err(StorageError::from)
    }

    /// Puts the pre-save copy back at the live path when the live path is empty.
    fn restore_live(&self, kind: &BackupKind) {
        let BackupKind::SingleFile { backup, live, .. } = kind else { return };
        if live.exists() || !backup.exists() {
            return;
        }
        match fs::rename(backup, live) {
            Ok(()) => log::warn!("restored {} from {}", live.display(), backup.display()),
            Err(e) => log::error!("could not restore {} from {}: {e}", live.display(), backup.display()),
        }
    }

    fn encrypt(&self, enc: &EncryptJob, kind: &BackupKind) -> Result<(), StorageError> {
        if let Err(err) = dry_run(enc.doc_type, &enc.plain_copy) {
            self.restore_live(kind);
            return Err(StorageError::IntegrityCheck { path: enc.archive.clone(), reason: format!("{err:#}") });
        }
        let status = self.packager.archive(&enc.plain_copy, &enc.archive, &enc.password);
        if status != STATUS_OK {
            if let Err(e) = backup::remove_any(&enc.archive) {
                log::warn!("could not remove partial {}: {e}", enc.archive.display());
            }
            self.restore_live(kind);
            return Err(StorageError::ArchiveFailed { path: enc.archive.clone(), status });
        }
        log::debug!("archived {}", enc.archive.display());
        Ok(())
    }

    fn rotate(&self, kind: &BackupKind) -> Result<()> {
        let keep = self.config.backup_num;
        match kind {
            BackupKind::None => Ok(()),
            BackupKind::SingleFile { backup, live, rotate } => {
                if !backup.exists() {
                    // already put back by a failed encryption
                    return Ok(());
                }
                if !rotate {
                    return backup::remove_any(backup).with_context(|| format!("removing {}", backup.display()));
                }
                let base = match self.config.effective_backup_dir() {
                    Some(root) => backup::custom_backup_base(root, live),
                    None => live.clone(),
                };
                backup::rotate(|n| backup::tilde_path(&base, n), backup, keep)
            }
            BackupKind::NodeDirs { staged, removed, rotate } => {
                for before in staged {
                    if !before.is_dir() {
                        continue;
                    }
                    let node_dir = before.parent().ok_or_else(|| anyhow!("{} has no parent", before.display()))?;
                    if *rotate {
                        backup::rotate(|n| node_backup_dir(node_dir, n), before, keep)?;
                    } else {
                        backup::remove_any(before).with_context(|| format!("removing {}", before.display()))?;
                    }
                }
                // leaf first: a child's `<id>~` lands in its parent before the parent moves
                for dir in removed {
                    if fs::symlink_metadata(dir).is_err() {
                        continue;
                    }
                    if *rotate {
                        let base = match self.config.effective_backup_dir() {
                            Some(root) => backup::custom_backup_base(root, dir),
                            None => dir.clone(),
                        };
                        backup::rotate(|n| backup::tilde_path(&base, n), dir, keep)?;
                    } else {
                        backup::remove_any(dir).with_context(|| format!("removing {}", dir.display()))?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Parses every node of the document at `path` without keeping anything.
fn dry_run(doc_type: DocType, path: &Path) -> Result<()> {
    let mut entity = entity_for(doc_type)?;
    let mut scratch = Document::new();
    entity.populate_treestore(path, &mut scratch, LoadMode::DryRun)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::packaging::testing::XorPackager;
    use crossbeam_channel::unbounded;

    fn worker(config: StorageConfig, packager: XorPackager) -> (BackupWorker, Receiver<StorageError>) {
        let (err_tx, err_rx) = unbounded();
        (BackupWorker::spawn(config, Arc::new(packager), err_tx).unwrap(), err_rx)
    }

    #[test]
    fn single_file_jobs_rotate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("doc.ctd");
        let config = StorageConfig::builder().backup_num(2).build().unwrap();
        let (mut w, errs) = worker(config, XorPackager::default());
        for round in 0..3 {
            let bk = backup::timestamped(&live);
            fs::write(&bk, format!("v{round}")).unwrap();
            w.push(BackupJob { backup: BackupKind::SingleFile { backup: bk, live: live.clone(), rotate: true }, encrypt: None })
                .unwrap();
        }
        w.flush();
        assert_eq!(fs::read_to_string(backup::tilde_path(&live, 1)).unwrap(), "v2");
        assert_eq!(fs::read_to_string(backup::tilde_path(&live, 2)).unwrap(), "v1");
        assert!(!backup::tilde_path(&live, 3).exists());
        w.shutdown();
        assert!(errs.try_recv().is_err());
    }

    #[test]
    fn custom_backup_dir_and_no_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("doc.ctd");
        fs::write(&live, "live").unwrap();
        let custom = dir.path().join("custom");
        let config = StorageConfig::builder().custom_backup_dir(&custom).build().unwrap();
        let (w, _errs) = worker(config, XorPackager::default());

        let bk = backup::timestamped(&live);
        fs::write(&bk, "old").unwrap();
        w.push(BackupJob { backup: BackupKind::SingleFile { backup: bk.clone(), live: live.clone(), rotate: true }, encrypt: None })
            .unwrap();
        w.flush();
        let base = backup::custom_backup_base(&custom, &live);
        assert_eq!(fs::read_to_string(backup::tilde_path(&base, 1)).unwrap(), "old");
        assert!(!bk.exists());

        let bk = backup::timestamped(&live);
        fs::write(&bk, "old").unwrap();
        w.push(BackupJob { backup: BackupKind::SingleFile { backup: bk.clone(), live, rotate: false }, encrypt: None })
            .unwrap();
        w.flush();
        assert!(!bk.exists());
    }

    #[test]
    fn removed_node_dirs_nest_their_backups() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("1");
        let leaf = top.join("2");
        fs::create_dir_all(&leaf).unwrap();
        fs::write(top.join("node.xml"), "top").unwrap();
        fs::write(leaf.join("node.xml"), "leaf").unwrap();
        let (mut w, errs) = worker(StorageConfig::default(), XorPackager::default());
        w.push(BackupJob {
            backup: BackupKind::NodeDirs { staged: vec![], removed: vec![leaf.clone(), top.clone(), leaf], rotate: true },
            encrypt: None,
        })
        .unwrap();
        w.flush();
        assert!(!top.exists());
        assert_eq!(fs::read_to_string(dir.path().join("1~/node.xml")).unwrap(), "top");
        assert_eq!(fs::read_to_string(dir.path().join("1~/2~/node.xml")).unwrap(), "leaf");

        let gone = dir.path().join("3");
        fs::create_dir_all(&gone).unwrap();
        w.push(BackupJob {
            backup: BackupKind::NodeDirs { staged: vec![], removed: vec![gone.clone()], rotate: false },
            encrypt: None,
        })
        .unwrap();
        w.shutdown();
        assert!(!gone.exists());
        assert!(!dir.path().join("3~").exists());
        assert!(errs.try_recv().is_err());
    }

    #[test]
    fn failed_archive_restores_live_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("doc.ctz");
        let bk = backup::timestamped(&live);
        fs::write(&bk, "previous archive").unwrap();
        let job_dir = dir.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let plain = job_dir.join("doc.ctd");
        fs::write(&plain, r#"<cherrytree><node name="A" unique_id="1"/></cherrytree>"#).unwrap();

        let (mut w, errs) = worker(StorageConfig::default(), XorPackager { fail_archive: true });
        w.push(BackupJob {
            backup: BackupKind::SingleFile { backup: bk.clone(), live: live.clone(), rotate: true },
            encrypt: Some(EncryptJob {
                plain_copy: plain,
                job_dir: job_dir.clone(),
                doc_type: DocType::Xml,
                archive: live.clone(),
                password: "pw".into(),
            }),
        })
        .unwrap();
        w.shutdown();

        assert_eq!(fs::read_to_string(&live).unwrap(), "previous archive");
        assert!(!job_dir.exists());
        assert!(matches!(errs.try_recv(), Ok(StorageError::ArchiveFailed { status: 7, .. })));
    }

    #[test]
    fn corrupt_plaintext_is_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("doc.ctz");
        let bk = backup::timestamped(&live);
        fs::write(&bk, "previous archive").unwrap();
        let job_dir = dir.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        let plain = job_dir.join("doc.ctd");
        fs::write(&plain, "<cherrytree><node").unwrap();

        let (mut w, errs) = worker(StorageConfig::default(), XorPackager::default());
        w.push(BackupJob {
            backup: BackupKind::SingleFile { backup: bk, live: live.clone(), rotate: true },
            encrypt: Some(EncryptJob {
                plain_copy: plain,
                job_dir,
                doc_type: DocType::Xml,
                archive: live.clone(),
                password: "pw".into(),
            }),
        })
        .unwrap();
        w.shutdown();

        assert_eq!(fs::read_to_string(&live).unwrap(), "previous archive");
        match errs.try_recv() {
            Ok(err @ StorageError::IntegrityCheck { .. }) => assert!(err.to_string().contains("Save As")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
