//! Backup file naming and generational rotation.
//!
//! A save first sets the live file aside as `<name>.<micros>`. The background
//! worker later rotates that copy into the tilde slots: `<name>~` is the newest
//! generation, `<name>~~` the one before, and so on up to `backup_num`.
//! MultiFile documents rotate per node directory instead (`.bkp~`, `.bkp~~`, ...).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};

use crate::storage::cache::sha256_hex;

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Microseconds since the epoch, strictly increasing across calls.
fn next_stamp() -> i64 {
    let now = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64;
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// `<name>.<micros>` next to `live`.
pub(crate) fn timestamped(live: &Path) -> PathBuf {
    with_suffix(live, &format!(".{}", next_stamp()))
}

/// `base` with `generation` tildes appended to its file name.
pub(crate) fn tilde_path(base: &Path, generation: usize) -> PathBuf {
    with_suffix(base, &"~".repeat(generation))
}

/// Base name of the tilde slots for `live` inside a custom backup root:
/// `<root>/<sha256 of the full path>/<name>`.
pub(crate) fn custom_backup_base(root: &Path, live: &Path) -> PathBuf {
    let full = fs::canonicalize(live).unwrap_or_else(|_| live.to_path_buf());
    let digest = sha256_hex(full.to_string_lossy().as_bytes());
    root.join(digest).join(live.file_name().unwrap_or_default())
}

/// Removes a file or a directory tree. Missing paths are fine.
pub(crate) fn remove_any(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Moves `fresh` into slot 1, shifting older generations up and evicting slot `keep`.
pub(crate) fn rotate(slot: impl Fn(usize) -> PathBuf, fresh: &Path, keep: usize) -> Result<()> {
    let keep = keep.max(1);
    let oldest = slot(keep);
    remove_any(&oldest).with_context(|| format!("evicting {}", oldest.display()))?;
    for generation in (1..keep).rev() {
        let from = slot(generation);
        if fs::symlink_metadata(&from).is_ok() {
            let to = slot(generation + 1);
            fs::rename(&from, &to).with_context(|| format!("shifting {} to {}", from.display(), to.display()))?;
        }
    }
    let newest = slot(1);
    if let Some(parent) = newest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::rename(fresh, &newest).with_context(|| format!("moving {} to {}", fresh.display(), newest.display()))?;
    log::debug!("rotated {} into {}", fresh.display(), newest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        let live = Path::new("/docs/notes.ctb");
        assert_eq!(tilde_path(live, 1), PathBuf::from("/docs/notes.ctb~"));
        assert_eq!(tilde_path(live, 3), PathBuf::from("/docs/notes.ctb~~~"));

        let a = timestamped(live);
        let b = timestamped(live);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().starts_with("/docs/notes.ctb."));

        let base = custom_backup_base(Path::new("/bk"), live);
        assert_eq!(base.file_name().unwrap(), "notes.ctb");
        assert_eq!(base.parent().unwrap().file_name().unwrap().len(), 64);
        assert_eq!(base, custom_backup_base(Path::new("/bk"), live));
    }

    #[test]
    fn rotation_keeps_newest_generations_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("doc.ctd");
        for round in 0..4 {
            let fresh = timestamped(&live);
            fs::write(&fresh, format!("v{round}")).unwrap();
            rotate(|n| tilde_path(&live, n), &fresh, 3).unwrap();
        }
        assert_eq!(fs::read_to_string(tilde_path(&live, 1)).unwrap(), "v3");
        assert_eq!(fs::read_to_string(tilde_path(&live, 2)).unwrap(), "v2");
        assert_eq!(fs::read_to_string(tilde_path(&live, 3)).unwrap(), "v1");
        assert!(!tilde_path(&live, 4).exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn rotates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("7");
        let slot = |n: usize| node.join(format!(".bkp{}", "~".repeat(n)));
        for round in 0..2 {
            let staged = node.join(".before");
            fs::create_dir_all(&staged).unwrap();
            fs::write(staged.join("node.xml"), format!("v{round}")).unwrap();
            rotate(slot, &staged, 1).unwrap();
        }
        assert_eq!(fs::read_to_string(slot(1).join("node.xml")).unwrap(), "v1");
        assert!(!slot(2).exists());
        assert!(!node.join(".before").exists());
    }
}
