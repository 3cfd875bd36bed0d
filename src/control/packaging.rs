//! Archive packaging of encrypted documents.
//!
//! Encrypted documents (`.ctx`, `.ctz`) are password-protected archives holding a
//! single plaintext document. Packing is done by an external collaborator behind
//! the [`Packager`] trait; statuses are plain integers so that command-line tools
//! map onto it directly.

use std::path::{Path, PathBuf};
use std::process::Command;

pub const STATUS_OK: i32 = 0;
/// Any nonzero status other than [`STATUS_BAD_ARCHIVE`] means the password was wrong.
pub const STATUS_WRONG_PASSWORD: i32 = 1;
/// The input is not an archive at all. Retrying with another password is pointless.
pub const STATUS_BAD_ARCHIVE: i32 = 2;

pub trait Packager: Send + Sync {
    /// Unpacks `archive` into `dest_dir`. With `list_only` nothing is written.
    fn extract(&self, archive: &Path, dest_dir: &Path, password: &str, list_only: bool) -> i32;

    /// Packs the single file `src` into a new archive at `dest`.
    fn archive(&self, src: &Path, dest: &Path, password: &str) -> i32;
}

/// Shells out to a `7z` executable.
#[derive(Debug, Clone)]
pub struct SevenZipPackager {
    program: PathBuf,
}

impl Default for SevenZipPackager {
    fn default() -> Self {
        Self { program: PathBuf::from("7z") }
    }
}

impl SevenZipPackager {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, args: &[String]) -> i32 {
        let output = match Command::new(&self.program).args(args).output() {
            Ok(output) => output,
            Err(e) => {
                log::error!("cannot run {}: {e}", self.program.display());
                return -1;
            }
        };
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .to_lowercase();
        if text.contains("can not open the file as archive") || text.contains("is not archive") {
            return STATUS_BAD_ARCHIVE;
        }
        if text.contains("wrong password") {
            return STATUS_WRONG_PASSWORD;
        }
        match output.status.code() {
            Some(0) => STATUS_OK,
            Some(code) => {
                log::debug!("{} exited with {code}", self.program.display());
                // 7z reports bad passwords as a plain data error
                if code == STATUS_BAD_ARCHIVE { STATUS_WRONG_PASSWORD } else { code }
            }
            None => -1,
        }
    }
}

impl Packager for SevenZipPackager {
    fn extract(&self, archive: &Path, dest_dir: &Path, password: &str, list_only: bool) -> i32 {
        let mut args = vec![
            if list_only { "l" } else { "x" }.to_string(),
            format!("-p{password}"),
            "-y".to_string(),
            "-bd".to_string(),
        ];
        if !list_only {
            args.push(format!("-o{}", dest_dir.display()));
        }
        args.push(archive.display().to_string());
        self.run(&args)
    }

    fn archive(&self, src: &Path, dest: &Path, password: &str) -> i32 {
        let args = vec![
            "a".to_string(),
            "-t7z".to_string(),
            format!("-p{password}"),
            "-y".to_string(),
            "-bd".to_string(),
            dest.display().to_string(),
            src.display().to_string(),
        ];
        self.run(&args)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A reversible stand-in packager: XOR with the password, tagged with its digest.

    use super::*;
    use crate::storage::cache::sha256_hex;
    use std::fs;

    const MAGIC: &[u8; 4] = b"XPK1";

    #[derive(Debug, Default)]
    pub(crate) struct XorPackager {
        /// Makes every `archive` call fail.
        pub fail_archive: bool,
    }

    fn xor(data: &[u8], password: &str) -> Vec<u8> {
        let key = password.as_bytes();
        if key.is_empty() {
            return data.to_vec();
        }
        data.iter().enumerate().map(|(i, b)| b ^ key[i % key.len()]).collect()
    }

    impl Packager for XorPackager {
        fn extract(&self, archive: &Path, dest_dir: &Path, password: &str, list_only: bool) -> i32 {
            let Ok(bytes) = fs::read(archive) else { return STATUS_BAD_ARCHIVE };
            if bytes.len() < 4 + 64 + 2 || &bytes[..4] != MAGIC {
                return STATUS_BAD_ARCHIVE;
            }
            if bytes[4..68] != *sha256_hex(password.as_bytes()).as_bytes() {
                return STATUS_WRONG_PASSWORD;
            }
            let name_len = u16::from_le_bytes([bytes[68], bytes[69]]) as usize;
            let Some(name) = bytes.get(70..70 + name_len) else { return STATUS_BAD_ARCHIVE };
            let name = String::from_utf8_lossy(name).into_owned();
            if list_only {
                return STATUS_OK;
            }
            match fs::write(dest_dir.join(name), xor(&bytes[70 + name_len..], password)) {
                Ok(()) => STATUS_OK,
                Err(_) => -1,
            }
        }

        fn archive(&self, src: &Path, dest: &Path, password: &str) -> i32 {
            if self.fail_archive {
                return 7;
            }
            let Ok(data) = fs::read(src) else { return -1 };
            let name = src.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let mut out = MAGIC.to_vec();
            out.extend_from_slice(sha256_hex(password.as_bytes()).as_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend(xor(&data, password));
            match fs::write(dest, out) {
                Ok(()) => STATUS_OK,
                Err(_) => -1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::XorPackager;
    use super::*;
    use std::fs;

    #[test]
    fn fake_packager_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.ctd");
        fs::write(&src, b"<cherrytree/>").unwrap();
        let archive = dir.path().join("doc.ctz");
        let p = XorPackager::default();
        assert_eq!(p.archive(&src, &archive, "pw"), STATUS_OK);

        let out = tempfile::tempdir().unwrap();
        assert_eq!(p.extract(&archive, out.path(), "nope", false), STATUS_WRONG_PASSWORD);
        assert_eq!(p.extract(&src, out.path(), "pw", false), STATUS_BAD_ARCHIVE);
        assert_eq!(p.extract(&archive, out.path(), "pw", false), STATUS_OK);
        assert_eq!(fs::read(out.path().join("doc.ctd")).unwrap(), b"<cherrytree/>");
    }

    #[test]
    fn missing_7z_binary_is_an_error_status() {
        let p = SevenZipPackager::new("/nonexistent/7z");
        let dir = tempfile::tempdir().unwrap();
        assert_ne!(p.archive(&dir.path().join("a"), &dir.path().join("b"), "x"), STATUS_OK);
    }
}
