// this_file: src/atomic.rs
//! Atomic replacement of a file under an advisory lock.
//!
//! New content goes to a temporary file next to the target and is renamed over
//! it on commit, so readers only ever see the old file or the complete new one.
//! Writers of the same target exclude each other through `<target>.LCK`; a
//! writer that finds the lock taken fails with [`Error::LockContention`] rather
//! than waiting.

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use tempfile::NamedTempFile;

/// Suffix of the lock file guarding a target.
pub const LOCK_SUFFIX: &str = ".LCK";

/// Lock file path for `target`.
pub fn lock_path(target: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}{}", target, LOCK_SUFFIX))
}

/// A pending replacement of `target`.
///
/// Dropping it without [`AtomicFile::commit`] discards the temporary file and
/// leaves the target untouched. The lock is released when the lock file's
/// descriptor closes.
#[derive(Debug)]
pub struct AtomicFile {
    target: Utf8PathBuf,
    lock: File,
    temp: NamedTempFile,
}

impl AtomicFile {
    /// Take the lock for `target` and open a temporary file beside it.
    pub fn new(target: &Utf8Path) -> Result<Self> {
        let parent = match target.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };

        let lock_file = lock_path(target);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_file)?;
        lock.try_lock_exclusive().map_err(|e| {
            if is_contended(&e) {
                Error::LockContention(format!("{} is held by another writer", lock_file))
            } else {
                Error::Io(e)
            }
        })?;

        let name = target.file_name().unwrap_or("atomic");
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(".tmp")
            .tempfile_in(parent)?;
        debug!("writing {} via {}", target, temp.path().display());

        Ok(Self {
            target: target.to_path_buf(),
            lock,
            temp,
        })
    }

    pub fn target(&self) -> &Utf8Path {
        &self.target
    }

    /// The temporary file receiving the new content.
    pub fn file(&mut self) -> &mut File {
        self.temp.as_file_mut()
    }

    /// Flush the temporary file and rename it over the target.
    pub fn commit(self) -> Result<()> {
        let AtomicFile { target, lock, temp } = self;
        temp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }
        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
        debug!("replaced {}", target);
        if let Err(e) = FileExt::unlock(&lock) {
            debug!("releasing {} failed: {}", lock_path(&target), e);
        }
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Atomically replace `target` with `bytes`.
pub fn atomic_write(target: &Utf8Path, bytes: &[u8]) -> Result<()> {
    let mut file = AtomicFile::new(target)?;
    file.write_all(bytes)?;
    file.commit()
}
