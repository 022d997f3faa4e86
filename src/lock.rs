// this_file: src/lock.rs
//! Cross-process exclusive locks on a directory's cache file.

use crate::basename::basename;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use log::debug;
use std::fs::{File, OpenOptions};

/// Exclusive advisory lock over a cache file, released on drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: Utf8PathBuf,
}

impl DirLock {
    /// The locked cache file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Release the lock now instead of on drop.
    pub fn unlock(self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        debug!("unlocked {}", self.path);
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Lock the primary cache file of `dir`, blocking until the lock is granted.
///
/// The first search-path directory holding the file wins. A directory without a
/// cache file cannot be locked.
pub fn lock(config: &CacheConfig, dir: &Utf8Path) -> Result<DirLock> {
    let name = basename(config, dir);
    for cache_dir in &config.cache_dirs {
        let path = config.addressed(cache_dir).join(name.file_name());
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                debug!("cannot open {} for locking: {}", path, e);
                continue;
            }
        };
        file.lock_exclusive()?;
        debug!("locked {}", path);
        return Ok(DirLock { file, path });
    }
    Err(Error::NotFound(format!("no cache file to lock for {}", dir)))
}
