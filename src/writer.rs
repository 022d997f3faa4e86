// this_file: src/writer.rs
//! Publishing caches to the search path and removing them again.

use crate::atomic::{atomic_write, AtomicFile};
use crate::basename::{basename, legacy_basename, UUID_FILE};
use crate::cache::Cache;
use crate::cache_file::{MAGIC_MMAP, MIN_MMAP};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::stat::FileStat;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info, warn};
use std::fs::{self, File, FileTimes};
use std::io::{self, Write};

/// Name of the cache directory tag file.
pub const TAG_FILE: &str = "CACHEDIR.TAG";

const TAG_CONTENT: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
# This file is a cache directory tag created by fcdircache.\n\
# For information about cache directory tags, see:\n\
#\thttp://www.brynosaurus.com/cachedir/\n";

/// Whether the current process may create files in `dir`.
#[cfg(unix)]
pub(crate) fn is_writable(dir: &Utf8Path) -> bool {
    use std::ffi::CString;
    let Ok(path) = CString::new(dir.as_str()) else {
        return false;
    };
    // SAFETY: `path` is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn is_writable(dir: &Utf8Path) -> bool {
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

fn make_dir(dir: &Utf8Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)
}

#[cfg(unix)]
fn make_writable(dir: &Utf8Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_writable(dir: &Utf8Path) -> io::Result<()> {
    let mut perms = fs::metadata(dir)?.permissions();
    perms.set_readonly(false);
    fs::set_permissions(dir, perms)
}

/// First search-path directory that accepts new files, as an addressed path.
///
/// Missing directories are created and tagged; existing read-only ones are
/// made writable if the process owns them.
pub fn writable_cache_dir(config: &CacheConfig) -> Result<Utf8PathBuf> {
    for cache_dir in &config.cache_dirs {
        let dir = config.addressed(cache_dir);
        if is_writable(&dir) {
            return Ok(dir);
        }
        let prepared = if dir.exists() {
            make_writable(&dir)
        } else {
            make_dir(&dir)
        };
        match prepared {
            Ok(()) => {
                if let Err(e) = create_tag_file(&dir) {
                    debug!("cannot tag {}: {}", dir, e);
                }
                return Ok(dir);
            }
            Err(e) => debug!("skipping cache directory {}: {}", dir, e),
        }
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "no writable cache directory on the search path",
    )))
}

/// Write `cache` over the primary cache file of its directory.
///
/// The file always carries the mapped magic, whatever backs `cache` in memory.
/// Small caches are re-keyed in the registry to the new file's identity so the
/// next load finds them without reading the file back.
pub fn write(config: &CacheConfig, registry: &Registry, cache: &Cache) -> Result<Utf8PathBuf> {
    let dir = Utf8Path::new(cache.dir());
    let cache_dir = writable_cache_dir(config)?;
    let name = basename(config, dir);
    let target = cache_dir.join(name.file_name());

    let bytes = cache.as_bytes();
    let mut file = AtomicFile::new(&target)?;
    file.write_all(&MAGIC_MMAP.to_ne_bytes())?;
    file.write_all(&bytes[4..])?;
    file.commit()?;
    debug!("wrote {} byte cache for {} to {}", bytes.len(), dir, target);

    if cache.size() < MIN_MMAP {
        match FileStat::of(&target) {
            Ok(stat) => {
                registry.update_identity(cache.base(), stat.identity());
            }
            Err(e) => debug!("cannot stat {} after writing: {}", target, e),
        }
    }
    Ok(target)
}

/// Write the cache directory tag into `cache_dir` unless one is there already.
pub fn create_tag_file(cache_dir: &Utf8Path) -> Result<()> {
    let tag = cache_dir.join(TAG_FILE);
    if tag.exists() {
        return Ok(());
    }
    atomic_write(&tag, TAG_CONTENT.as_bytes())
}

/// Tag the first search-path directory that can be tagged.
pub fn create_tag_files(config: &CacheConfig) -> bool {
    for cache_dir in &config.cache_dirs {
        let dir = config.addressed(cache_dir);
        if !dir.exists() {
            if let Err(e) = make_dir(&dir) {
                debug!("cannot create {}: {}", dir, e);
                continue;
            }
        }
        if !is_writable(&dir) {
            continue;
        }
        match create_tag_file(&dir) {
            Ok(()) => return true,
            Err(e) => debug!("cannot tag {}: {}", dir, e),
        }
    }
    false
}

fn remove_if_present(path: &Utf8Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("removed {}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Remove every cache file for `dir` and its legacy `.uuid` marker.
///
/// The directory's access and modification times are put back after the marker
/// is removed, so caches of its parent stay current. Returns whether anything
/// was removed.
pub fn unlink(config: &CacheConfig, dir: &Utf8Path) -> Result<bool> {
    let primary = basename(config, dir);
    let legacy = legacy_basename(config, dir);
    let mut removed = false;

    for cache_dir in &config.cache_dirs {
        let root = config.addressed(cache_dir);
        removed |= remove_if_present(&root.join(primary.file_name()))?;
        if let Some(legacy) = &legacy {
            removed |= remove_if_present(&root.join(legacy.file_name()))?;
        }
    }

    let target = config.addressed(dir);
    let uuid = target.join(UUID_FILE);
    if uuid.exists() {
        let times = fs::metadata(&target).and_then(|m| Ok((m.accessed()?, m.modified()?)));
        removed |= remove_if_present(&uuid)?;
        match times {
            Ok((accessed, modified)) => {
                let restored = File::open(&target).and_then(|f| {
                    f.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified))
                });
                if let Err(e) = restored {
                    warn!("cannot restore times of {}: {}", target, e);
                }
            }
            Err(e) => warn!("cannot read times of {}: {}", target, e),
        }
    }

    if removed {
        info!("removed caches for {}", dir);
    }
    Ok(removed)
}
