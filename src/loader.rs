// this_file: src/loader.rs
//! Locating, mapping and validating cache files.
//!
//! Large files on mmap-safe filesystems are mapped read-only and shared, small
//! files are read into the heap. Either way the bytes are validated before the
//! cache is admitted to the registry, and a file already loaded by this process
//! is found again through its `(dev, ino, mtime)` identity without re-reading it.

use crate::basename::{basename, legacy_basename, CacheBasename};
use crate::cache::{Cache, CacheBlob};
use crate::cache_file::{validate, Header, HEADER_SIZE, MIN_MMAP};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::mmap_policy::is_mmap_safe;
use crate::registry::Registry;
use crate::stat::{DirChecksum, FileStat};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use memmap2::MmapOptions;
use std::fs::File;
use std::io::{self, Read};

/// `stat` the directory a cache describes, through the sysroot.
///
/// A missing directory, or one that cannot be resolved (a symlink loop, say),
/// is reported as [`Error::NotFound`].
pub fn stat_dir(config: &CacheConfig, dir: &Utf8Path) -> Result<FileStat> {
    let path = config.addressed(dir);
    FileStat::of(&path).map_err(|e| Error::NotFound(format!("{}: {}", path, e)))
}

/// Candidate cache files for `dir`, in search order.
///
/// Each search-path directory contributes its primary file; the legacy name is
/// only tried where the primary file does not exist.
struct Candidates<'a> {
    config: &'a CacheConfig,
    dir: &'a Utf8Path,
    primary: CacheBasename,
    legacy: Option<Option<CacheBasename>>,
}

impl<'a> Candidates<'a> {
    fn new(config: &'a CacheConfig, dir: &'a Utf8Path) -> Self {
        Self {
            config,
            dir,
            primary: basename(config, dir),
            legacy: None,
        }
    }

    fn legacy(&mut self) -> Option<&CacheBasename> {
        let (config, dir) = (self.config, self.dir);
        self.legacy
            .get_or_insert_with(|| legacy_basename(config, dir))
            .as_ref()
    }

    /// Open the file for `dir` in `cache_dir`, falling back to the legacy name.
    fn open_in(&mut self, cache_dir: &Utf8Path) -> Option<(File, Utf8PathBuf)> {
        let root = self.config.addressed(cache_dir);
        let primary = root.join(self.primary.file_name());
        match File::open(&primary) {
            Ok(file) => return Some((file, primary)),
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                debug!("cannot open {}: {}", primary, e);
            }
            Err(_) => {}
        }
        let legacy = root.join(self.legacy()?.file_name());
        match File::open(&legacy) {
            Ok(file) => Some((file, legacy)),
            Err(_) => None,
        }
    }
}

/// Load the cache for `dir`, returning it with the file that satisfied the load.
pub fn load_with_path(
    config: &CacheConfig,
    registry: &Registry,
    dir: &Utf8Path,
) -> Result<(Cache, Utf8PathBuf)> {
    let dir_stat = stat_dir(config, dir)?;
    let expected = DirChecksum::from_stat(&dir_stat);
    let mut candidates = Candidates::new(config, dir);
    let mut miss = Error::NotFound(format!("no cache file for {}", dir));

    for cache_dir in &config.cache_dirs {
        let Some((file, path)) = candidates.open_in(cache_dir) else {
            continue;
        };
        match load_fd(registry, file, Some(expected)) {
            Ok(cache) => {
                debug!("loaded cache for {} from {}", dir, path);
                return Ok((cache, path));
            }
            Err(e) => {
                debug!("rejecting {}: {}", path, e);
                if !matches!(miss, Error::Stale(_)) {
                    miss = e;
                }
            }
        }
    }
    Err(miss)
}

/// Load the cache for `dir` from the first valid file on the search path.
pub fn load(config: &CacheConfig, registry: &Registry, dir: &Utf8Path) -> Result<Cache> {
    load_with_path(config, registry, dir).map(|(cache, _)| cache)
}

/// Load one specific cache file without comparing its time checksum.
pub fn inspect_file(registry: &Registry, path: &Utf8Path) -> Result<Cache> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
        _ => Error::Io(e),
    })?;
    load_fd(registry, file, None)
}

/// Load one specific cache file.
///
/// The recorded checksum is compared with a fresh `stat` of the directory the
/// cache names, so caches of vanished or modified directories are rejected.
pub fn load_file(config: &CacheConfig, registry: &Registry, path: &Utf8Path) -> Result<Cache> {
    let cache = inspect_file(registry, path)?;
    let dir_stat = stat_dir(config, Utf8Path::new(cache.dir()))?;
    cache.header().check_time(DirChecksum::from_stat(&dir_stat))?;
    Ok(cache)
}

/// Map or read an open cache file and admit it.
pub(crate) fn load_fd(
    registry: &Registry,
    mut file: File,
    expected: Option<DirChecksum>,
) -> Result<Cache> {
    let stat = FileStat::of_file(&file)?;
    let identity = stat.identity();

    if let Some(blob) = registry.find_by_stat(&identity) {
        let cache = Cache::from_registered(blob, registry);
        match expected {
            Some(expected) if cache.header().dir_checksum() != expected => {
                debug!("registered cache at {:#x} is stale", cache.base());
                drop(cache);
            }
            _ => return Ok(cache),
        }
    }

    let size = usize::try_from(stat.size)
        .map_err(|_| Error::malformed(format!("file size {} too large", stat.size)))?;
    if size < HEADER_SIZE {
        return Err(Error::malformed(format!("{}-byte file has no header", size)));
    }

    if size >= MIN_MMAP && is_mmap_safe(&file) {
        // SAFETY: the mapping is read-only and cache files are only ever replaced
        // by rename, never rewritten in place.
        match unsafe { MmapOptions::new().map(&file) } {
            Ok(map) => {
                #[cfg(unix)]
                let _ = map.advise(memmap2::Advice::Sequential);
                let header = validate(&map, expected)?;
                debug!("mapped {} byte cache", size);
                return Cache::admit(CacheBlob::mapped(map, header), registry, Some(identity));
            }
            Err(e) => debug!("mmap failed ({}), reading instead", e),
        }
    }

    let bytes = read_exact_len(&mut file, size)?;
    let header = validate(&bytes, expected)?;
    debug!("read {} byte cache into the heap", size);
    Cache::admit(CacheBlob::heap(bytes, header), registry, Some(identity))
}

fn read_exact_len(file: &mut File, size: usize) -> Result<Box<[u8]>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(size)
        .map_err(|e| Error::ResourceExhausted(format!("cannot buffer {} bytes: {}", size, e)))?;
    bytes.resize(size, 0);
    file.read_exact(&mut bytes).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::malformed("file shrank while reading"),
        _ => Error::Io(e),
    })?;
    Ok(bytes.into_boxed_slice())
}

/// Whether a valid, current cache file for `dir` exists on the search path.
///
/// Reads only the fixed header of each candidate; nothing is mapped or admitted.
pub fn dir_valid(config: &CacheConfig, dir: &Utf8Path) -> bool {
    let Ok(dir_stat) = stat_dir(config, dir) else {
        return false;
    };
    let expected = DirChecksum::from_stat(&dir_stat);
    let mut candidates = Candidates::new(config, dir);
    for cache_dir in &config.cache_dirs {
        let Some((file, path)) = candidates.open_in(cache_dir) else {
            continue;
        };
        match header_valid(file, expected) {
            Ok(()) => return true,
            Err(e) => debug!("{} is not valid: {}", path, e),
        }
    }
    false
}

fn header_valid(mut file: File, expected: DirChecksum) -> Result<()> {
    let len = file.metadata()?.len();
    let mut head = [0u8; HEADER_SIZE];
    file.read_exact(&mut head)
        .map_err(|_| Error::malformed("file shorter than the header"))?;
    let header = Header::read(&head)?;
    header.check(len)?;
    header.check_time(expected)
}
