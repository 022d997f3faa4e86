// this_file: src/dircache.rs
//! High-level directory cache API.
//!
//! [`FontDirCache`] bundles a configuration with the registry its caches are
//! counted in and exposes the full lifecycle: load, build, write, lock, unlink
//! and clean.

use crate::cache::{Cache, CacheBlob};
use crate::cache_file::{build, validate};
use crate::clean::{clean_all, CleanReport};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::loader;
use crate::lock::{self, DirLock};
use crate::logging::Timer;
use crate::pattern::FontSet;
use crate::registry::Registry;
use crate::stat::{DirChecksum, FileStat};
use crate::writer;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};
use std::ptr::NonNull;

/// Fresh contents of a font directory, as produced by a [`DirScanner`].
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub font_set: FontSet,
    pub subdirs: Vec<String>,
    /// `stat` of the directory taken before it was scanned
    pub dir_stat: FileStat,
}

/// Source of directory contents for caches that have to be rebuilt.
pub trait DirScanner {
    fn scan(&self, dir: &Utf8Path) -> Result<ScanResult>;
}

impl<F> DirScanner for F
where
    F: Fn(&Utf8Path) -> Result<ScanResult>,
{
    fn scan(&self, dir: &Utf8Path) -> Result<ScanResult> {
        self(dir)
    }
}

/// Directory caches for one configuration.
#[derive(Debug, Clone)]
pub struct FontDirCache {
    config: CacheConfig,
    registry: Registry,
}

impl FontDirCache {
    /// Use the process-wide registry.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_registry(config, Registry::global().clone())
    }

    pub fn with_registry(config: CacheConfig, registry: Registry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Load the current cache of `dir` from the search path.
    pub fn dir_load(&self, dir: impl AsRef<Utf8Path>) -> Result<Cache> {
        loader::load(&self.config, &self.registry, dir.as_ref())
    }

    /// Like [`FontDirCache::dir_load`], also returning the file that was used.
    pub fn dir_load_with_path(&self, dir: impl AsRef<Utf8Path>) -> Result<(Cache, Utf8PathBuf)> {
        loader::load_with_path(&self.config, &self.registry, dir.as_ref())
    }

    /// Load the cache of `dir`, rebuilding and writing it on a miss.
    ///
    /// A failed write is logged; the rebuilt cache is returned regardless.
    pub fn dir_read(&self, dir: impl AsRef<Utf8Path>, scanner: &dyn DirScanner) -> Result<Cache> {
        let dir = dir.as_ref();
        match self.dir_load(dir) {
            Ok(cache) => return Ok(cache),
            Err(e) if e.is_miss() => debug!("rebuilding cache for {}: {}", dir, e),
            Err(e) => return Err(e),
        }
        let scan = scanner.scan(dir)?;
        let cache = self.dir_build(&scan.font_set, dir, &scan.dir_stat, &scan.subdirs)?;
        if let Err(e) = self.dir_write(&cache) {
            warn!("cannot write cache for {}: {}", dir, e);
        }
        Ok(cache)
    }

    /// Release a cache handle.
    pub fn dir_unload(&self, cache: Cache) {
        drop(cache);
    }

    /// Serialize `font_set` into a new heap-backed cache for `dir`.
    ///
    /// The cache records the checksum of `dir_stat` and is registered without a
    /// file identity until it is written.
    pub fn dir_build(
        &self,
        font_set: &FontSet,
        dir: impl AsRef<Utf8Path>,
        dir_stat: &FileStat,
        subdirs: &[String],
    ) -> Result<Cache> {
        let dir = dir.as_ref();
        let bytes = build(font_set, dir.as_str(), DirChecksum::from_stat(dir_stat), subdirs)?;
        let header = validate(&bytes, None)?;
        Cache::admit(
            CacheBlob::heap(bytes.into_boxed_slice(), header),
            &self.registry,
            None,
        )
    }

    /// Rebuild `old` with a new directory checksum and subdirectory list.
    pub fn dir_rebuild(&self, old: &Cache, dir_stat: &FileStat, subdirs: &[String]) -> Result<Cache> {
        let _timer = Timer::new(format!("rebuilding cache for {}", old.dir()));
        let font_set = old.font_set()?;
        self.dir_build(&font_set, old.dir(), dir_stat, subdirs)
    }

    /// Persist `cache` to the first writable search-path directory.
    pub fn dir_write(&self, cache: &Cache) -> Result<Utf8PathBuf> {
        writer::write(&self.config, &self.registry, cache)
    }

    /// Remove all cache files of `dir`; returns whether anything was removed.
    pub fn dir_unlink(&self, dir: impl AsRef<Utf8Path>) -> Result<bool> {
        writer::unlink(&self.config, dir.as_ref())
    }

    /// Header-only check for a current cache file of `dir`.
    pub fn dir_valid(&self, dir: impl AsRef<Utf8Path>) -> bool {
        loader::dir_valid(&self.config, dir.as_ref())
    }

    /// Exclusively lock the cache file of `dir`, blocking until granted.
    pub fn dir_lock(&self, dir: impl AsRef<Utf8Path>) -> Result<DirLock> {
        lock::lock(&self.config, dir.as_ref())
    }

    /// Load one specific cache file.
    pub fn load_file(&self, path: impl AsRef<Utf8Path>) -> Result<Cache> {
        loader::load_file(&self.config, &self.registry, path.as_ref())
    }

    /// Clean every search-path directory.
    pub fn clean(&self, verbose: bool) -> Result<Vec<CleanReport>> {
        clean_all(&self.config, &self.registry, verbose)
    }

    /// Tag the first usable search-path directory with `CACHEDIR.TAG`.
    pub fn create_tag_files(&self) -> bool {
        writer::create_tag_files(&self.config)
    }

    /// Allocate `len` zeroed bytes owned by `cache`.
    pub fn cache_allocate(&self, cache: &Cache, len: usize) -> Option<NonNull<u8>> {
        cache.allocate(len)
    }

    /// Add `n` references to the cache containing address `object`.
    ///
    /// Any address inside a live cache works, such as [`PatternRef::addr`].
    ///
    /// [`PatternRef::addr`]: crate::pattern::PatternRef::addr
    pub fn cache_reference(&self, object: usize, n: usize) -> bool {
        self.registry.reference(object, n)
    }

    /// Drop one reference to the cache containing address `object`.
    pub fn cache_dereference(&self, object: usize) -> bool {
        self.registry.dereference(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pattern::Pattern;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct Fixture {
        _fonts: TempDir,
        _caches: TempDir,
        dir: Utf8PathBuf,
        cache: FontDirCache,
    }

    fn fixture() -> Fixture {
        let fonts = TempDir::new().unwrap();
        let caches = TempDir::new().unwrap();
        let dir = Utf8PathBuf::from_path_buf(fonts.path().join("fonts")).unwrap();
        std::fs::create_dir(&dir).unwrap();
        let config = CacheConfig::new()
            .with_cache_dir(Utf8PathBuf::from_path_buf(caches.path().to_path_buf()).unwrap());
        Fixture {
            _fonts: fonts,
            _caches: caches,
            dir,
            cache: FontDirCache::with_registry(config, Registry::new()),
        }
    }

    fn scan_of(dir: &Utf8Path) -> ScanResult {
        ScanResult {
            font_set: FontSet::from(vec![Pattern::new().with("family", "Scanned")]),
            subdirs: vec!["sub".to_string()],
            dir_stat: FileStat::of(dir).unwrap(),
        }
    }

    #[test]
    fn read_rebuilds_once_then_loads() {
        let fx = fixture();
        let scans = Cell::new(0);
        let scanner = |dir: &Utf8Path| -> Result<ScanResult> {
            scans.set(scans.get() + 1);
            Ok(scan_of(dir))
        };
        let first = fx.cache.dir_read(&fx.dir, &scanner).unwrap();
        assert_eq!(first.num_fonts(), 1);
        drop(first);
        let second = fx.cache.dir_read(&fx.dir, &scanner).unwrap();
        assert_eq!(second.subdirs(), vec!["sub"]);
        assert_eq!(scans.get(), 1);
        assert!(fx.cache.dir_valid(&fx.dir));
    }

    #[test]
    fn rebuild_keeps_fonts_and_replaces_subdirs() {
        let fx = fixture();
        let scan = scan_of(&fx.dir);
        let old = fx
            .cache
            .dir_build(&scan.font_set, &fx.dir, &scan.dir_stat, &scan.subdirs)
            .unwrap();
        let new = fx
            .cache
            .dir_rebuild(&old, &scan.dir_stat, &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_ne!(old.base(), new.base());
        assert_eq!(new.font_set().unwrap(), scan.font_set);
        assert_eq!(new.subdirs(), vec!["a", "b"]);
        assert_eq!(fx.cache.registry().len(), 2);
    }

    #[test]
    fn interior_references_count() {
        let fx = fixture();
        let scan = scan_of(&fx.dir);
        let cache = fx
            .cache
            .dir_build(&scan.font_set, &fx.dir, &scan.dir_stat, &scan.subdirs)
            .unwrap();
        let addr = cache.fonts()[0].addr();
        assert!(fx.cache.cache_reference(addr, 2));
        assert_eq!(cache.ref_count(), Some(3));
        assert!(fx.cache.cache_dereference(addr));
        assert!(fx.cache.cache_dereference(cache.base()));
        assert_eq!(cache.ref_count(), Some(1));
        assert!(fx.cache.cache_allocate(&cache, 32).is_some());
        fx.cache.dir_unload(cache);
        assert!(fx.cache.registry().is_empty());
    }

    #[test]
    fn scanner_errors_propagate() {
        let fx = fixture();
        let scanner = |_: &Utf8Path| -> Result<ScanResult> { Err(Error::NotFound("gone".into())) };
        assert!(fx.cache.dir_read(&fx.dir, &scanner).is_err());
    }
}
