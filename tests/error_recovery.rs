// this_file: tests/error_recovery.rs
//! Recovery from corrupt, stale and contended cache files

use camino::{Utf8Path, Utf8PathBuf};
use fcdircache::atomic::AtomicFile;
use fcdircache::basename::{ARCH, SUFFIX, UUID_FILE};
use fcdircache::cache_file::HEADER_SIZE;
use fcdircache::{
    basename, legacy_basename, CacheConfig, Error, FileStat, FontDirCache, FontSet, Pattern,
    Registry,
};
use std::fs::{self, File, FileTimes};
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

/// Sysroot with `/fonts/a` and two cache directories, `/c1` and `/c2`.
struct Fixture {
    _root: TempDir,
    sysroot: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let sysroot = Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap();
        for dir in ["fonts/a", "c1", "c2"] {
            fs::create_dir_all(sysroot.join(dir)).unwrap();
        }
        Self {
            _root: root,
            sysroot,
        }
    }

    fn config(&self, cache_dirs: &[&str]) -> CacheConfig {
        let mut config = CacheConfig::new().with_sysroot(self.sysroot.clone());
        for dir in cache_dirs {
            config = config.with_cache_dir(*dir);
        }
        config
    }

    fn fdc(&self, cache_dirs: &[&str]) -> FontDirCache {
        FontDirCache::with_registry(self.config(cache_dirs), Registry::new())
    }

    fn font_dir(&self) -> Utf8PathBuf {
        self.sysroot.join("fonts/a")
    }

    fn set_dir_mtime(&self, sec: u64) {
        let when = UNIX_EPOCH + Duration::new(sec, 0);
        File::open(self.font_dir())
            .unwrap()
            .set_times(FileTimes::new().set_modified(when).set_accessed(when))
            .unwrap();
    }

    /// Build and write a cache for `/fonts/a` into `cache_dir`.
    fn write_cache(&self, cache_dir: &str) -> Utf8PathBuf {
        let fdc = self.fdc(&[cache_dir]);
        let set = FontSet::from(vec![Pattern::new().with("family", "Recovery")]);
        let stat = FileStat::of(self.font_dir()).unwrap();
        let cache = fdc.dir_build(&set, "/fonts/a", &stat, &[]).unwrap();
        fdc.dir_write(&cache).unwrap()
    }
}

#[test]
fn corrupt_header_bytes_are_misses() {
    let fx = Fixture::new();
    let path = fx.write_cache("/c1");
    let good = fs::read(&path).unwrap();
    let fdc = fx.fdc(&["/c1"]);

    for i in 0..HEADER_SIZE {
        let mut bad = good.clone();
        bad[i] ^= 0xFF;
        fs::write(&path, &bad).unwrap();
        let err = fdc.dir_load("/fonts/a").unwrap_err();
        assert!(err.is_miss(), "byte {}: {}", i, err);
        assert!(fdc.registry().is_empty());
        // The probe only reads magic, version, size and checksum.
        if i < 8 + 2 * std::mem::size_of::<isize>() {
            assert!(!fdc.dir_valid("/fonts/a"), "byte {} passed the probe", i);
        }
    }

    fs::write(&path, &good).unwrap();
    assert!(fdc.dir_load("/fonts/a").is_ok());
}

#[test]
fn truncated_file_is_malformed() {
    let fx = Fixture::new();
    let path = fx.write_cache("/c1");
    let good = fs::read(&path).unwrap();
    let fdc = fx.fdc(&["/c1"]);
    for len in [0, 4, HEADER_SIZE - 1, HEADER_SIZE, good.len() - 1] {
        fs::write(&path, &good[..len]).unwrap();
        let err = fdc.dir_load("/fonts/a").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "len {}: {}", len, err);
    }
}

#[test]
fn search_path_skips_invalid_candidates() {
    let fx = Fixture::new();
    let good = fx.write_cache("/c2");
    let name = good.file_name().unwrap().to_string();
    let mut bad = fs::read(&good).unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    bad[HEADER_SIZE] ^= 0xFF;
    fs::write(fx.sysroot.join("c1").join(&name), &bad).unwrap();

    let fdc = fx.fdc(&["/c1", "/c2"]);
    let (cache, found) = fdc.dir_load_with_path("/fonts/a").unwrap();
    assert_eq!(found, good);
    assert_eq!(cache.dir(), "/fonts/a");
    assert!(fdc.dir_valid("/fonts/a"));
}

#[test]
fn stale_cache_is_reported_as_stale() {
    let fx = Fixture::new();
    fx.set_dir_mtime(1_600_000_000);
    fx.write_cache("/c1");
    fx.set_dir_mtime(1_600_000_001);
    let fdc = fx.fdc(&["/c1"]);
    let err = fdc.dir_load("/fonts/a").unwrap_err();
    assert!(matches!(err, Error::Stale(_)), "{}", err);
}

#[test]
fn contended_write_leaves_original_intact() {
    let fx = Fixture::new();
    let path = fx.write_cache("/c1");
    let original = fs::read(&path).unwrap();

    let fdc = fx.fdc(&["/c1"]);
    let set = FontSet::from(vec![Pattern::new().with("family", "Replacement")]);
    let stat = FileStat::of(fx.font_dir()).unwrap();
    let cache = fdc.dir_build(&set, "/fonts/a", &stat, &[]).unwrap();

    let held = AtomicFile::new(&path).unwrap();
    let err = fdc.dir_write(&cache).unwrap_err();
    assert!(matches!(err, Error::LockContention(_)), "{}", err);
    assert_eq!(fs::read(&path).unwrap(), original);

    drop(held);
    fdc.dir_write(&cache).unwrap();
    assert_ne!(fs::read(&path).unwrap(), original);
    let leftovers = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn unlink_removes_legacy_marker_and_keeps_dir_times() {
    let fx = Fixture::new();
    let id = "0123abcd-4567-89ef-0123-456789abcdef";
    fs::write(fx.font_dir().join(UUID_FILE), id).unwrap();
    fx.set_dir_mtime(1_650_000_000);
    let config = fx.config(&["/c1"]);

    let primary = fx.write_cache("/c1");
    let legacy = legacy_basename(&config, Utf8Path::new("/fonts/a")).unwrap();
    assert_eq!(legacy.file_name(), format!("{}-{}{}", id, ARCH, SUFFIX));
    let legacy_path = fx.sysroot.join("c1").join(legacy.file_name());
    fs::copy(&primary, &legacy_path).unwrap();

    let fdc = fx.fdc(&["/c1"]);
    assert!(fdc.dir_unlink("/fonts/a").unwrap());
    assert!(!primary.exists());
    assert!(!legacy_path.exists());
    assert!(!fx.font_dir().join(UUID_FILE).exists());
    assert_eq!(FileStat::of(fx.font_dir()).unwrap().mtime, 1_650_000_000);
    assert!(!fdc.dir_unlink("/fonts/a").unwrap());
}

#[test]
fn dir_lock_excludes_other_holders() {
    use fs2::FileExt;

    let fx = Fixture::new();
    let path = fx.write_cache("/c1");
    let fdc = fx.fdc(&["/c1"]);
    let lock = fdc.dir_lock("/fonts/a").unwrap();
    assert_eq!(lock.path(), path.as_path());

    let other = File::open(&path).unwrap();
    assert!(other.try_lock_exclusive().is_err());
    drop(lock);
    assert!(other.try_lock_exclusive().is_ok());

    let missing = fdc.dir_lock("/fonts/elsewhere").unwrap_err();
    assert!(matches!(missing, Error::NotFound(_)));
}

#[test]
fn cleaner_drops_orphans_across_the_search_path() {
    let fx = Fixture::new();
    let kept = fx.write_cache("/c1");
    fs::create_dir_all(fx.sysroot.join("fonts/b")).unwrap();
    let fdc = fx.fdc(&["/c2"]);
    let stat = FileStat::of(fx.sysroot.join("fonts/b")).unwrap();
    let set = FontSet::from(vec![Pattern::new().with("family", "Orphan")]);
    let orphan_cache = fdc.dir_build(&set, "/fonts/b", &stat, &[]).unwrap();
    let orphan = fdc.dir_write(&orphan_cache).unwrap();
    drop(orphan_cache);
    fs::remove_dir(fx.sysroot.join("fonts/b")).unwrap();

    let both = fx.fdc(&["/c1", "/c2"]);
    let reports = both.clean(false).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports[0].removed.is_empty());
    assert_eq!(reports[1].removed, vec![orphan.clone()]);
    assert!(kept.exists());
    assert!(!orphan.exists());
    assert_eq!(
        kept.file_name(),
        Some(basename(both.config(), Utf8Path::new("/fonts/a")).file_name())
    );
}
