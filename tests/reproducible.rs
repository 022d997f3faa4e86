// this_file: tests/reproducible.rs
//! Reproducible builds under SOURCE_DATE_EPOCH
//!
//! Every test in this binary runs with the same epoch in the environment.

use camino::{Utf8Path, Utf8PathBuf};
use fcdircache::{CacheConfig, FileStat, FontDirCache, FontSet, Pattern, Registry};
use std::fs::{self, File, FileTimes};
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

const EPOCH: u64 = 1_000_000_000;

fn with_epoch() {
    std::env::set_var("SOURCE_DATE_EPOCH", EPOCH.to_string());
}

fn setup(sec: u64, nsec: u32) -> (TempDir, FontDirCache, FileStat) {
    with_epoch();
    let root = TempDir::new().unwrap();
    let sysroot = Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap();
    let dir = sysroot.join("fonts/a");
    fs::create_dir_all(&dir).unwrap();
    let when = UNIX_EPOCH + Duration::new(sec, nsec);
    File::open(&dir)
        .unwrap()
        .set_times(FileTimes::new().set_modified(when).set_accessed(when))
        .unwrap();
    let stat = FileStat::of(&dir).unwrap();
    let config = CacheConfig::new()
        .with_sysroot(sysroot)
        .with_cache_dir("/cache");
    (root, FontDirCache::with_registry(config, Registry::new()), stat)
}

fn font_set() -> FontSet {
    FontSet::from(vec![
        Pattern::new().with("family", "Repro").with("weight", 200),
        Pattern::new().with("family", "Repro").with("slant", 100),
    ])
}

#[test]
fn future_mtime_is_clamped_to_epoch() {
    let (_root, fdc, stat) = setup(2_000_000_000, 500);
    let cache = fdc.dir_build(&font_set(), "/fonts/a", &stat, &[]).unwrap();
    assert_eq!(cache.checksum(), EPOCH as i32);
    assert_eq!(cache.checksum_nano(), 0);

    // The clamped checksum is what the loader expects as well.
    fdc.dir_write(&cache).unwrap();
    drop(cache);
    let loaded = fdc.dir_load("/fonts/a").unwrap();
    assert_eq!(loaded.checksum(), EPOCH as i32);
    assert!(fdc.dir_valid("/fonts/a"));
}

#[test]
fn past_mtime_is_recorded_exactly() {
    let (_root, fdc, stat) = setup(900_000_000, 77);
    let cache = fdc.dir_build(&font_set(), "/fonts/a", &stat, &[]).unwrap();
    assert_eq!(cache.checksum(), 900_000_000);
    assert_eq!(cache.checksum_nano(), 77);
}

#[test]
fn identical_inputs_give_identical_files() {
    let (_root, fdc, stat) = setup(2_000_000_000, 500);
    let subdirs = vec!["a".to_string(), "b".to_string()];
    let first = fdc.dir_build(&font_set(), "/fonts/a", &stat, &subdirs).unwrap();
    let second = fdc.dir_build(&font_set(), "/fonts/a", &stat, &subdirs).unwrap();
    assert_ne!(first.base(), second.base());
    assert_eq!(first.as_bytes(), second.as_bytes());

    let path = fdc.dir_write(&first).unwrap();
    let written = fs::read(&path).unwrap();
    fdc.dir_write(&second).unwrap();
    assert_eq!(fs::read(&path).unwrap(), written);
    assert_eq!(&written[4..], &first.as_bytes()[4..]);
    assert_eq!(
        path.file_name(),
        Some(fcdircache::basename(fdc.config(), Utf8Path::new("/fonts/a")).file_name())
    );
}
