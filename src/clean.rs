// this_file: src/clean.rs
//! Removal of invalid and orphaned cache files from the search path.

use crate::basename::is_cache_file_name;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::loader::{inspect_file, stat_dir};
use crate::logging::Timer;
use crate::registry::Registry;
use crate::writer::is_writable;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info, log, warn, Level};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;

/// Outcome of cleaning one cache directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub cache_dir: Utf8PathBuf,
    /// Files whose names look like cache files
    pub scanned: usize,
    pub removed: Vec<Utf8PathBuf>,
    /// Files that should have been removed but could not be
    pub failed: Vec<Utf8PathBuf>,
    /// Whether the directory was skipped as unwritable or missing
    pub skipped: bool,
}

/// Why a cache file has to go, or `None` if it is still useful.
fn verdict(config: &CacheConfig, registry: &Registry, path: &Utf8Path) -> Option<String> {
    // Out-of-date caches are left for the next write to replace.
    let cache = match inspect_file(registry, path) {
        Ok(cache) => cache,
        Err(e) => return Some(format!("invalid cache file: {}", e)),
    };
    let dir = Utf8PathBuf::from(cache.dir());
    drop(cache);
    match stat_dir(config, &dir) {
        Ok(_) => None,
        Err(Error::NotFound(_)) => Some(format!("{} does not exist", dir)),
        Err(e) => {
            debug!("keeping {}: {}", path, e);
            None
        }
    }
}

/// Validate every cache file in `cache_dir` and unlink the bad ones.
///
/// `cache_dir` is a search-path entry; the sysroot is applied here.
pub fn clean_cache_dir(
    config: &CacheConfig,
    registry: &Registry,
    cache_dir: &Utf8Path,
    verbose: bool,
) -> Result<CleanReport> {
    let _timer = Timer::new(format!("cleaning {}", cache_dir));
    let root = config.addressed(cache_dir);
    let mut report = CleanReport {
        cache_dir: cache_dir.to_path_buf(),
        ..CleanReport::default()
    };
    let level = if verbose { Level::Info } else { Level::Debug };

    if !root.is_dir() {
        debug!("{}: not cleaning non-existent cache directory", root);
        report.skipped = true;
        return Ok(report);
    }
    if !is_writable(&root) {
        info!("{}: not cleaning unwritable cache directory", root);
        report.skipped = true;
        return Ok(report);
    }
    log!(level, "{}: cleaning cache directory", root);

    let mut candidates = Vec::new();
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_cache_file_name(&name) {
            candidates.push(root.join(name));
        }
    }
    report.scanned = candidates.len();

    let doomed: Vec<(Utf8PathBuf, String)> = candidates
        .into_par_iter()
        .filter_map(|path| verdict(config, registry, &path).map(|why| (path, why)))
        .collect();

    for (path, why) in doomed {
        log!(level, "{}: {}", path, why);
        match fs::remove_file(&path) {
            Ok(()) => report.removed.push(path),
            Err(e) => {
                warn!("{}: unable to unlink: {}", path, e);
                report.failed.push(path);
            }
        }
    }
    report.removed.sort();
    debug!(
        "{}: {} scanned, {} removed, {} failed",
        root,
        report.scanned,
        report.removed.len(),
        report.failed.len()
    );
    Ok(report)
}

/// Clean every directory on the search path.
pub fn clean_all(
    config: &CacheConfig,
    registry: &Registry,
    verbose: bool,
) -> Result<Vec<CleanReport>> {
    config
        .cache_dirs
        .iter()
        .map(|dir| clean_cache_dir(config, registry, dir, verbose))
        .collect()
}
