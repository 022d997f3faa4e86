// this_file: src/basename.rs
//! Cache file naming: `/<hex32>-<arch><suffix>`.
//!
//! The primary basename digests the (possibly remapped) directory path followed by
//! its salt. The legacy basename reuses the 36-byte identifier stored in a
//! directory's `.uuid` marker.

use crate::config::CacheConfig;
use crate::digest::Digest;
use camino::Utf8Path;
use log::debug;
use std::fmt;
use std::fs::File;
use std::io::Read;

/// Byte order and pointer width of the layouts this build reads and writes.
#[cfg(all(target_endian = "little", target_pointer_width = "64"))]
pub const ARCH: &str = "le64";
#[cfg(all(target_endian = "big", target_pointer_width = "64"))]
pub const ARCH: &str = "be64";
#[cfg(all(target_endian = "little", target_pointer_width = "32"))]
pub const ARCH: &str = "le32";
#[cfg(all(target_endian = "big", target_pointer_width = "32"))]
pub const ARCH: &str = "be32";

/// Format-version suffix; changing it orphans every existing cache file.
pub const SUFFIX: &str = ".dircache-1";

/// Number of hex digits in a primary basename.
pub const HEX_LEN: usize = 32;

/// Bytes read from a `.uuid` marker for the legacy basename.
pub const UUID_LEN: usize = 36;

/// Name of the legacy identifier file inside a font directory.
pub const UUID_FILE: &str = ".uuid";

/// Length of a primary basename, leading slash included.
pub const BASENAME_LEN: usize = 1 + HEX_LEN + 1 + ARCH.len() + SUFFIX.len();

/// A cache file name with its leading `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheBasename(String);

impl CacheBasename {
    fn from_id(id: &str) -> Self {
        CacheBasename(format!("/{}-{}{}", id, ARCH, SUFFIX))
    }

    /// The basename including its leading slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The basename without its leading slash, for joining onto a directory.
    pub fn file_name(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for CacheBasename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary basename of `dir` under `config`.
///
/// Depends only on the configuration's remap and salt rules, never on the
/// filesystem.
pub fn basename(config: &CacheConfig, dir: &Utf8Path) -> CacheBasename {
    let mapped = config.map_font_path(dir);
    let hashed = mapped.as_deref().unwrap_or(dir);
    let salt = config.map_salt(dir);

    let mut digest = Digest::new();
    digest.update(hashed.as_str().as_bytes());
    if let Some(salt) = salt {
        digest.update(salt.as_bytes());
    }
    let name = CacheBasename::from_id(&digest.finalize_hex());

    match (mapped.as_deref(), salt) {
        (None, None) => debug!("cache basename for {}: {}", dir, name),
        (mapped, salt) => debug!(
            "cache basename for {} (as {}, salt {:?}): {}",
            dir,
            mapped.unwrap_or(dir),
            salt.unwrap_or(""),
            name
        ),
    }
    name
}

/// Legacy basename read from `<sysroot>/<dir>/.uuid`, if that marker exists.
///
/// Remap rules do not apply. Any I/O failure or short read yields `None`.
pub fn legacy_basename(config: &CacheConfig, dir: &Utf8Path) -> Option<CacheBasename> {
    let path = config.addressed(dir).join(UUID_FILE);
    let mut file = File::open(&path).ok()?;
    let mut id = [0u8; UUID_LEN];
    file.read_exact(&mut id).ok()?;
    let id = std::str::from_utf8(&id).ok()?;
    if id.contains(|c: char| c == '/' || c.is_ascii_control()) {
        debug!("ignoring unusable identifier in {}", path);
        return None;
    }
    Some(CacheBasename::from_id(id))
}

/// Whether `name` has the shape of a primary cache file name (no leading slash).
pub fn is_cache_file_name(name: &str) -> bool {
    if name.len() < HEX_LEN || !name.is_char_boundary(HEX_LEN) {
        return false;
    }
    let (hex, rest) = name.split_at(HEX_LEN);
    hex.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && rest.strip_prefix('-').and_then(|r| r.strip_prefix(ARCH)) == Some(SUFFIX)
}
