// this_file: src/stat.rs
//! File identity, directory time checksums and `SOURCE_DATE_EPOCH` clamping.

use log::warn;
use std::fs::{self, File, Metadata};
use std::io;
use std::path::Path;

/// Subset of `stat(2)` the cache cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
}

impl FileStat {
    /// Extract the fields from file metadata.
    #[cfg(unix)]
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.len(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }

    /// Extract the fields from file metadata.
    #[cfg(not(unix))]
    pub fn from_metadata(meta: &Metadata) -> Self {
        let (mtime, mtime_nsec) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, d.subsec_nanos() as i64))
            .unwrap_or((0, 0));
        Self {
            dev: 0,
            ino: 0,
            size: meta.len(),
            mtime,
            mtime_nsec,
        }
    }

    /// `stat` a path, following symlinks.
    pub fn of(path: impl AsRef<Path>) -> io::Result<Self> {
        fs::metadata(path).map(|m| Self::from_metadata(&m))
    }

    /// `fstat` an open file.
    pub fn of_file(file: &File) -> io::Result<Self> {
        file.metadata().map(|m| Self::from_metadata(&m))
    }

    /// Filesystem identity used by the registry's stat lookup.
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            dev: self.dev,
            ino: self.ino,
            mtime: self.mtime,
            mtime_nsec: self.mtime_nsec,
        }
    }
}

/// `(device, inode, mtime, mtime_nano)` of a persisted cache file.
///
/// Caches that have not been written yet carry the all-zero identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
}

/// Time checksum recorded in a cache header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirChecksum {
    pub sec: i32,
    pub nano: i32,
}

impl DirChecksum {
    /// Checksum for a directory, honouring `SOURCE_DATE_EPOCH`.
    pub fn from_stat(dir_stat: &FileStat) -> Self {
        Self::compute(dir_stat.mtime, dir_stat.mtime_nsec, source_date_epoch())
    }

    /// Checksum of `(mtime, mtime_nsec)` clamped downward to `epoch`.
    ///
    /// The seconds field is truncated to 32 bits, matching the on-disk width.
    pub fn compute(mtime: i64, mtime_nsec: i64, epoch: Option<u64>) -> Self {
        match epoch {
            Some(epoch) if (epoch as i128) < mtime as i128 => Self {
                sec: epoch as i32,
                nano: 0,
            },
            _ => Self {
                sec: mtime as i32,
                nano: mtime_nsec as i32,
            },
        }
    }
}

/// Parsed `SOURCE_DATE_EPOCH`, or `None` when unset or malformed.
pub fn source_date_epoch() -> Option<u64> {
    let raw = std::env::var("SOURCE_DATE_EPOCH").ok()?;
    match parse_source_date_epoch(&raw) {
        Ok(epoch) => Some(epoch),
        Err(reason) => {
            warn!("SOURCE_DATE_EPOCH {}, ignoring it", reason);
            None
        }
    }
}

fn parse_source_date_epoch(raw: &str) -> Result<u64, String> {
    let digits_end = raw
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    if digits_end == 0 {
        return Err("invalid".to_string());
    }
    if digits_end != raw.len() {
        return Err("has trailing garbage".to_string());
    }
    raw.parse::<u64>()
        .map_err(|e| format!("out of range: {}: {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn epoch_clamps_downward_only() {
        let clamped = DirChecksum::compute(2_000_000_000, 500, Some(1_000_000_000));
        assert_eq!(
            clamped,
            DirChecksum {
                sec: 1_000_000_000,
                nano: 0
            }
        );

        let kept = DirChecksum::compute(900_000_000, 42, Some(1_000_000_000));
        assert_eq!(
            kept,
            DirChecksum {
                sec: 900_000_000,
                nano: 42
            }
        );

        let equal = DirChecksum::compute(1_000_000_000, 7, Some(1_000_000_000));
        assert_eq!(equal.nano, 7);
    }

    #[test]
    fn no_epoch_records_mtime() {
        let sum = DirChecksum::compute(1_700_000_000, 123, None);
        assert_eq!(sum.sec, 1_700_000_000);
        assert_eq!(sum.nano, 123);
    }

    #[test]
    fn epoch_parsing() {
        assert_eq!(parse_source_date_epoch("1000000000"), Ok(1_000_000_000));
        assert!(parse_source_date_epoch("").is_err());
        assert!(parse_source_date_epoch("abc").is_err());
        assert!(parse_source_date_epoch("12abc").is_err());
        assert!(parse_source_date_epoch("-5").is_err());
        assert!(parse_source_date_epoch("99999999999999999999999").is_err());
    }

    #[test]
    fn stat_reports_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"abc").unwrap();
        let stat = FileStat::of(&path).unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(stat.identity().mtime, stat.mtime);
        assert!(FileStat::of(dir.path().join("missing")).is_err());
    }
}
