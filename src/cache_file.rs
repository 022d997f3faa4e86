// this_file: src/cache_file.rs
//! On-disk directory cache format.
//!
//! ```text
//! 0         magic          u32
//! 4         version        u32
//! 8         size           isize   total length in bytes
//! 8+W       checksum       i32     directory mtime seconds
//! 12+W      checksum_nano  i32     directory mtime nanoseconds
//! 16+W      dir            isize   offset of the directory string
//! 16+2W     dirs           isize   offset of the subdirectory table
//! 16+3W     dirs_count     isize   subdirectory entries
//! 16+4W     set            isize   offset of the font set record
//! ```
//!
//! `W` is the pointer width and every field is native-endian; the basename's
//! architecture tag keeps incompatible layouts apart. Header offsets are measured
//! from the start of the buffer. The directory string follows the header and the
//! subdirectory table follows the directory string; table entries are offsets
//! from the table itself.

use crate::error::{Error, Result};
use crate::pattern::{FontSet, FontSetRef};
use crate::serialize::{
    align_up, check_aligned, read_i32, read_str, read_u32, read_word, relative, resolve,
    Serializer, WORD,
};
use crate::stat::DirChecksum;
use log::debug;

/// Magic of a cache file, and of a cache whose memory is a file mapping.
pub const MAGIC_MMAP: u32 = 0xFC02_FC04;
/// Magic of a cache whose memory is a heap buffer; never written to disk.
pub const MAGIC_ALLOC: u32 = 0xFC02_FC05;

/// Format version written by this build.
pub const CACHE_VERSION: u32 = 1;
/// Oldest format version this build reads.
pub const MIN_VERSION: u32 = 1;

/// Files smaller than this are read into the heap instead of mapped.
pub const MIN_MMAP: usize = 1024;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 16 + 5 * WORD;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_SIZE: usize = 8;
const OFF_CHECKSUM: usize = 8 + WORD;
const OFF_CHECKSUM_NANO: usize = 12 + WORD;
const OFF_DIR: usize = 16 + WORD;
const OFF_DIRS: usize = 16 + 2 * WORD;
const OFF_DIRS_COUNT: usize = 16 + 3 * WORD;
const OFF_SET: usize = 16 + 4 * WORD;

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub size: usize,
    pub checksum: i32,
    pub checksum_nano: i32,
    pub dir: usize,
    pub dirs: usize,
    pub dirs_count: usize,
    pub set: usize,
}

fn non_negative(raw: isize, field: &str) -> Result<usize> {
    usize::try_from(raw).map_err(|_| Error::malformed(format!("negative {} field {}", field, raw)))
}

impl Header {
    /// Decode the header at the start of `bytes`.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::malformed(format!(
                "{} bytes is shorter than the {}-byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        Ok(Self {
            magic: read_u32(bytes, OFF_MAGIC)?,
            version: read_u32(bytes, OFF_VERSION)?,
            size: non_negative(read_word(bytes, OFF_SIZE)?, "size")?,
            checksum: read_i32(bytes, OFF_CHECKSUM)?,
            checksum_nano: read_i32(bytes, OFF_CHECKSUM_NANO)?,
            dir: non_negative(read_word(bytes, OFF_DIR)?, "dir")?,
            dirs: non_negative(read_word(bytes, OFF_DIRS)?, "dirs")?,
            dirs_count: non_negative(read_word(bytes, OFF_DIRS_COUNT)?, "dirs_count")?,
            set: non_negative(read_word(bytes, OFF_SET)?, "set")?,
        })
    }

    /// The recorded directory time checksum.
    pub fn dir_checksum(&self) -> DirChecksum {
        DirChecksum {
            sec: self.checksum,
            nano: self.checksum_nano,
        }
    }

    /// Magic, version and size checks against the length of the file on disk.
    pub fn check(&self, file_len: u64) -> Result<()> {
        if self.magic != MAGIC_MMAP {
            return Err(Error::malformed(format!("bad magic {:#010x}", self.magic)));
        }
        if !(MIN_VERSION..=CACHE_VERSION).contains(&self.version) {
            return Err(Error::malformed(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.size as u64 != file_len || self.size < HEADER_SIZE {
            return Err(Error::malformed(format!(
                "header size {} does not match file length {}",
                self.size, file_len
            )));
        }
        Ok(())
    }

    /// Compare the recorded checksum with the directory's current one.
    pub fn check_time(&self, expected: DirChecksum) -> Result<()> {
        if self.dir_checksum() != expected {
            return Err(Error::Stale(format!(
                "recorded ({}, {}) but directory is ({}, {})",
                self.checksum, self.checksum_nano, expected.sec, expected.nano
            )));
        }
        Ok(())
    }
}

/// Serialize a complete cache buffer, header included.
pub fn build(
    font_set: &FontSet,
    dir: &str,
    checksum: DirChecksum,
    subdirs: &[String],
) -> Result<Vec<u8>> {
    let mut ser = Serializer::new();
    ser.reserve(HEADER_SIZE)?;
    ser.intern_string(dir)?;
    ser.reserve_subdirs(subdirs)?;
    ser.reserve_pattern_set(font_set)?;
    ser.commit()?;
    let size = ser.size();

    let dir_at = ser.write_string(dir)?;
    let dirs_at = ser.write_subdirs(subdirs)?;
    let set_at = ser.write_pattern_set(font_set)?;

    ser.put_u32(OFF_MAGIC, MAGIC_MMAP)?;
    ser.put_u32(OFF_VERSION, CACHE_VERSION)?;
    ser.put_word(OFF_SIZE, size as isize)?;
    ser.put_i32(OFF_CHECKSUM, checksum.sec)?;
    ser.put_i32(OFF_CHECKSUM_NANO, checksum.nano)?;
    ser.put_word(OFF_DIR, relative(0, dir_at))?;
    ser.put_word(OFF_DIRS, relative(0, dirs_at))?;
    ser.put_word(OFF_DIRS_COUNT, subdirs.len() as isize)?;
    ser.put_word(OFF_SET, relative(0, set_at))?;

    debug!(
        "built cache for {}: {} bytes, {} fonts, {} subdirs",
        dir,
        size,
        font_set.len(),
        subdirs.len()
    );
    ser.finish()
}

/// Full validation of a cache buffer as read from disk.
///
/// Checks the header, the time checksum when `expected` is given, and every
/// offset reachable from the header. Time mismatches are reported as
/// [`Error::Stale`], everything else as [`Error::Malformed`].
pub fn validate(bytes: &[u8], expected: Option<DirChecksum>) -> Result<Header> {
    let header = Header::read(bytes)?;
    header.check(bytes.len() as u64)?;
    if let Some(expected) = expected {
        header.check_time(expected)?;
    }
    let view = CacheView::from_parts(bytes, header);
    view.check_structure()?;
    Ok(header)
}

/// Read-only view over a header-checked cache buffer.
#[derive(Debug, Clone, Copy)]
pub struct CacheView<'a> {
    bytes: &'a [u8],
    header: Header,
}

impl<'a> CacheView<'a> {
    /// View `bytes`, decoding the header only.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        Ok(Self {
            header: Header::read(bytes)?,
            bytes,
        })
    }

    pub(crate) fn from_parts(bytes: &'a [u8], header: Header) -> Self {
        Self { bytes, header }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The directory this cache describes.
    pub fn dir(&self) -> Result<&'a str> {
        read_str(self.bytes, self.header.dir)
    }

    pub fn num_subdirs(&self) -> usize {
        self.header.dirs_count
    }

    /// The `i`th subdirectory name.
    pub fn subdir(&self, i: usize) -> Result<&'a str> {
        if i >= self.header.dirs_count {
            return Err(Error::malformed(format!(
                "subdirectory {} of {} out of range",
                i, self.header.dirs_count
            )));
        }
        let table = self.header.dirs;
        let rel = read_word(self.bytes, table + i * WORD)?;
        let at = resolve(table, rel, self.bytes.len())?;
        check_aligned(at, "subdirectory name")?;
        read_str(self.bytes, at)
    }

    /// Every subdirectory name, in order.
    pub fn subdirs(&self) -> Result<Vec<&'a str>> {
        (0..self.header.dirs_count).map(|i| self.subdir(i)).collect()
    }

    /// The serialized font set.
    pub fn font_set(&self) -> Result<FontSetRef<'a>> {
        FontSetRef::parse(self.bytes, self.header.set)
    }

    fn check_structure(&self) -> Result<()> {
        let header = &self.header;
        if header.dir != HEADER_SIZE {
            return Err(Error::malformed(format!(
                "directory string at {} instead of {}",
                header.dir, HEADER_SIZE
            )));
        }
        let dir = self.dir()?;
        let table = align_up(header.dir + dir.len() + 1);
        if header.dirs != table {
            return Err(Error::malformed(format!(
                "subdirectory table at {} instead of {}",
                header.dirs, table
            )));
        }
        let Some(room) = self.bytes.len().checked_sub(table) else {
            return Err(Error::malformed(format!(
                "subdirectory table at {} lies past the {}-byte buffer",
                table,
                self.bytes.len()
            )));
        };
        if header.dirs_count > room / WORD {
            return Err(Error::malformed(format!(
                "{} subdirectories overrun the {}-byte buffer",
                header.dirs_count,
                self.bytes.len()
            )));
        }
        for i in 0..header.dirs_count {
            self.subdir(i)?;
        }
        self.font_set()?.validate()
    }
}
