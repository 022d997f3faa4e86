// this_file: src/serialize.rs
//! Position-independent layout builder.
//!
//! Building a cache buffer happens in two passes. The measuring pass reserves
//! every region (records, tables, interned strings) and hands back offsets from
//! the start of the buffer. [`Serializer::commit`] then allocates one zeroed
//! buffer of the measured size and the emitting pass fills the reserved regions
//! in. Offsets handed out while measuring stay valid while emitting.
//!
//! The module also holds the byte-level readers shared by the validator and the
//! zero-copy views. Every reader is bounds-checked and returns
//! [`Error::Malformed`] instead of panicking.

use crate::error::{Error, Result};
use std::any::TypeId;
use std::collections::HashMap;

/// Pointer width; every reservation and plain offset is aligned to it.
pub const ALIGN: usize = std::mem::size_of::<isize>();

/// Size of one pointer-width word in the layout.
pub const WORD: usize = std::mem::size_of::<isize>();

/// Round `n` up to the next multiple of [`ALIGN`].
pub const fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Tag an aligned relative offset so it can be told apart from a pointer.
pub const fn encode_offset(offset: isize) -> isize {
    offset | 1
}

/// Whether `raw` carries the encoded-offset tag.
pub const fn is_encoded_offset(raw: isize) -> bool {
    raw & (ALIGN as isize - 1) == 1
}

/// Strip the tag from an encoded offset.
pub const fn decode_offset(raw: isize) -> isize {
    raw & !1
}

/// Relative offset from `anchor` to `target`, both buffer offsets.
pub fn relative(anchor: usize, target: usize) -> isize {
    target as isize - anchor as isize
}

/// `anchor + rel` if it lands inside a buffer of `len` bytes.
///
/// The end of the buffer itself is accepted so empty trailing regions resolve;
/// any read from there fails its own bounds check.
pub fn resolve(anchor: usize, rel: isize, len: usize) -> Result<usize> {
    let target = (anchor as isize)
        .checked_add(rel)
        .filter(|t| *t >= 0)
        .map(|t| t as usize)
        .filter(|t| *t <= len)
        .ok_or_else(|| {
            Error::malformed(format!(
                "offset {} from {} leaves the {}-byte buffer",
                rel, anchor, len
            ))
        })?;
    Ok(target)
}

fn field<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    offset
        .checked_add(N)
        .and_then(|end| bytes.get(offset..end))
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| {
            Error::malformed(format!(
                "{}-byte field at {} past end of {}-byte buffer",
                N,
                offset,
                bytes.len()
            ))
        })
}

/// Read a native-endian pointer-width word.
pub fn read_word(bytes: &[u8], offset: usize) -> Result<isize> {
    field::<WORD>(bytes, offset).map(isize::from_ne_bytes)
}

/// Read a native-endian `u32`.
pub fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    field::<4>(bytes, offset).map(u32::from_ne_bytes)
}

/// Read a native-endian `i32`.
pub fn read_i32(bytes: &[u8], offset: usize) -> Result<i32> {
    field::<4>(bytes, offset).map(i32::from_ne_bytes)
}

/// Read a native-endian `i64`.
pub fn read_i64(bytes: &[u8], offset: usize) -> Result<i64> {
    field::<8>(bytes, offset).map(i64::from_ne_bytes)
}

/// Read the NUL-terminated UTF-8 string starting at `offset`.
pub fn read_str(bytes: &[u8], offset: usize) -> Result<&str> {
    let tail = bytes
        .get(offset..)
        .ok_or_else(|| Error::malformed(format!("string offset {} out of range", offset)))?;
    let nul = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::malformed(format!("string at {} is not terminated", offset)))?;
    std::str::from_utf8(&tail[..nul])
        .map_err(|e| Error::malformed(format!("string at {} is not UTF-8: {}", offset, e)))
}

/// Check that a plain offset target is word-aligned.
pub fn check_aligned(offset: usize, what: &str) -> Result<()> {
    if offset % ALIGN != 0 {
        return Err(Error::malformed(format!(
            "{} at {} is not {}-byte aligned",
            what, offset, ALIGN
        )));
    }
    Ok(())
}

/// Something that can lay itself out through a [`Serializer`].
///
/// `reserve` runs during the measuring pass and must reserve every region that
/// `emit` later writes. `emit` returns the offset of the object's root record.
pub trait CacheSerialize {
    /// Measure: reserve the regions this value occupies.
    fn reserve(&self, ser: &mut Serializer) -> Result<()>;

    /// Emit: write the value into its reserved regions.
    fn emit(&self, ser: &mut Serializer) -> Result<usize>;
}

/// Two-phase layout builder.
#[derive(Debug, Default)]
pub struct Serializer {
    size: usize,
    objects: HashMap<(usize, TypeId), usize>,
    strings: HashMap<String, usize>,
    buf: Option<Vec<u8>>,
}

impl Serializer {
    /// Start measuring an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes measured so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether [`Serializer::commit`] has run.
    pub fn is_committed(&self) -> bool {
        self.buf.is_some()
    }

    fn measuring(&self) -> Result<()> {
        if self.buf.is_some() {
            return Err(Error::malformed("reservation after commit"));
        }
        Ok(())
    }

    /// Reserve `n` bytes at the next aligned position.
    pub fn reserve(&mut self, n: usize) -> Result<usize> {
        self.measuring()?;
        let offset = self.size;
        self.size = offset
            .checked_add(align_up(n))
            .ok_or_else(|| Error::ResourceExhausted(format!("layout overflow reserving {}", n)))?;
        Ok(offset)
    }

    /// Reserve `n` bytes for `obj`, once per object identity.
    ///
    /// Objects are identified by address and type, so distinct values that compare
    /// equal still get their own region. Returns the region's offset.
    pub fn alloc<T: 'static + ?Sized>(&mut self, obj: &T, n: usize) -> Result<usize> {
        let key = object_key(obj);
        if let Some(offset) = self.objects.get(&key) {
            return Ok(*offset);
        }
        let offset = self.reserve(n)?;
        self.objects.insert(key, offset);
        Ok(offset)
    }

    /// Offset reserved for `obj` by [`Serializer::alloc`].
    pub fn offset_of<T: 'static + ?Sized>(&self, obj: &T) -> Result<usize> {
        self.objects
            .get(&object_key(obj))
            .copied()
            .ok_or_else(|| Error::malformed("object was not reserved before emission"))
    }

    /// Reserve room for `s` plus its terminator; equal strings share one region.
    pub fn intern_string(&mut self, s: &str) -> Result<usize> {
        if let Some(offset) = self.strings.get(s) {
            return Ok(*offset);
        }
        if s.contains('\0') {
            return Err(Error::malformed(format!("string {:?} contains NUL", s)));
        }
        let offset = self.reserve(s.len() + 1)?;
        self.strings.insert(s.to_owned(), offset);
        Ok(offset)
    }

    /// Offset previously interned for `s`.
    pub fn string_offset(&self, s: &str) -> Result<usize> {
        self.strings
            .get(s)
            .copied()
            .ok_or_else(|| Error::malformed(format!("string {:?} was not interned", s)))
    }

    /// Reserve the subdirectory offset table and every subdirectory name.
    ///
    /// The table is reserved first so it directly follows whatever was reserved
    /// before this call.
    pub fn reserve_subdirs<S: AsRef<str> + 'static>(&mut self, dirs: &[S]) -> Result<usize> {
        let table_len = dirs
            .len()
            .checked_mul(WORD)
            .ok_or_else(|| Error::ResourceExhausted("subdirectory table overflow".into()))?;
        let table = self.alloc(dirs, table_len)?;
        for dir in dirs {
            self.intern_string(dir.as_ref())?;
        }
        Ok(table)
    }

    /// Reserve a pattern set through its serializer contract.
    pub fn reserve_pattern_set<S: CacheSerialize>(&mut self, set: &S) -> Result<()> {
        self.measuring()?;
        set.reserve(self)
    }

    /// Allocate the zeroed output buffer, ending the measuring pass.
    pub fn commit(&mut self) -> Result<()> {
        self.measuring()?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(self.size).map_err(|e| {
            Error::ResourceExhausted(format!("cannot allocate {} bytes: {}", self.size, e))
        })?;
        buf.resize(self.size, 0);
        self.buf = Some(buf);
        Ok(())
    }

    fn buffer(&mut self) -> Result<&mut Vec<u8>> {
        self.buf
            .as_mut()
            .ok_or_else(|| Error::malformed("emission before commit"))
    }

    /// Copy `bytes` into the buffer at `offset`.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let buf = self.buffer()?;
        let len = buf.len();
        let dest = offset
            .checked_add(bytes.len())
            .and_then(|end| buf.get_mut(offset..end))
            .ok_or_else(|| {
                Error::malformed(format!(
                    "write of {} bytes at {} exceeds the {}-byte layout",
                    bytes.len(),
                    offset,
                    len
                ))
            })?;
        dest.copy_from_slice(bytes);
        Ok(())
    }

    /// Write a pointer-width word.
    pub fn put_word(&mut self, offset: usize, value: isize) -> Result<()> {
        self.write_bytes(offset, &value.to_ne_bytes())
    }

    /// Write a `u32`.
    pub fn put_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_ne_bytes())
    }

    /// Write an `i32`.
    pub fn put_i32(&mut self, offset: usize, value: i32) -> Result<()> {
        self.write_bytes(offset, &value.to_ne_bytes())
    }

    /// Write an `i64`.
    pub fn put_i64(&mut self, offset: usize, value: i64) -> Result<()> {
        self.write_bytes(offset, &value.to_ne_bytes())
    }

    /// Materialize an interned string and return its offset.
    pub fn write_string(&mut self, s: &str) -> Result<usize> {
        let offset = self.string_offset(s)?;
        self.write_bytes(offset, s.as_bytes())?;
        Ok(offset)
    }

    /// Fill in the subdirectory table and its strings; returns the table offset.
    pub fn write_subdirs<S: AsRef<str> + 'static>(&mut self, dirs: &[S]) -> Result<usize> {
        let table = self.offset_of(dirs)?;
        for (i, dir) in dirs.iter().enumerate() {
            let name = self.write_string(dir.as_ref())?;
            self.put_word(table + i * WORD, relative(table, name))?;
        }
        Ok(table)
    }

    /// Emit a pattern set into its reserved regions; returns its root offset.
    pub fn write_pattern_set<S: CacheSerialize>(&mut self, set: &S) -> Result<usize> {
        self.buffer()?;
        set.emit(self)
    }

    /// Take the finished buffer.
    pub fn finish(self) -> Result<Vec<u8>> {
        self.buf
            .ok_or_else(|| Error::malformed("serializer finished before commit"))
    }
}

fn object_key<T: 'static + ?Sized>(obj: &T) -> (usize, TypeId) {
    (obj as *const T as *const () as usize, TypeId::of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_aligned() {
        let mut ser = Serializer::new();
        assert_eq!(ser.reserve(3).unwrap(), 0);
        assert_eq!(ser.reserve(1).unwrap(), ALIGN);
        assert_eq!(ser.reserve(0).unwrap(), 2 * ALIGN);
        assert_eq!(ser.size(), 2 * ALIGN);
    }

    #[test]
    fn strings_are_interned_once() {
        let mut ser = Serializer::new();
        let a = ser.intern_string("family").unwrap();
        let b = ser.intern_string("style").unwrap();
        assert_eq!(ser.intern_string("family").unwrap(), a);
        assert_ne!(a, b);

        ser.commit().unwrap();
        assert_eq!(ser.write_string("family").unwrap(), a);
        ser.write_string("style").unwrap();
        let buf = ser.finish().unwrap();
        assert_eq!(read_str(&buf, a).unwrap(), "family");
        assert_eq!(read_str(&buf, b).unwrap(), "style");
    }

    #[test]
    fn objects_are_keyed_by_identity() {
        let x = [1u32, 2];
        let y = [1u32, 2];
        let mut ser = Serializer::new();
        let a = ser.alloc(&x, 8).unwrap();
        assert_eq!(ser.alloc(&x, 8).unwrap(), a);
        assert_ne!(ser.alloc(&y, 8).unwrap(), a);
        assert_eq!(ser.offset_of(&x).unwrap(), a);
    }

    #[test]
    fn subdir_table_points_at_names() {
        let dirs = vec!["a".to_string(), "bb".to_string()];
        let mut ser = Serializer::new();
        let table = ser.reserve_subdirs(&dirs).unwrap();
        ser.commit().unwrap();
        assert_eq!(ser.write_subdirs(&dirs).unwrap(), table);
        let buf = ser.finish().unwrap();
        for (i, name) in dirs.iter().enumerate() {
            let rel = read_word(&buf, table + i * WORD).unwrap();
            let at = resolve(table, rel, buf.len()).unwrap();
            assert_eq!(read_str(&buf, at).unwrap(), name);
        }
    }

    #[test]
    fn phases_are_enforced() {
        let mut ser = Serializer::new();
        assert!(ser.put_word(0, 1).is_err());
        ser.reserve(WORD).unwrap();
        ser.commit().unwrap();
        assert!(ser.reserve(1).is_err());
        assert!(ser.put_word(WORD, 1).is_err());
        ser.put_word(0, -1).unwrap();
        assert_eq!(read_word(&ser.finish().unwrap(), 0).unwrap(), -1);
    }

    #[test]
    fn offset_tagging() {
        for raw in [0isize, 8, 64, -8, -64] {
            let enc = encode_offset(raw);
            assert!(is_encoded_offset(enc));
            assert_eq!(decode_offset(enc), raw);
            assert!(!is_encoded_offset(raw));
        }
    }

    #[test]
    fn readers_reject_out_of_range() {
        let buf = [0u8; 4];
        assert!(read_word(&buf, 0).is_err());
        assert!(read_u32(&buf, 1).is_err());
        assert!(read_u32(&buf, usize::MAX).is_err());
        assert!(read_str(b"abc", 0).is_err());
        assert!(read_str(b"abc\0", 9).is_err());
        assert!(resolve(0, -1, 4).is_err());
        assert!(resolve(2, 3, 4).is_err());
        assert_eq!(resolve(2, 1, 4).unwrap(), 3);
        assert_eq!(resolve(2, 2, 4).unwrap(), 4);
    }
}
