// this_file: src/pattern.rs
//! Font pattern model and its in-cache layout.
//!
//! A [`FontSet`] is an ordered list of [`Pattern`]s; a pattern is an ordered list
//! of `object -> values` elements. Inside a cache buffer every link is a relative
//! offset:
//!
//! ```text
//! FontSet    { nfont, fonts: encoded -> [encoded -> Pattern; nfont] }
//! Pattern    { num, elts: offset -> [PatternElt; num], ref: -1 }
//! PatternElt { object: offset -> str, values: encoded -> ValueNode | 0 }
//! ValueNode  { next: encoded | 0, kind: u32, pad: u32, payload: i64 }
//! ```
//!
//! Encoded offsets carry tag bit 1. [`FontSetRef`] and [`PatternRef`] read the
//! layout in place without copying.

use crate::error::{Error, Result};
use crate::serialize::{
    check_aligned, decode_offset, encode_offset, is_encoded_offset, read_i64, read_str,
    read_u32, read_word, relative, resolve, CacheSerialize, Serializer, WORD,
};
use serde::ser::SerializeMap;
use serde::Serialize;
use std::fmt;

/// Size of a font set record.
pub const FONT_SET_SIZE: usize = 2 * WORD;
/// Size of a pattern record.
pub const PATTERN_SIZE: usize = 3 * WORD;
/// Size of one pattern element.
pub const ELT_SIZE: usize = 2 * WORD;
/// Size of one value-list node.
pub const VALUE_NODE_SIZE: usize = WORD + 16;

/// Reference-count field of every pattern stored in a cache.
pub const PATTERN_REF_MARKER: isize = -1;

const KIND_INTEGER: u32 = 1;
const KIND_DOUBLE: u32 = 2;
const KIND_STRING: u32 = 3;
const KIND_BOOL: u32 = 4;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i32),
    Double(f64),
    Bool(bool),
    String(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// One `object -> values` element of a pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternElt {
    pub object: String,
    pub values: Vec<Value>,
}

/// Ordered set of font properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pattern {
    elts: Vec<PatternElt>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` to `object`'s list, creating the element if needed.
    pub fn add(&mut self, object: impl Into<String>, value: impl Into<Value>) {
        let object = object.into();
        let value = value.into();
        match self.elts.iter_mut().find(|e| e.object == object) {
            Some(elt) => elt.values.push(value),
            None => self.elts.push(PatternElt {
                object,
                values: vec![value],
            }),
        }
    }

    /// Builder form of [`Pattern::add`].
    pub fn with(mut self, object: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add(object, value);
        self
    }

    /// Values recorded for `object`.
    pub fn get(&self, object: &str) -> Option<&[Value]> {
        self.elts
            .iter()
            .find(|e| e.object == object)
            .map(|e| e.values.as_slice())
    }

    pub fn elements(&self) -> &[PatternElt] {
        &self.elts
    }

    pub fn len(&self) -> usize {
        self.elts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elts.is_empty()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, elt) in self.elts.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{}=", elt.object)?;
            for (j, value) in elt.values.iter().enumerate() {
                if j > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}", value)?;
            }
        }
        Ok(())
    }
}

impl Serialize for Pattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.elts.len()))?;
        for elt in &self.elts {
            map.serialize_entry(&elt.object, &elt.values)?;
        }
        map.end()
    }
}

/// Ordered list of font patterns for one directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FontSet {
    fonts: Vec<Pattern>,
}

impl FontSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pattern: Pattern) {
        self.fonts.push(pattern);
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    pub fn fonts(&self) -> &[Pattern] {
        &self.fonts
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pattern> {
        self.fonts.iter()
    }
}

impl From<Vec<Pattern>> for FontSet {
    fn from(fonts: Vec<Pattern>) -> Self {
        Self { fonts }
    }
}

impl FromIterator<Pattern> for FontSet {
    fn from_iter<I: IntoIterator<Item = Pattern>>(iter: I) -> Self {
        Self {
            fonts: iter.into_iter().collect(),
        }
    }
}

impl CacheSerialize for FontSet {
    fn reserve(&self, ser: &mut Serializer) -> Result<()> {
        ser.alloc(self, FONT_SET_SIZE)?;
        ser.alloc(self.fonts.as_slice(), self.fonts.len() * WORD)?;
        for pattern in &self.fonts {
            pattern.reserve(ser)?;
        }
        Ok(())
    }

    fn emit(&self, ser: &mut Serializer) -> Result<usize> {
        let at = ser.offset_of(self)?;
        let array = ser.offset_of(self.fonts.as_slice())?;
        ser.put_word(at, self.fonts.len() as isize)?;
        ser.put_word(at + WORD, encode_offset(relative(at, array)))?;
        for (i, pattern) in self.fonts.iter().enumerate() {
            let p = pattern.emit(ser)?;
            ser.put_word(array + i * WORD, encode_offset(relative(array, p)))?;
        }
        Ok(at)
    }
}

impl CacheSerialize for Pattern {
    fn reserve(&self, ser: &mut Serializer) -> Result<()> {
        ser.alloc(self, PATTERN_SIZE)?;
        ser.alloc(self.elts.as_slice(), self.elts.len() * ELT_SIZE)?;
        for elt in &self.elts {
            ser.intern_string(&elt.object)?;
            for value in &elt.values {
                ser.alloc(value, VALUE_NODE_SIZE)?;
                if let Value::String(s) = value {
                    ser.intern_string(s)?;
                }
            }
        }
        Ok(())
    }

    fn emit(&self, ser: &mut Serializer) -> Result<usize> {
        let at = ser.offset_of(self)?;
        let elts = ser.offset_of(self.elts.as_slice())?;
        ser.put_word(at, self.elts.len() as isize)?;
        ser.put_word(at + WORD, relative(at, elts))?;
        ser.put_word(at + 2 * WORD, PATTERN_REF_MARKER)?;

        for (i, elt) in self.elts.iter().enumerate() {
            let e = elts + i * ELT_SIZE;
            let object = ser.write_string(&elt.object)?;
            ser.put_word(e, relative(e, object))?;

            // First node hangs off the element, the rest off the previous node.
            let mut prev: Option<usize> = None;
            for value in &elt.values {
                let node = ser.offset_of(value)?;
                match prev {
                    None => ser.put_word(e + WORD, encode_offset(relative(e, node)))?,
                    Some(p) => ser.put_word(p, encode_offset(relative(p, node)))?,
                }
                emit_value(ser, node, value)?;
                prev = Some(node);
            }
        }
        Ok(at)
    }
}

fn emit_value(ser: &mut Serializer, node: usize, value: &Value) -> Result<()> {
    let (kind, payload) = match value {
        Value::Integer(i) => (KIND_INTEGER, *i as i64),
        Value::Double(d) => (KIND_DOUBLE, d.to_bits() as i64),
        Value::Bool(b) => (KIND_BOOL, *b as i64),
        Value::String(s) => {
            let at = ser.write_string(s)?;
            (KIND_STRING, relative(node, at) as i64)
        }
    };
    ser.put_u32(node + WORD, kind)?;
    ser.put_i64(node + WORD + 8, payload)
}

fn encoded_target(bytes: &[u8], anchor: usize, raw: isize, what: &str) -> Result<usize> {
    if !is_encoded_offset(raw) {
        return Err(Error::malformed(format!(
            "{} at {} is not an encoded offset ({:#x})",
            what, anchor, raw
        )));
    }
    let target = resolve(anchor, decode_offset(raw), bytes.len())?;
    check_aligned(target, what)?;
    Ok(target)
}

fn count(raw: isize, what: &str) -> Result<usize> {
    usize::try_from(raw).map_err(|_| Error::malformed(format!("negative {} count {}", what, raw)))
}

fn fits(start: usize, n: usize, stride: usize, len: usize, what: &str) -> Result<()> {
    if n > (len - start) / stride {
        return Err(Error::malformed(format!(
            "{} {} entries at {} overrun the {}-byte buffer",
            n, what, start, len
        )));
    }
    Ok(())
}

/// Zero-copy view of a serialized font set.
#[derive(Debug, Clone, Copy)]
pub struct FontSetRef<'a> {
    bytes: &'a [u8],
    at: usize,
    nfont: usize,
    array: usize,
}

impl<'a> FontSetRef<'a> {
    /// Check the set record at `at` and its pattern array bounds.
    pub fn parse(bytes: &'a [u8], at: usize) -> Result<Self> {
        check_aligned(at, "font set")?;
        let nfont = count(read_word(bytes, at)?, "font")?;
        let array = encoded_target(bytes, at, read_word(bytes, at + WORD)?, "font array")?;
        fits(array, nfont, WORD, bytes.len(), "font")?;
        Ok(Self {
            bytes,
            at,
            nfont,
            array,
        })
    }

    /// Buffer offset of the set record.
    pub fn offset(&self) -> usize {
        self.at
    }

    pub fn len(&self) -> usize {
        self.nfont
    }

    pub fn is_empty(&self) -> bool {
        self.nfont == 0
    }

    /// The `i`th pattern.
    pub fn get(&self, i: usize) -> Result<PatternRef<'a>> {
        if i >= self.nfont {
            return Err(Error::malformed(format!(
                "font {} of {} out of range",
                i, self.nfont
            )));
        }
        let slot = self.array + i * WORD;
        let at = encoded_target(self.bytes, self.array, read_word(self.bytes, slot)?, "pattern")?;
        PatternRef::parse(self.bytes, at)
    }

    /// Every pattern, in order.
    pub fn iter(&self) -> impl Iterator<Item = Result<PatternRef<'a>>> + 'a {
        let set = *self;
        (0..set.nfont).map(move |i| set.get(i))
    }

    /// Walk every pattern, element and value, checking each link.
    pub fn validate(&self) -> Result<()> {
        for pattern in self.iter() {
            pattern?.validate()?;
        }
        Ok(())
    }

    /// Owned copy of the whole set.
    pub fn to_font_set(&self) -> Result<FontSet> {
        self.iter().map(|p| p?.to_pattern()).collect()
    }
}

/// Zero-copy view of one serialized pattern.
#[derive(Debug, Clone, Copy)]
pub struct PatternRef<'a> {
    bytes: &'a [u8],
    at: usize,
    num: usize,
    elts: usize,
}

impl<'a> PatternRef<'a> {
    /// Check the pattern record at `at` and its element array bounds.
    pub fn parse(bytes: &'a [u8], at: usize) -> Result<Self> {
        check_aligned(at, "pattern")?;
        let num = count(read_word(bytes, at)?, "element")?;
        let elts = resolve(at, read_word(bytes, at + WORD)?, bytes.len())?;
        check_aligned(elts, "element array")?;
        fits(elts, num, ELT_SIZE, bytes.len(), "element")?;
        let marker = read_word(bytes, at + 2 * WORD)?;
        if marker != PATTERN_REF_MARKER {
            return Err(Error::malformed(format!(
                "pattern at {} has reference marker {}",
                at, marker
            )));
        }
        Ok(Self {
            bytes,
            at,
            num,
            elts,
        })
    }

    /// Buffer offset of the pattern record.
    pub fn offset(&self) -> usize {
        self.at
    }

    /// Address of the pattern record in memory; an interior pointer of its cache.
    pub fn addr(&self) -> usize {
        self.bytes.as_ptr() as usize + self.at
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    fn elt(&self, i: usize) -> Result<usize> {
        if i >= self.num {
            return Err(Error::malformed(format!(
                "element {} of {} out of range",
                i, self.num
            )));
        }
        Ok(self.elts + i * ELT_SIZE)
    }

    /// Object name of the `i`th element.
    pub fn object(&self, i: usize) -> Result<&'a str> {
        let e = self.elt(i)?;
        let at = resolve(e, read_word(self.bytes, e)?, self.bytes.len())?;
        check_aligned(at, "object name")?;
        read_str(self.bytes, at)
    }

    /// Values of the `i`th element.
    pub fn values(&self, i: usize) -> Result<ValueIter<'a>> {
        let e = self.elt(i)?;
        let raw = read_word(self.bytes, e + WORD)?;
        let next = if raw == 0 {
            None
        } else {
            Some(encoded_target(self.bytes, e, raw, "value list")?)
        };
        Ok(ValueIter {
            bytes: self.bytes,
            next,
        })
    }

    /// Values of the first element named `object`.
    pub fn get(&self, object: &str) -> Result<Option<Vec<Value>>> {
        for i in 0..self.num {
            if self.object(i)? == object {
                return self.values(i)?.collect::<Result<Vec<_>>>().map(Some);
            }
        }
        Ok(None)
    }

    fn validate(&self) -> Result<()> {
        for i in 0..self.num {
            self.object(i)?;
            for value in self.values(i)? {
                value?;
            }
        }
        Ok(())
    }

    /// Owned copy of the pattern.
    pub fn to_pattern(&self) -> Result<Pattern> {
        let mut elts = Vec::with_capacity(self.num);
        for i in 0..self.num {
            elts.push(PatternElt {
                object: self.object(i)?.to_owned(),
                values: self.values(i)?.collect::<Result<Vec<_>>>()?,
            });
        }
        Ok(Pattern { elts })
    }
}

/// Iterator over a serialized value list.
///
/// Each node must lie strictly after its predecessor, so a corrupted list
/// cannot loop.
#[derive(Debug, Clone)]
pub struct ValueIter<'a> {
    bytes: &'a [u8],
    next: Option<usize>,
}

impl<'a> ValueIter<'a> {
    fn read_node(&mut self, node: usize) -> Result<Value> {
        let bytes = self.bytes;
        let raw_next = read_word(bytes, node)?;
        let kind = read_u32(bytes, node + WORD)?;
        let payload = read_i64(bytes, node + WORD + 8)?;

        let value = match kind {
            KIND_INTEGER => Value::Integer(i32::try_from(payload).map_err(|_| {
                Error::malformed(format!("integer value {} at {} overflows", payload, node))
            })?),
            KIND_DOUBLE => Value::Double(f64::from_bits(payload as u64)),
            KIND_BOOL => match payload {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(Error::malformed(format!(
                        "bool value {} at {}",
                        other, node
                    )))
                }
            },
            KIND_STRING => {
                let rel = isize::try_from(payload)
                    .map_err(|_| Error::malformed(format!("string offset {} at {}", payload, node)))?;
                let at = resolve(node, rel, bytes.len())?;
                check_aligned(at, "string value")?;
                Value::String(read_str(bytes, at)?.to_owned())
            }
            other => {
                return Err(Error::malformed(format!(
                    "unknown value kind {} at {}",
                    other, node
                )))
            }
        };

        self.next = if raw_next == 0 {
            None
        } else {
            let next = encoded_target(bytes, node, raw_next, "value node")?;
            if next <= node {
                return Err(Error::malformed(format!(
                    "value node at {} links backwards to {}",
                    node, next
                )));
            }
            Some(next)
        };
        Ok(value)
    }
}

impl<'a> Iterator for ValueIter<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next.take()?;
        Some(self.read_node(node))
    }
}
