// this_file: src/cache.rs

//! Loaded directory caches.
//!
//! A [`Cache`] is a counted handle on a validated cache buffer that is either a
//! read-only file mapping or a heap copy. Each handle holds one registry
//! reference: cloning adds one, dropping releases one, and the buffer goes away
//! once the registry count reaches zero and the last handle is gone.

use crate::cache_file::{CacheView, Header, MAGIC_ALLOC};
use crate::error::Result;
use crate::pattern::{FontSet, PatternRef};
use crate::registry::Registry;
use crate::stat::FileIdentity;
use memmap2::Mmap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Owner of a cache's bytes.
pub(crate) enum Backing {
    Mapped(Mmap),
    Heap(Box<[u8]>),
}

/// Validated cache bytes together with their decoded header.
pub struct CacheBlob {
    backing: Backing,
    header: Header,
}

impl CacheBlob {
    /// Wrap a validated file mapping.
    pub(crate) fn mapped(map: Mmap, header: Header) -> Self {
        Self {
            backing: Backing::Mapped(map),
            header,
        }
    }

    /// Wrap a validated heap buffer, retagging it as heap-owned.
    pub(crate) fn heap(mut bytes: Box<[u8]>, mut header: Header) -> Self {
        if let Some(magic) = bytes.get_mut(..4) {
            magic.copy_from_slice(&MAGIC_ALLOC.to_ne_bytes());
        }
        header.magic = MAGIC_ALLOC;
        Self {
            backing: Backing::Heap(bytes),
            header,
        }
    }

    /// Zero-filled heap blob with a blank header, for registry tests.
    #[cfg(test)]
    pub(crate) fn scratch(len: usize) -> Self {
        let header = Header {
            magic: MAGIC_ALLOC,
            version: 0,
            size: len,
            checksum: 0,
            checksum_nano: 0,
            dir: 0,
            dirs: 0,
            dirs_count: 0,
            set: 0,
        };
        Self {
            backing: Backing::Heap(vec![0u8; len].into_boxed_slice()),
            header,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => map,
            Backing::Heap(bytes) => bytes,
        }
    }

    /// Address of the first byte.
    pub fn base(&self) -> usize {
        self.bytes().as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    pub fn header(&self) -> &Header {
        &self.header
    }
}

impl fmt::Debug for CacheBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBlob")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Counted handle to a loaded or freshly built directory cache.
pub struct Cache {
    blob: Arc<CacheBlob>,
    registry: Registry,
}

impl Cache {
    /// Register `blob` and return a handle owning one reference.
    ///
    /// A blob loaded from a file that is already registered is discarded in
    /// favour of the live entry.
    pub(crate) fn admit(
        blob: CacheBlob,
        registry: &Registry,
        identity: Option<FileIdentity>,
    ) -> Result<Self> {
        let blob = registry.admit(Arc::new(blob), identity)?;
        Ok(Self {
            blob,
            registry: registry.clone(),
        })
    }

    /// Wrap a blob whose reference the registry has already counted.
    pub(crate) fn from_registered(blob: Arc<CacheBlob>, registry: &Registry) -> Self {
        Self {
            blob,
            registry: registry.clone(),
        }
    }

    fn view(&self) -> CacheView<'_> {
        CacheView::from_parts(self.blob.bytes(), *self.blob.header())
    }

    /// Address of the first byte; every address up to `base + size` belongs to
    /// this cache.
    pub fn base(&self) -> usize {
        self.blob.base()
    }

    pub fn size(&self) -> usize {
        self.blob.len()
    }

    /// Whether the bytes are a file mapping rather than a heap buffer.
    pub fn is_mapped(&self) -> bool {
        self.blob.is_mapped()
    }

    /// In-memory magic: `MAGIC_MMAP` for mappings, `MAGIC_ALLOC` for heap buffers.
    pub fn magic(&self) -> u32 {
        self.blob.header().magic
    }

    pub fn version(&self) -> u32 {
        self.blob.header().version
    }

    pub fn checksum(&self) -> i32 {
        self.blob.header().checksum
    }

    pub fn checksum_nano(&self) -> i32 {
        self.blob.header().checksum_nano
    }

    pub fn header(&self) -> &Header {
        self.blob.header()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.blob.bytes()
    }

    /// The directory this cache describes.
    pub fn dir(&self) -> &str {
        self.view().dir().unwrap_or_default()
    }

    pub fn num_subdirs(&self) -> usize {
        self.view().num_subdirs()
    }

    pub fn subdir(&self, i: usize) -> Option<&str> {
        self.view().subdir(i).ok()
    }

    pub fn subdirs(&self) -> Vec<&str> {
        self.view().subdirs().unwrap_or_default()
    }

    pub fn num_fonts(&self) -> usize {
        self.view().font_set().map(|set| set.len()).unwrap_or(0)
    }

    /// Owned copy of the cached font set.
    pub fn font_set(&self) -> Result<FontSet> {
        self.view().font_set()?.to_font_set()
    }

    /// Zero-copy views of the cached patterns.
    ///
    /// [`PatternRef::addr`] is an interior pointer of this cache and can be
    /// handed to the reference-counting entry points.
    pub fn fonts(&self) -> Vec<PatternRef<'_>> {
        match self.view().font_set() {
            Ok(set) => set.iter().filter_map(|p| p.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Attach `len` zeroed bytes to this cache; freed when the cache is disposed.
    pub fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        self.registry.allocate_in(self.base(), len)
    }

    /// Current registry reference count, or `None` once disposed.
    pub fn ref_count(&self) -> Option<usize> {
        self.registry.find_by_addr(self.base()).map(|e| e.refcount)
    }

    /// The registry this cache is counted in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Clone for Cache {
    fn clone(&self) -> Self {
        self.registry.reference(self.base(), 1);
        Self {
            blob: Arc::clone(&self.blob),
            registry: self.registry.clone(),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.registry.dereference(self.base());
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("dir", &self.dir())
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
