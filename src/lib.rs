// this_file: src/lib.rs
//! fcdircache - persistent per-directory font caches
//!
//! This library provides:
//! - A position-independent, architecture-tagged cache file format
//! - Loading by memory mapping (or a heap read for small files) with validation
//! - A reference-counted registry indexing live caches by address range
//! - Atomic writes, cross-process locking and cleaning of stale cache files

pub mod atomic;
pub mod basename;
pub mod cache;
pub mod cache_file;
pub mod clean;
pub mod config;
pub mod digest;
pub mod dircache;
pub mod error;
pub mod loader;
pub mod lock;
pub mod logging;
pub mod mmap_policy;
pub mod pattern;
pub mod registry;
pub mod serialize;
pub mod stat;
pub mod writer;

// Re-export commonly used types
pub use basename::{basename, legacy_basename, CacheBasename};
pub use cache::Cache;
pub use clean::CleanReport;
pub use config::{CacheConfig, FontDirRule};
pub use dircache::{DirScanner, FontDirCache, ScanResult};
pub use error::{Error, Result};
pub use lock::DirLock;
pub use pattern::{FontSet, Pattern, PatternRef, Value};
pub use registry::{EntryInfo, Registry, RegistryStats};
pub use stat::{DirChecksum, FileStat};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
