// this_file: src/mmap_policy.rs
//! Decides whether a cache file may be memory-mapped.
//!
//! The decision is a process-wide tri-state read once from `FONTCONFIG_USE_MMAP`:
//! forced on, forced off, or checked per descriptor against the filesystem type.

use log::{debug, warn};
use std::fs::File;
use std::sync::atomic::{AtomicU8, Ordering};

/// Process-wide mmap policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapPolicy {
    /// Always map large cache files
    Use,
    /// Never map; always read into the heap
    DontUse,
    /// Map only when the file's filesystem is known to be mmap-safe
    CheckFsPerFd,
}

const NOT_INITIALIZED: u8 = 0;
const USE: u8 = 1;
const DONT_USE: u8 = 2;
const CHECK_FS: u8 = 3;

static POLICY: AtomicU8 = AtomicU8::new(NOT_INITIALIZED);

impl MmapPolicy {
    fn to_raw(self) -> u8 {
        match self {
            MmapPolicy::Use => USE,
            MmapPolicy::DontUse => DONT_USE,
            MmapPolicy::CheckFsPerFd => CHECK_FS,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            USE => Some(MmapPolicy::Use),
            DONT_USE => Some(MmapPolicy::DontUse),
            CHECK_FS => Some(MmapPolicy::CheckFsPerFd),
            _ => None,
        }
    }

    /// Policy selected by an optional `FONTCONFIG_USE_MMAP` value.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            None => MmapPolicy::CheckFsPerFd,
            Some(raw) => match parse_bool(raw) {
                Some(true) => MmapPolicy::Use,
                Some(false) => MmapPolicy::DontUse,
                None => {
                    warn!(
                        "FONTCONFIG_USE_MMAP={:?} is not a boolean, checking filesystems instead",
                        raw
                    );
                    MmapPolicy::CheckFsPerFd
                }
            },
        }
    }
}

/// The process-wide policy, initialized on first use.
///
/// Concurrent first calls may both read the environment; the first
/// compare-exchange wins and every caller observes the same value afterwards.
pub fn policy() -> MmapPolicy {
    if let Some(policy) = MmapPolicy::from_raw(POLICY.load(Ordering::Acquire)) {
        return policy;
    }
    let env = std::env::var("FONTCONFIG_USE_MMAP").ok();
    let chosen = MmapPolicy::from_env_value(env.as_deref());
    match POLICY.compare_exchange(
        NOT_INITIALIZED,
        chosen.to_raw(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            debug!("mmap policy: {:?}", chosen);
            chosen
        }
        Err(existing) => MmapPolicy::from_raw(existing).unwrap_or(chosen),
    }
}

/// Whether `file` may be mapped under the process-wide policy.
pub fn is_mmap_safe(file: &File) -> bool {
    match policy() {
        MmapPolicy::Use => true,
        MmapPolicy::DontUse => false,
        MmapPolicy::CheckFsPerFd => is_fs_mmap_safe(file),
    }
}

/// Boolean spelling accepted for `FONTCONFIG_USE_MMAP`.
///
/// Decided by the first character (`t`/`y`/`1` or `f`/`n`/`0`), with
/// `on`/`off` told apart by the second.
pub fn parse_bool(value: &str) -> Option<bool> {
    let mut chars = value.chars().map(|c| c.to_ascii_lowercase());
    match chars.next()? {
        't' | 'y' | '1' => Some(true),
        'f' | 'n' | '0' => Some(false),
        'o' => match chars.next()? {
            'n' => Some(true),
            'f' => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn is_fs_mmap_safe(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;

    // Remote filesystems where a shared mapping can observe torn or vanished pages.
    const UNSAFE_FS: &[u64] = &[
        0x6969,              // NFS
        0x517B,              // SMB
        0xFF53_4D42,         // CIFS
        0xFE53_4D42,         // SMB2
        0x5346_414F,         // AFS
        0x7375_7245,         // CODA
        0x0102_1997,         // 9P
    ];

    let mut buf = std::mem::MaybeUninit::<libc::statfs>::uninit();
    // SAFETY: fstatfs only writes into `buf`; the descriptor is borrowed for the call.
    let rc = unsafe { libc::fstatfs(file.as_raw_fd(), buf.as_mut_ptr()) };
    if rc != 0 {
        return false;
    }
    // SAFETY: fstatfs succeeded and fully initialized the struct.
    let stats = unsafe { buf.assume_init() };
    let fs_type = (stats.f_type as u64) & 0xFFFF_FFFF;
    let safe = !UNSAFE_FS.contains(&fs_type);
    if !safe {
        debug!("filesystem type {:#x} is not mmap-safe", fs_type);
    }
    safe
}

#[cfg(not(target_os = "linux"))]
fn is_fs_mmap_safe(_file: &File) -> bool {
    true
}
