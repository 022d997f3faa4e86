// this_file: src/digest.rs
//! 128-bit message digest used to derive cache basenames.
//!
//! The digest is standard MD5, so basenames computed here match the ones
//! produced by every other implementation of the naming scheme.

use md5::{Digest as _, Md5};

/// Streaming digest state.
#[derive(Clone, Default)]
pub struct Digest {
    state: Md5,
}

impl Digest {
    /// Start a new digest.
    pub fn new() -> Self {
        Self { state: Md5::new() }
    }

    /// Feed more bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    /// Finish and return the 16-byte digest.
    pub fn finalize(self) -> [u8; 16] {
        self.state.finalize().into()
    }

    /// Finish and return the digest as 32 lowercase hex digits.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

/// One-shot digest of `bytes` rendered as lowercase hex.
pub fn hex_digest(bytes: &[u8]) -> String {
    let mut digest = Digest::new();
    digest.update(bytes);
    digest.finalize_hex()
}
