// this_file: src/config.rs
//! Cache configuration: search path, sysroot, and per-font-directory remap/salt rules.
//!
//! The configuration is a plain value handed to every cache operation. It can be
//! built in code or parsed from a small JSON document:
//!
//! ```json
//! {
//!   "cache_dirs": ["/var/cache/fontconfig", "/home/me/.cache/fontconfig"],
//!   "sysroot": null,
//!   "font_dirs": [
//!     { "path": "/run/host/fonts", "remap": "/usr/share/fonts" },
//!     { "path": "/opt/fonts", "salt": "opt-1" }
//!   ]
//! }
//! ```

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use serde::Deserialize;
use std::fs;

/// A configured font directory with optional remap target and salt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FontDirRule {
    /// Directory the rule applies to (and everything beneath it)
    pub path: Utf8PathBuf,
    /// Path to hash instead of `path` (the `as-path` of a remapped directory)
    #[serde(default)]
    pub remap: Option<Utf8PathBuf>,
    /// Extra bytes appended to the hashing input
    #[serde(default)]
    pub salt: Option<String>,
}

impl FontDirRule {
    /// Plain rule without remap or salt.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            remap: None,
            salt: None,
        }
    }

    /// Hash directories under this rule as if they lived under `target`.
    pub fn with_remap(mut self, target: impl Into<Utf8PathBuf>) -> Self {
        self.remap = Some(target.into());
        self
    }

    /// Salt the hashing input of directories under this rule.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }
}

/// Configuration consumed by loading, writing, locking and cleaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// Ordered search path of cache directories
    #[serde(default)]
    pub cache_dirs: Vec<Utf8PathBuf>,
    /// Prefix prepended to every path used for filesystem access
    #[serde(default)]
    pub sysroot: Option<Utf8PathBuf>,
    /// Font directory rules, first match wins
    #[serde(default)]
    pub font_dirs: Vec<FontDirRule>,
}

impl CacheConfig {
    /// Empty configuration; add cache directories before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cache directory to the search path.
    pub fn with_cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dirs.push(dir.into());
        self
    }

    /// Set the sysroot prefix.
    pub fn with_sysroot(mut self, sysroot: impl Into<Utf8PathBuf>) -> Self {
        self.sysroot = Some(sysroot.into());
        self
    }

    /// Append a font directory rule.
    pub fn with_font_dir(mut self, rule: FontDirRule) -> Self {
        self.font_dirs.push(rule);
        self
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        debug!("Loaded cache configuration from {}", path);
        Self::from_json(&json)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.cache_dirs.is_empty() {
            return Err(Error::Config("no cache directories configured".into()));
        }
        for dir in &self.cache_dirs {
            if !dir.is_absolute() {
                return Err(Error::Config(format!(
                    "cache directory must be absolute: {}",
                    dir
                )));
            }
        }
        for rule in &self.font_dirs {
            if let Some(target) = &rule.remap {
                if !target.is_absolute() {
                    return Err(Error::Config(format!(
                        "remap target for {} must be absolute: {}",
                        rule.path, target
                    )));
                }
            }
        }
        Ok(())
    }

    fn rule_for(&self, dir: &Utf8Path) -> Option<&FontDirRule> {
        self.font_dirs
            .iter()
            .find(|rule| path_starts_with(dir.as_str(), rule.path.as_str()))
    }

    /// Path that `dir` maps to for hashing, if a remap rule covers it.
    pub fn map_font_path(&self, dir: &Utf8Path) -> Option<Utf8PathBuf> {
        let rule = self.rule_for(dir)?;
        let target = rule.remap.as_ref()?;
        let rest = dir.as_str()[rule.path.as_str().len()..].trim_start_matches('/');
        let mut mapped = if rest.is_empty() {
            target.as_str().to_string()
        } else {
            format!("{}/{}", target.as_str().trim_end_matches('/'), rest)
        };
        while mapped.len() > 1 && mapped.ends_with('/') {
            mapped.pop();
        }
        Some(Utf8PathBuf::from(mapped))
    }

    /// Salt configured for `dir`, if any.
    pub fn map_salt(&self, dir: &Utf8Path) -> Option<&str> {
        self.rule_for(dir)?.salt.as_deref()
    }

    /// `sysroot || path`, the path used for actual filesystem access.
    pub fn addressed(&self, path: &Utf8Path) -> Utf8PathBuf {
        match &self.sysroot {
            Some(root) => {
                let rel = path.as_str().trim_start_matches('/');
                if rel.is_empty() {
                    root.clone()
                } else {
                    root.join(rel)
                }
            }
            None => path.to_path_buf(),
        }
    }
}

/// `start` is a path prefix of `path`: equal, or followed by a separator.
fn path_starts_with(path: &str, start: &str) -> bool {
    match path.strip_prefix(start) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || start.ends_with('/'),
        None => false,
    }
}
