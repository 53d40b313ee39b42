//! Configuration management for pmcache
//!
//! Provides pool size presets for different deployment classes
//! and validation of custom configurations.

use std::path::PathBuf;

/// Largest value an item may carry (1 MiB, exclusive).
pub const ITEM_SIZE_MAX: usize = 1024 * 1024;

/// Default layout name written into the pool superblock.
pub const DEFAULT_LAYOUT: &str = "HASHTABLE_POOL";

/// pmcache engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path of the persistent pool file
    pub pool_path: PathBuf,
    /// Size of a newly created pool file (bytes); ignored when reopening
    pub pool_size: u64,
    /// Undo log capacity carved out of a new pool (bytes)
    pub log_size: u64,
    /// Layout name the pool must carry
    pub layout: String,
    /// Bucket count is `1 << hash_power`, fixed when the index is created
    pub hash_power: u8,
    /// Reserve an 8-byte CAS token in every item
    pub use_cas: bool,
    /// Soft byte ceiling, reported in stats but not enforced
    pub maxbytes: u64,
    /// Log volume: >1 logs CAS conflicts, >2 logs every lookup
    pub verbose: usize,
    /// Bytes of line framing trimmed from the old value on append/prepend
    pub framing_suffix_len: usize,
}

impl Config {
    /// Server-class: 512MB pool and a 2^20 bucket index
    pub fn server() -> Self {
        Self {
            pool_path: PathBuf::from("pmcache.pool"),
            pool_size: 512 * 1024 * 1024,
            log_size: 1024 * 1024,
            layout: DEFAULT_LAYOUT.to_string(),
            hash_power: 20,
            use_cas: true,
            maxbytes: 64 * 1024 * 1024,
            verbose: 0,
            framing_suffix_len: 0,
        }
    }

    /// Small footprint: 32MB pool and a 2^12 bucket index
    pub fn small() -> Self {
        Self {
            pool_size: 32 * 1024 * 1024,
            log_size: 256 * 1024,
            hash_power: 12,
            maxbytes: 16 * 1024 * 1024,
            ..Self::server()
        }
    }

    /// Same settings with a different pool file
    pub fn with_pool_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.pool_path = path.into();
        self
    }

    /// Number of hash buckets this configuration creates
    pub fn hash_size(&self) -> u32 {
        1u32 << self.hash_power
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_path.as_os_str().is_empty() {
            return Err("pool_path must not be empty".into());
        }
        if self.hash_power == 0 || self.hash_power > 28 {
            return Err("hash_power must be in [1, 28]".into());
        }
        if self.log_size < 64 * 1024 {
            return Err("log_size must be >= 64KB".into());
        }
        let table_bytes = 8u64 << self.hash_power;
        if self.pool_size < self.log_size + table_bytes + 1024 * 1024 {
            return Err(format!(
                "pool_size must be >= log_size + bucket array ({} bytes) + 1MB",
                table_bytes
            ));
        }
        if self.layout.is_empty() || self.layout.len() > 31 {
            return Err("layout must be 1..=31 bytes".into());
        }
        if self.framing_suffix_len > 2 {
            return Err("framing_suffix_len must be 0, 1 or 2".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::server()
    }
}
