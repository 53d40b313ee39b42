//! pmcache host adapter
//!
//! Presents [`pmcache_core::PmemEngine`] through the engine API a cache
//! server drives: initialize from a configuration string, allocate / get /
//! store / release / remove items, flush, and report statistics through a
//! callback. Results come back as [`EngineStatus`] codes.
//!
//! # Example
//!
//! ```no_run
//! use pmcache_host::{CacheEngine, PmemHost, StoreOperation};
//!
//! let host = PmemHost::initialize("pool_path=/mnt/pmem/cache.pool;cache_size=64m").unwrap();
//! let item = host.allocate(b"greeting", 5, 0, 0, 0).unwrap();
//! host.write_value(&item, 0, b"hello").unwrap();
//! let cas = host.store(&item, StoreOperation::Set).unwrap();
//! host.release(item);
//! assert!(cas > 0);
//! ```

pub mod config_str;
pub mod engine;
pub mod logging;
pub mod status;

pub use config_str::{ConfigError, EngineSettings};
pub use engine::{
    CacheEngine, EngineFeature, EngineInfo, EngineOutcome, HostItem, InitError, PmemHost,
};
pub use pmcache_core::{ItemInfo, StoreOperation};
pub use status::EngineStatus;
