//! pmcache core: a crash-consistent item cache on persistent memory
//!
//! Items, the hash index over them and all allocator metadata live in a
//! memory-mapped pool file. Every structural change (allocation, link,
//! unlink, free) is an undo-logged transaction, so a crash at any point
//! leaves the index and every item either fully before or fully after the
//! change.
//!
//! # Layers
//!
//! - [`pool`]: mapped pool file, heap allocator, undo-log transactions
//! - [`item`]: item record layout, reference counts, CAS tokens
//! - [`index`]: persistent chained hash table and the recovery sweep
//! - [`engine`]: store semantics (set/add/replace/append/prepend/cas),
//!   get, delete, flush and statistics behind the cache lock

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod item;
pub mod platform_durability;
pub mod pool;
pub mod stats;

// Re-export key types for convenience
pub use clock::{Clock, ManualClock, PoolClock};
pub use config::{Config, DEFAULT_LAYOUT, ITEM_SIZE_MAX};
pub use engine::{ItemHandle, ItemInfo, PmemEngine, RecoveryReport, StoreOperation};
pub use error::{EngineError, EngineResult, PoolError, PoolResult};
pub use index::SweepReport;
pub use pool::{Pool, Transaction};
pub use stats::EngineStats;
