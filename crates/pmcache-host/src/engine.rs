//! Engine API surface presented to the host.

use std::fmt;

use pmcache_core::{EngineError, ItemHandle, ItemInfo, PmemEngine, StoreOperation};
use thiserror::Error;
use tracing::{info, warn};

use crate::config_str::{ConfigError, EngineSettings};
use crate::logging;
use crate::status::EngineStatus;

/// Optional capabilities advertised to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFeature {
    Lru,
    Cas,
}

/// Engine description returned by `get_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub description: &'static str,
    pub features: Vec<EngineFeature>,
}

/// Failure to bring an engine up
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine failed to open: {0}")]
    Engine(#[from] EngineError),
}

impl InitError {
    pub fn status(&self) -> EngineStatus {
        match self {
            InitError::Config(_) => EngineStatus::Failed,
            InitError::Engine(e) => e.into(),
        }
    }
}

/// An item held by the host: the engine reference plus the CAS token the
/// client supplied at allocation.
#[must_use = "items must be released"]
pub struct HostItem {
    handle: ItemHandle,
    cas: u64,
}

impl HostItem {
    /// CAS token the item was allocated with
    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }
}

impl fmt::Debug for HostItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostItem")
            .field("offset", &self.handle.offset())
            .field("cas", &self.cas)
            .finish()
    }
}

pub type EngineOutcome<T> = Result<T, EngineStatus>;

/// The operations a host drives an engine through.
pub trait CacheEngine: Send + Sync {
    fn get_info(&self) -> &EngineInfo;

    /// Allocate an item; `exptime` is client-relative or a UNIX timestamp.
    fn allocate(
        &self,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime: u64,
        cas: u64,
    ) -> EngineOutcome<HostItem>;

    /// Fill the value of an allocated, unstored item.
    fn write_value(&self, item: &HostItem, offset: usize, data: &[u8]) -> EngineOutcome<()>;

    fn get(&self, key: &[u8]) -> EngineOutcome<HostItem>;

    /// Store `item`; returns the new CAS token.
    fn store(&self, item: &HostItem, operation: StoreOperation) -> EngineOutcome<u64>;

    fn release(&self, item: HostItem);

    fn remove(&self, key: &[u8], cas: u64) -> EngineOutcome<()>;

    #[allow(clippy::too_many_arguments)]
    fn arithmetic(
        &self,
        key: &[u8],
        increment: bool,
        create: bool,
        delta: u64,
        initial: u64,
        flags: u32,
        exptime: u64,
    ) -> EngineOutcome<u64>;

    /// Invalidate items; `prefix` scoping is not supported.
    fn flush(&self, prefix: Option<&[u8]>, when: u64) -> EngineOutcome<()>;

    /// Report statistics through `add_stat(name, value)`. Only the default
    /// group (`stat_key == None`) exists.
    fn get_stats(
        &self,
        stat_key: Option<&str>,
        add_stat: &mut dyn FnMut(&str, &str),
    ) -> EngineOutcome<()>;

    fn reset_stats(&self);

    fn get_prefix_stats(&self, prefix: &[u8]) -> EngineOutcome<Vec<(String, String)>>;

    fn get_item_info(&self, item: &HostItem) -> EngineOutcome<ItemInfo>;
}

/// Host-facing wrapper around a [`PmemEngine`].
pub struct PmemHost {
    engine: PmemEngine,
    settings: EngineSettings,
    info: EngineInfo,
}

impl PmemHost {
    /// Parse `config_str`, set up logging and open the engine.
    pub fn initialize(config_str: &str) -> Result<Self, InitError> {
        let settings = EngineSettings::parse(config_str)?;
        logging::init(settings.core.verbose);
        Self::with_settings(settings)
    }

    /// Open an engine from already-parsed settings.
    pub fn with_settings(settings: EngineSettings) -> Result<Self, InitError> {
        let engine = PmemEngine::open(settings.core.clone())?;

        let mut features = vec![EngineFeature::Lru];
        if settings.core.use_cas {
            features.push(EngineFeature::Cas);
        }
        info!(
            pool = %settings.core.pool_path.display(),
            use_cas = settings.core.use_cas,
            "pmem engine initialized"
        );

        Ok(Self {
            engine,
            settings,
            info: EngineInfo { description: "Pmem engine v0.1", features },
        })
    }

    pub fn engine(&self) -> &PmemEngine {
        &self.engine
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl fmt::Debug for PmemHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmemHost")
            .field("pool", &self.settings.core.pool_path)
            .field("info", &self.info)
            .finish()
    }
}

impl CacheEngine for PmemHost {
    fn get_info(&self) -> &EngineInfo {
        &self.info
    }

    fn allocate(
        &self,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime: u64,
        cas: u64,
    ) -> EngineOutcome<HostItem> {
        let exptime = self.engine.realtime(exptime);
        let handle = self.engine.allocate(key, flags, exptime, nbytes)?;
        Ok(HostItem { handle, cas })
    }

    fn write_value(&self, item: &HostItem, offset: usize, data: &[u8]) -> EngineOutcome<()> {
        Ok(self.engine.set_value(&item.handle, offset, data)?)
    }

    fn get(&self, key: &[u8]) -> EngineOutcome<HostItem> {
        let handle = self.engine.get(key)?;
        Ok(HostItem { handle, cas: 0 })
    }

    fn store(&self, item: &HostItem, operation: StoreOperation) -> EngineOutcome<u64> {
        Ok(self.engine.store(&item.handle, operation, item.cas)?)
    }

    fn release(&self, item: HostItem) {
        if let Err(e) = self.engine.release(item.handle) {
            warn!(error = %e, "item release failed");
        }
    }

    fn remove(&self, key: &[u8], cas: u64) -> EngineOutcome<()> {
        Ok(self.engine.delete(key, cas)?)
    }

    fn arithmetic(
        &self,
        key: &[u8],
        increment: bool,
        _create: bool,
        delta: u64,
        initial: u64,
        _flags: u32,
        exptime: u64,
    ) -> EngineOutcome<u64> {
        let exptime = self.engine.realtime(exptime);
        Ok(self.engine.arithmetic(key, increment, delta, initial, exptime)?)
    }

    fn flush(&self, prefix: Option<&[u8]>, when: u64) -> EngineOutcome<()> {
        if prefix.is_some() {
            return Err(EngineStatus::NotSupported);
        }
        Ok(self.engine.flush(self.engine.realtime(when))?)
    }

    fn get_stats(
        &self,
        stat_key: Option<&str>,
        add_stat: &mut dyn FnMut(&str, &str),
    ) -> EngineOutcome<()> {
        if stat_key.is_some() {
            return Err(EngineStatus::KeyNotFound);
        }
        let stats = self.engine.stats();
        let entries: [(&str, u64); 9] = [
            ("evictions", stats.evictions),
            ("sticky_items", 0),
            ("curr_items", stats.curr_items),
            ("total_items", stats.total_items),
            ("sticky_bytes", 0),
            ("bytes", stats.curr_bytes),
            ("reclaimed", stats.reclaimed),
            ("sticky_limit", self.settings.sticky_limit),
            ("engine_maxbytes", self.settings.core.maxbytes),
        ];
        for (name, value) in entries {
            add_stat(name, &value.to_string());
        }
        Ok(())
    }

    fn reset_stats(&self) {
        self.engine.reset_stats();
    }

    fn get_prefix_stats(&self, _prefix: &[u8]) -> EngineOutcome<Vec<(String, String)>> {
        Err(EngineStatus::NotSupported)
    }

    fn get_item_info(&self, item: &HostItem) -> EngineOutcome<ItemInfo> {
        Ok(self.engine.item_info(&item.handle)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_host(extra: &str) -> (PmemHost, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = format!(
            "pool_path={};pool_size=8m;log_size=128k;hash_power=8{}",
            dir.path().join("host.pool").display(),
            extra
        );
        let host = PmemHost::initialize(&config).unwrap();
        (host, dir)
    }

    #[test]
    fn test_info_features() {
        let (host, _dir) = test_host("");
        assert_eq!(host.get_info().features, vec![EngineFeature::Lru, EngineFeature::Cas]);
        let (host, _dir) = test_host(";use_cas=false");
        assert_eq!(host.get_info().features, vec![EngineFeature::Lru]);
        assert!(format!("{:?}", host).contains("PmemHost"));
    }

    #[test]
    fn test_bad_config_fails_init() {
        let err = PmemHost::initialize("no_such_key=1").unwrap_err();
        assert_eq!(err.status(), EngineStatus::Failed);
    }

    #[test]
    fn test_stats_unknown_group() {
        let (host, _dir) = test_host("");
        let result = host.get_stats(Some("slabs"), &mut |_, _| {});
        assert_eq!(result, Err(EngineStatus::KeyNotFound));
        assert_eq!(host.get_prefix_stats(b"a:"), Err(EngineStatus::NotSupported));
    }

    #[test]
    fn test_prefix_flush_not_supported() {
        let (host, _dir) = test_host("");
        assert_eq!(host.flush(Some(b"user:"), 0), Err(EngineStatus::NotSupported));
        assert_eq!(host.flush(None, 0), Ok(()));
    }
}
