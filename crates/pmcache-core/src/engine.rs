//! Store-operation engine: the item cache on top of the pool and index.
//!
//! `PmemEngine` owns the pool, the index handle, the CAS counter, the clock
//! and the statistics. Every operation that touches the pool runs under one
//! cache lock; statistics have their own lock and are only ever taken inside
//! the cache lock, never the other way round.
//!
//! Item lifecycle:
//! 1. `allocate` creates an unlinked item holding one reference
//! 2. `set_value` fills the value in place (persisted, no transaction needed
//!    while nothing else can reach the item)
//! 3. `store` links it into the index, assigning its CAS token
//! 4. `release` drops the caller's reference; an unlinked item is freed
//!    when its last reference goes
//!
//! A failed transaction while linking or unlinking poisons the engine: the
//! pool is consistent (the transaction rolled back) but in-memory state may
//! not be, so every later operation returns [`EngineError::Fatal`] until the
//! pool is reopened.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{self, Clock, PoolClock};
use crate::config::{Config, ITEM_SIZE_MAX};
use crate::error::{EngineError, EngineResult, PoolError};
use crate::index::{self, HashIndex, SweepReport, HASH_SEED};
use crate::item::{
    self, ItemHeader, ITEM_LINKED, ITEM_TYPE_NUM, OFF_HVAL, OFF_IFLAG, OFF_STORED, OFF_TIME,
};
use crate::pool::{Pool, Transaction};
use crate::stats::EngineStats;

/// Store semantics requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Store only if the key is absent
    Add,
    /// Store unconditionally
    Set,
    /// Store only if the key is present
    Replace,
    /// Add the new value after the existing one
    Append,
    /// Add the new value before the existing one
    Prepend,
    /// Store only if the existing CAS token matches
    Cas,
}

/// A counted reference to an item.
///
/// Must be given back with [`PmemEngine::release`]; dropping it leaks the
/// reference until the next restart.
#[must_use = "item handles must be released"]
#[derive(Debug, PartialEq, Eq)]
pub struct ItemHandle {
    off: u64,
}

impl ItemHandle {
    /// Pool offset of the item, stable across restarts
    pub fn offset(&self) -> u64 {
        self.off
    }
}

/// Copy of an item's client-visible fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub cas: u64,
    pub clsid: u8,
    pub flags: u32,
    pub exptime: u32,
    pub time: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// What `open` found and repaired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pool file was created by this open
    pub created: bool,
    pub sweep: SweepReport,
    /// Unlinked item allocations freed
    pub orphans: u64,
    /// Highest CAS token found in the index
    pub max_cas: u64,
    /// Persisted CAS high-water mark; covers tokens of removed items
    pub cas_high: u64,
}

struct CacheState {
    pool: Pool,
    index: HashIndex,
    /// Flush watermark; 0 = unset
    oldest_live: u32,
}

/// Persistent item cache engine.
pub struct PmemEngine {
    /// Cache lock: pool, index and the flush watermark
    state: Mutex<CacheState>,
    /// Stats lock
    stats: Mutex<EngineStats>,
    /// Last CAS token handed out
    cas_id: AtomicU64,
    clock: Arc<dyn Clock>,
    poisoned: AtomicBool,
    recovery: RecoveryReport,
    config: Config,
}

impl PmemEngine {
    /// Open (or create) the pool named by `config` and recover it.
    pub fn open(config: Config) -> EngineResult<Self> {
        Self::open_inner(config, None)
    }

    /// Like [`open`](Self::open) with an explicit clock.
    pub fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        Self::open_inner(config, Some(clock))
    }

    fn open_inner(config: Config, clock: Option<Arc<dyn Clock>>) -> EngineResult<Self> {
        config.validate().map_err(EngineError::invalid)?;

        let (mut pool, created) = Pool::open_or_create(
            &config.pool_path,
            &config.layout,
            config.pool_size,
            config.log_size,
        )?;
        let root = pool.root(index::ROOT_SIZE)?;
        let index = HashIndex::init(&mut pool, root, config.hash_power, clock::unix_now())?;
        let epoch = index.epoch(&pool)?;
        let clock: Arc<dyn Clock> = match clock {
            Some(clock) => clock,
            None => Arc::new(PoolClock::new(epoch)),
        };

        let (mut recovery, stats) = recover(&mut pool, &index)?;
        recovery.created = created;
        let oldest_live = index.oldest_live(&pool)?;

        info!(
            path = %config.pool_path.display(),
            created,
            buckets = index.size(),
            items = stats.curr_items,
            purged = recovery.sweep.purged,
            orphans = recovery.orphans,
            max_cas = recovery.max_cas,
            cas_high = recovery.cas_high,
            oldest_live,
            "engine ready"
        );

        Ok(Self {
            state: Mutex::new(CacheState { pool, index, oldest_live }),
            stats: Mutex::new(stats),
            cas_id: AtomicU64::new(recovery.max_cas.max(recovery.cas_high)),
            clock,
            poisoned: AtomicBool::new(false),
            recovery,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What recovery did when this engine was opened
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Current cache-clock time
    pub fn current_time(&self) -> u32 {
        self.clock.current_time()
    }

    /// Convert a client expiry (relative seconds or UNIX time) to cache time.
    pub fn realtime(&self, exptime: u64) -> u32 {
        clock::realtime(self.clock.as_ref(), exptime)
    }

    /// True once a structural transaction has failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Allocate an unlinked item for `key` with room for `nbytes` of value.
    pub fn allocate(
        &self,
        key: &[u8],
        flags: u32,
        exptime: u32,
        nbytes: usize,
    ) -> EngineResult<ItemHandle> {
        self.ensure_live()?;
        check_key(key)?;
        if nbytes >= ITEM_SIZE_MAX {
            return Err(EngineError::invalid(format!(
                "value of {} bytes exceeds the {} byte item limit",
                nbytes, ITEM_SIZE_MAX
            )));
        }

        let mut state = self.state.lock();
        let off = item::alloc(
            &mut state.pool,
            key,
            flags,
            exptime,
            nbytes as u32,
            self.config.use_cas,
        )?;
        debug!(offset = off, nkey = key.len(), nbytes, "allocated item");
        Ok(ItemHandle { off })
    }

    /// Write value bytes at `offset` into an item that is not stored yet.
    pub fn set_value(&self, handle: &ItemHandle, offset: usize, bytes: &[u8]) -> EngineResult<()> {
        self.ensure_live()?;
        let mut state = self.state.lock();
        let hdr = item::header(&state.pool, handle.off)?;
        if hdr.is_linked() {
            return Err(EngineError::invalid("cannot modify the value of a stored item"));
        }
        if offset + bytes.len() > hdr.nbytes as usize {
            return Err(EngineError::invalid(format!(
                "write of {} bytes at {} exceeds value length {}",
                bytes.len(),
                offset,
                hdr.nbytes
            )));
        }
        state.pool.write_persist(handle.off + hdr.value_offset() + offset as u64, bytes)?;
        Ok(())
    }

    /// Look up `key`; the returned handle holds a reference.
    pub fn get(&self, key: &[u8]) -> EngineResult<ItemHandle> {
        self.ensure_live()?;
        let now = self.clock.current_time();
        let mut state = self.state.lock();
        let found = self.lookup(&mut state, key, now)?;
        if self.config.verbose > 2 {
            debug!(key = %String::from_utf8_lossy(key), hit = found.is_some(), "get");
        }
        found.map(|off| ItemHandle { off }).ok_or(EngineError::KeyNotFound)
    }

    /// Store `handle` according to `op`, returning the CAS token of the
    /// item now linked under the key.
    ///
    /// `cas` is the client's token: compared for [`StoreOperation::Cas`],
    /// and for append/prepend when nonzero.
    pub fn store(&self, handle: &ItemHandle, op: StoreOperation, cas: u64) -> EngineResult<u64> {
        self.ensure_live()?;
        let now = self.clock.current_time();
        let mut state = self.state.lock();

        let it = handle.off;
        let hdr = item::header(&state.pool, it)?;
        if hdr.is_linked() {
            return Err(EngineError::invalid("item is already stored"));
        }
        let key = item::key(&state.pool, it, &hdr)?.to_vec();

        let old = self.lookup(&mut state, &key, now)?;
        let result = self.store_locked(&mut state, it, &key, old, op, cas, now);
        if let Some(old) = old {
            self.release_locked(&mut state, old)?;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn store_locked(
        &self,
        state: &mut CacheState,
        it: u64,
        key: &[u8],
        old: Option<u64>,
        op: StoreOperation,
        cas: u64,
        now: u32,
    ) -> EngineResult<u64> {
        let hash = index::hash_key(key, HASH_SEED);
        let old = match (op, old) {
            (StoreOperation::Add, Some(_)) => return Err(EngineError::NotStored),
            (StoreOperation::Replace | StoreOperation::Append | StoreOperation::Prepend, None) => {
                return Err(EngineError::NotStored)
            }
            (StoreOperation::Cas, None) => return Err(EngineError::KeyNotFound),
            (_, old) => old,
        };

        let Some(old) = old else {
            return self.link(state, it, hash, now);
        };

        let old_hdr = item::header(&state.pool, old)?;
        let old_cas = item::cas(&state.pool, old, &old_hdr)?;
        match op {
            StoreOperation::Cas if old_cas != cas => {
                if self.config.verbose > 1 {
                    warn!(
                        key = %String::from_utf8_lossy(key),
                        expected = cas,
                        found = old_cas,
                        "cas mismatch"
                    );
                }
                Err(EngineError::KeyExists)
            }
            StoreOperation::Append | StoreOperation::Prepend => {
                if cas != 0 && cas != old_cas {
                    if self.config.verbose > 1 {
                        warn!(
                            key = %String::from_utf8_lossy(key),
                            expected = cas,
                            found = old_cas,
                            "cas mismatch on concatenation"
                        );
                    }
                    return Err(EngineError::KeyExists);
                }
                let combined = self.concatenate(state, old, &old_hdr, it, op)?;
                let result = self.replace(state, old, combined, hash, now);
                self.release_locked(state, combined)?;
                result
            }
            _ => self.replace(state, old, it, hash, now),
        }
    }

    /// Build the unlinked append/prepend result of `old` and `new`.
    fn concatenate(
        &self,
        state: &mut CacheState,
        old: u64,
        old_hdr: &ItemHeader,
        new: u64,
        op: StoreOperation,
    ) -> EngineResult<u64> {
        let framing = self.config.framing_suffix_len;
        let new_hdr = item::header(&state.pool, new)?;
        let old_data = item::data(&state.pool, old, old_hdr)?.to_vec();
        let new_data = item::data(&state.pool, new, &new_hdr)?.to_vec();
        let key = item::key(&state.pool, old, old_hdr)?.to_vec();

        let mut value = Vec::with_capacity(old_data.len() + new_data.len());
        if op == StoreOperation::Append {
            value.extend_from_slice(&old_data[..old_data.len().saturating_sub(framing)]);
            value.extend_from_slice(&new_data);
        } else {
            value.extend_from_slice(&new_data[..new_data.len().saturating_sub(framing)]);
            value.extend_from_slice(&old_data);
        }
        if value.len() >= ITEM_SIZE_MAX {
            return Err(EngineError::NotStored);
        }

        let combined = match item::alloc(
            &mut state.pool,
            &key,
            old_hdr.flags,
            old_hdr.exptime,
            value.len() as u32,
            self.config.use_cas,
        ) {
            Ok(off) => off,
            Err(e) => {
                debug!(error = %e, "allocation for concatenation failed");
                return Err(EngineError::NotStored);
            }
        };
        let value_off = combined + item::header(&state.pool, combined)?.value_offset();
        state.pool.write_persist(value_off, &value)?;
        Ok(combined)
    }

    /// Give back a reference obtained from `allocate` or `get`.
    pub fn release(&self, handle: ItemHandle) -> EngineResult<()> {
        self.ensure_live()?;
        let mut state = self.state.lock();
        self.release_locked(&mut state, handle.off)
    }

    /// Remove `key`. A nonzero `cas` must match the stored token.
    pub fn delete(&self, key: &[u8], cas: u64) -> EngineResult<()> {
        self.ensure_live()?;
        check_key(key)?;
        let now = self.clock.current_time();
        let mut state = self.state.lock();

        let Some(it) = self.lookup(&mut state, key, now)? else {
            return Err(EngineError::KeyNotFound);
        };
        let hdr = item::header(&state.pool, it)?;
        let current = item::cas(&state.pool, it, &hdr)?;
        let result = if cas == 0 || cas == current {
            self.unlink(&mut state, it)
        } else {
            if self.config.verbose > 1 {
                warn!(
                    key = %String::from_utf8_lossy(key),
                    expected = cas,
                    found = current,
                    "cas mismatch on delete"
                );
            }
            Err(EngineError::KeyExists)
        };
        self.release_locked(&mut state, it)?;
        result
    }

    /// incr/decr are not implemented by this engine.
    pub fn arithmetic(
        &self,
        _key: &[u8],
        _incr: bool,
        _delta: u64,
        _initial: u64,
        _exptime: u32,
    ) -> EngineResult<u64> {
        Err(EngineError::NotSupported { operation: "arithmetic" })
    }

    /// Invalidate every item last stored at or before the watermark.
    ///
    /// `when` is cache-clock time; 0 means "everything stored before now".
    /// The watermark is persisted with the index, so it outlives a restart.
    /// Invalid items are removed lazily as lookups find them.
    pub fn flush(&self, when: u32) -> EngineResult<()> {
        self.ensure_live()?;
        let now = self.clock.current_time();
        let mut state = self.state.lock();
        let oldest_live = if when == 0 { now.saturating_sub(1) } else { when };
        let index = state.index;
        let result = in_tx(&mut state.pool, |tx| index.set_oldest_live(tx, oldest_live));
        self.structural(result)?;
        state.oldest_live = oldest_live;
        info!(oldest_live, now, "flush");
        Ok(())
    }

    /// Client-visible fields of the item behind `handle`.
    pub fn item_info(&self, handle: &ItemHandle) -> EngineResult<ItemInfo> {
        self.ensure_live()?;
        let state = self.state.lock();
        let hdr = item::header(&state.pool, handle.off)?;
        Ok(ItemInfo {
            cas: item::cas(&state.pool, handle.off, &hdr)?,
            clsid: hdr.clsid,
            flags: hdr.flags,
            exptime: hdr.exptime,
            time: hdr.time,
            key: item::key(&state.pool, handle.off, &hdr)?.to_vec(),
            value: item::data(&state.pool, handle.off, &hdr)?.to_vec(),
        })
    }

    /// Allocate, fill and store in one call.
    pub fn store_value(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
        op: StoreOperation,
        cas: u64,
    ) -> EngineResult<u64> {
        let handle = self.allocate(key, flags, exptime, value.len())?;
        let result = self
            .set_value(&handle, 0, value)
            .and_then(|()| self.store(&handle, op, cas));
        self.release(handle)?;
        result
    }

    /// Look up `key` and copy it out, releasing the reference.
    pub fn fetch(&self, key: &[u8]) -> EngineResult<ItemInfo> {
        let handle = self.get(key)?;
        let info = self.item_info(&handle);
        self.release(handle)?;
        info
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> EngineStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        self.stats.lock().reset();
    }

    /// Items currently reachable from the index
    pub fn len(&self) -> EngineResult<u64> {
        self.ensure_live()?;
        let state = self.state.lock();
        state.index.items(&state.pool)
    }

    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    fn ensure_live(&self) -> EngineResult<()> {
        if self.is_poisoned() {
            return Err(EngineError::Fatal {
                reason: "engine poisoned by an aborted transaction; reopen the pool".to_string(),
            });
        }
        Ok(())
    }

    /// Map a failed structural transaction to `Fatal` and poison the engine.
    fn structural<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        match result {
            Err(EngineError::Pool(e)) => {
                error!(error = %e, "structural transaction aborted; engine poisoned");
                self.poisoned.store(true, Ordering::SeqCst);
                Err(EngineError::Fatal { reason: e.to_string() })
            }
            other => other,
        }
    }

    fn next_cas(&self) -> u64 {
        self.cas_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Find a valid item for `key` and take a reference on it. An invalid
    /// item found on the way is unlinked.
    fn lookup(&self, state: &mut CacheState, key: &[u8], now: u32) -> EngineResult<Option<u64>> {
        let hash = index::hash_key(key, HASH_SEED);
        let Some(it) = state.index.find(&state.pool, hash, key)? else {
            return Ok(None);
        };
        let hdr = item::header(&state.pool, it)?;
        if !hdr.is_valid(now, state.oldest_live) {
            debug!(offset = it, exptime = hdr.exptime, time = hdr.time, "unlinking expired item");
            self.unlink(state, it)?;
            return Ok(None);
        }
        item::incr_ref(&mut state.pool, it)?;
        Ok(Some(it))
    }

    fn link(&self, state: &mut CacheState, it: u64, hash: u32, now: u32) -> EngineResult<u64> {
        let index = state.index;
        let cas = self.next_cas();
        let result = in_tx(&mut state.pool, |tx| link_in(tx, &index, it, hash, now, cas));
        let bytes = self.structural(result)?;
        self.stats.lock().on_link(bytes);
        debug!(offset = it, cas, "linked item");
        item::cas(&state.pool, it, &item::header(&state.pool, it)?)
    }

    fn unlink(&self, state: &mut CacheState, it: u64) -> EngineResult<()> {
        let index = state.index;
        let result = in_tx(&mut state.pool, |tx| unlink_in(tx, &index, it));
        if let Some(bytes) = self.structural(result)? {
            self.stats.lock().on_unlink(bytes);
            debug!(offset = it, "unlinked item");
        }
        Ok(())
    }

    /// Swap `old` for `new` under the same key in one transaction.
    fn replace(
        &self,
        state: &mut CacheState,
        old: u64,
        new: u64,
        hash: u32,
        now: u32,
    ) -> EngineResult<u64> {
        let index = state.index;
        let cas = self.next_cas();
        let result = in_tx(&mut state.pool, |tx| {
            let removed = unlink_in(tx, &index, old)?;
            let added = link_in(tx, &index, new, hash, now, cas)?;
            Ok((removed, added))
        });
        let (removed, added) = self.structural(result)?;
        {
            let mut stats = self.stats.lock();
            if let Some(bytes) = removed {
                stats.on_unlink(bytes);
            }
            stats.on_link(added);
        }
        debug!(old, new, cas, "replaced item");
        item::cas(&state.pool, new, &item::header(&state.pool, new)?)
    }

    fn release_locked(&self, state: &mut CacheState, it: u64) -> EngineResult<()> {
        let rc = item::decr_ref(&mut state.pool, it)?;
        if !rc.is_zero() || item::header(&state.pool, it)?.is_linked() {
            return Ok(());
        }
        let result = in_tx(&mut state.pool, |tx| Ok(tx.free(it)?));
        self.structural(result)?;
        debug!(offset = it, "freed item");
        Ok(())
    }
}

/// Run `f` in a transaction and commit it; any error rolls it back.
fn in_tx<T>(
    pool: &mut Pool,
    f: impl FnOnce(&mut Transaction<'_>) -> EngineResult<T>,
) -> EngineResult<T> {
    let mut tx = pool.begin();
    let value = f(&mut tx)?;
    tx.commit()?;
    Ok(value)
}

fn check_key(key: &[u8]) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::invalid("empty key"));
    }
    if key.len() > u16::MAX as usize {
        return Err(EngineError::invalid(format!("key of {} bytes is too long", key.len())));
    }
    Ok(())
}

/// Assign CAS and time, mark stored and insert, inside `tx`.
///
/// Returns the record size for accounting.
fn link_in(
    tx: &mut Transaction<'_>,
    index: &HashIndex,
    it: u64,
    hash: u32,
    now: u32,
    cas: u64,
) -> EngineResult<u64> {
    let hdr = item::header(tx, it)?;
    item::set_cas(tx, it, &hdr, cas)?;
    index.raise_cas_high(tx, cas)?;
    tx.write_u32(it + OFF_TIME, now)?;
    tx.write_u32(it + OFF_HVAL, hash)?;
    tx.write_u16(it + OFF_IFLAG, hdr.iflag | ITEM_LINKED)?;
    tx.write_u8(it + OFF_STORED, 1)?;
    index.insert(tx, hash, it)?;
    Ok(hdr.total_size())
}

/// Remove `it` from the index and clear its flags, inside `tx`. Frees it
/// too when nobody holds a reference.
///
/// Returns the record size, or None if the item was not linked.
fn unlink_in(tx: &mut Transaction<'_>, index: &HashIndex, it: u64) -> EngineResult<Option<u64>> {
    let hdr = item::header(tx, it)?;
    if !hdr.is_linked() {
        return Ok(None);
    }
    let key = item::key(tx, it, &hdr)?.to_vec();
    match index.delete(tx, hdr.hval, &key)? {
        Some(found) if found == it => {}
        _ => {
            return Err(PoolError::CorruptHeap {
                offset: it,
                reason: "linked item missing from its hash chain".to_string(),
            }
            .into())
        }
    }
    tx.write_u16(it + OFF_IFLAG, hdr.iflag & !ITEM_LINKED)?;
    tx.write_u8(it + OFF_STORED, 0)?;
    if item::refcount(tx, it)?.is_zero() {
        tx.free(it)?;
    }
    Ok(Some(hdr.total_size()))
}

/// Startup repair: purge never-stored items from the index, rebuild the
/// counters, reset volatile reference counts and free orphaned items.
///
/// Every step is idempotent, so a crash during recovery is repaired by the
/// next open.
fn recover(pool: &mut Pool, index: &HashIndex) -> EngineResult<(RecoveryReport, EngineStats)> {
    let sweep = index.sweep(pool)?;
    let linked = index.linked_items(pool)?;

    let mut stats = EngineStats::default();
    let mut max_cas = 0;
    for &it in &linked {
        item::reset_ref(pool, it, 0)?;
        let hdr = item::header(pool, it)?;
        max_cas = max_cas.max(item::cas(pool, it, &hdr)?);
        stats.curr_items += 1;
        stats.curr_bytes += hdr.total_size();
    }

    let live: HashSet<u64> = linked.into_iter().collect();
    let mut orphans = 0;
    for it in pool.objects(ITEM_TYPE_NUM)? {
        if live.contains(&it) {
            continue;
        }
        in_tx(pool, |tx| Ok(tx.free(it)?))?;
        orphans += 1;
    }
    stats.reclaimed = orphans;

    if sweep.purged > 0 || orphans > 0 {
        warn!(purged = sweep.purged, orphans, "recovery removed incomplete items");
    }
    let cas_high = index.cas_high(pool)?;
    Ok((RecoveryReport { created: false, sweep, orphans, max_cas, cas_high }, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::small().with_pool_path(dir.path().join("cache.pool"));
        config.pool_size = 8 * 1024 * 1024;
        config.log_size = 128 * 1024;
        config.hash_power = 8;
        config
    }

    fn test_engine() -> (PmemEngine, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(100, 1_700_000_000));
        let engine = PmemEngine::open_with_clock(test_config(&dir), clock.clone()).unwrap();
        (engine, clock, dir)
    }

    fn set(engine: &PmemEngine, key: &[u8], value: &[u8], op: StoreOperation) -> EngineResult<u64> {
        engine.store_value(key, value, 0, 0, op, 0)
    }

    fn value(engine: &PmemEngine, key: &[u8]) -> Option<Vec<u8>> {
        match engine.fetch(key) {
            Ok(info) => Some(info.value),
            Err(EngineError::KeyNotFound) => None,
            Err(e) => panic!("fetch failed: {}", e),
        }
    }

    #[test]
    fn test_open_empty() {
        let (engine, _clock, _dir) = test_engine();
        assert!(engine.is_empty().unwrap());
        assert!(engine.recovery().created);
        assert_eq!(engine.stats(), EngineStats::default());
    }

    #[test]
    fn test_set_get() {
        let (engine, _clock, _dir) = test_engine();
        let cas = set(&engine, b"hello", b"world", StoreOperation::Set).unwrap();
        assert!(cas > 0);
        let info = engine.fetch(b"hello").unwrap();
        assert_eq!(info.value, b"world");
        assert_eq!(info.key, b"hello");
        assert_eq!(info.cas, cas);
        assert_eq!(info.time, 100);
        assert_eq!(info.clsid, 1);
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn test_set_overwrite() {
        let (engine, _clock, _dir) = test_engine();
        let c1 = set(&engine, b"k", b"v1", StoreOperation::Set).unwrap();
        let c2 = set(&engine, b"k", b"v2", StoreOperation::Set).unwrap();
        assert!(c2 > c1);
        assert_eq!(value(&engine, b"k"), Some(b"v2".to_vec()));
        assert_eq!(engine.len().unwrap(), 1);
        let stats = engine.stats();
        assert_eq!(stats.curr_items, 1);
        assert_eq!(stats.total_items, 2);
    }

    #[test]
    fn test_add_vs_replace() {
        let (engine, _clock, _dir) = test_engine();
        assert!(matches!(
            set(&engine, b"k", b"x", StoreOperation::Replace),
            Err(EngineError::NotStored)
        ));
        set(&engine, b"k", b"first", StoreOperation::Add).unwrap();
        assert!(matches!(
            set(&engine, b"k", b"second", StoreOperation::Add),
            Err(EngineError::NotStored)
        ));
        assert_eq!(value(&engine, b"k"), Some(b"first".to_vec()));
        set(&engine, b"k", b"third", StoreOperation::Replace).unwrap();
        assert_eq!(value(&engine, b"k"), Some(b"third".to_vec()));
    }

    #[test]
    fn test_cas_semantics() {
        let (engine, _clock, _dir) = test_engine();
        assert!(matches!(
            engine.store_value(b"k", b"v", 0, 0, StoreOperation::Cas, 1),
            Err(EngineError::KeyNotFound)
        ));
        let cas = set(&engine, b"k", b"v1", StoreOperation::Set).unwrap();
        assert!(matches!(
            engine.store_value(b"k", b"v2", 0, 0, StoreOperation::Cas, cas + 100),
            Err(EngineError::KeyExists)
        ));
        let next = engine.store_value(b"k", b"v2", 0, 0, StoreOperation::Cas, cas).unwrap();
        assert!(next > cas);
        assert_eq!(value(&engine, b"k"), Some(b"v2".to_vec()));
        // The old token is now stale.
        assert!(matches!(
            engine.store_value(b"k", b"v3", 0, 0, StoreOperation::Cas, cas),
            Err(EngineError::KeyExists)
        ));
    }

    #[test]
    fn test_append_prepend() {
        let (engine, _clock, _dir) = test_engine();
        assert!(matches!(
            set(&engine, b"k", b"x", StoreOperation::Append),
            Err(EngineError::NotStored)
        ));
        set(&engine, b"k", b"abc", StoreOperation::Set).unwrap();
        set(&engine, b"k", b"def", StoreOperation::Append).unwrap();
        assert_eq!(value(&engine, b"k"), Some(b"abcdef".to_vec()));

        set(&engine, b"p", b"abc", StoreOperation::Set).unwrap();
        set(&engine, b"p", b"def", StoreOperation::Prepend).unwrap();
        assert_eq!(value(&engine, b"p"), Some(b"defabc".to_vec()));
    }

    #[test]
    fn test_append_keeps_flags_and_checks_cas() {
        let (engine, _clock, _dir) = test_engine();
        let cas = engine.store_value(b"k", b"abc", 77, 0, StoreOperation::Set, 0).unwrap();
        assert!(matches!(
            engine.store_value(b"k", b"!", 1, 0, StoreOperation::Append, cas + 1),
            Err(EngineError::KeyExists)
        ));
        engine.store_value(b"k", b"!", 1, 0, StoreOperation::Append, cas).unwrap();
        let info = engine.fetch(b"k").unwrap();
        assert_eq!(info.value, b"abc!");
        assert_eq!(info.flags, 77);
    }

    #[test]
    fn test_append_with_crlf_framing() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.framing_suffix_len = 2;
        let engine = PmemEngine::open(config).unwrap();
        set(&engine, b"k", b"abc\r\n", StoreOperation::Set).unwrap();
        set(&engine, b"k", b"def\r\n", StoreOperation::Append).unwrap();
        assert_eq!(value(&engine, b"k"), Some(b"abcdef\r\n".to_vec()));
        set(&engine, b"k", b"xy\r\n", StoreOperation::Prepend).unwrap();
        assert_eq!(value(&engine, b"k"), Some(b"xyabcdef\r\n".to_vec()));
    }

    #[test]
    fn test_delete() {
        let (engine, _clock, _dir) = test_engine();
        assert!(matches!(engine.delete(b"k", 0), Err(EngineError::KeyNotFound)));
        let cas = set(&engine, b"k", b"v", StoreOperation::Set).unwrap();
        assert!(matches!(engine.delete(b"k", cas + 1), Err(EngineError::KeyExists)));
        engine.delete(b"k", cas).unwrap();
        assert_eq!(value(&engine, b"k"), None);
        set(&engine, b"k", b"v", StoreOperation::Set).unwrap();
        engine.delete(b"k", 0).unwrap();
        assert!(engine.is_empty().unwrap());
        assert_eq!(engine.stats().curr_bytes, 0);
    }

    #[test]
    fn test_held_reference_survives_delete() {
        let (engine, _clock, _dir) = test_engine();
        set(&engine, b"k", b"still here", StoreOperation::Set).unwrap();
        let handle = engine.get(b"k").unwrap();
        engine.delete(b"k", 0).unwrap();
        assert_eq!(engine.item_info(&handle).unwrap().value, b"still here");
        let off = handle.offset();
        engine.release(handle).unwrap();
        let state = engine.state.lock();
        assert!(!state.pool.objects(ITEM_TYPE_NUM).unwrap().contains(&off));
    }

    #[test]
    fn test_expiry() {
        let (engine, clock, _dir) = test_engine();
        engine.store_value(b"k", b"v", 0, 110, StoreOperation::Set, 0).unwrap();
        assert!(value(&engine, b"k").is_some());
        clock.set(109);
        assert!(value(&engine, b"k").is_some());
        clock.set(110);
        assert_eq!(value(&engine, b"k"), None);
        assert!(engine.is_empty().unwrap());
        // Add succeeds once the old item has expired.
        set(&engine, b"k", b"fresh", StoreOperation::Add).unwrap();
        assert_eq!(value(&engine, b"k"), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_append_to_expired_key_not_stored() {
        let (engine, clock, _dir) = test_engine();
        engine.store_value(b"k", b"v", 0, 105, StoreOperation::Set, 0).unwrap();
        clock.advance(10);
        assert!(matches!(
            set(&engine, b"k", b"w", StoreOperation::Append),
            Err(EngineError::NotStored)
        ));
        assert_eq!(engine.len().unwrap(), 0);
    }

    #[test]
    fn test_flush() {
        let (engine, clock, _dir) = test_engine();
        set(&engine, b"old", b"1", StoreOperation::Set).unwrap();
        clock.advance(5);
        engine.flush(0).unwrap();
        set(&engine, b"new", b"2", StoreOperation::Set).unwrap();
        clock.advance(1);
        assert_eq!(value(&engine, b"old"), None);
        assert_eq!(value(&engine, b"new"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_flush_watermark_persisted() {
        let (engine, clock, dir) = test_engine();
        set(&engine, b"k", b"v", StoreOperation::Set).unwrap();
        clock.advance(5);
        engine.flush(0).unwrap();
        drop(engine);

        let engine = PmemEngine::open_with_clock(test_config(&dir), clock.clone()).unwrap();
        assert_eq!(engine.state.lock().oldest_live, 104);
        assert_eq!(value(&engine, b"k"), None);
    }

    #[test]
    fn test_delayed_flush() {
        let (engine, clock, _dir) = test_engine();
        set(&engine, b"k", b"v", StoreOperation::Set).unwrap();
        engine.flush(150).unwrap();
        assert!(value(&engine, b"k").is_some());
        clock.set(150);
        assert_eq!(value(&engine, b"k"), None);
    }

    #[test]
    fn test_preconditions() {
        let (engine, _clock, _dir) = test_engine();
        assert!(matches!(engine.allocate(b"", 0, 0, 1), Err(EngineError::InvalidArgument { .. })));
        assert!(matches!(
            engine.allocate(b"k", 0, 0, ITEM_SIZE_MAX),
            Err(EngineError::InvalidArgument { .. })
        ));
        let handle = engine.allocate(b"k", 0, 0, 2).unwrap();
        assert!(matches!(
            engine.set_value(&handle, 1, b"xy"),
            Err(EngineError::InvalidArgument { .. })
        ));
        engine.set_value(&handle, 0, b"xy").unwrap();
        engine.store(&handle, StoreOperation::Set, 0).unwrap();
        assert!(matches!(
            engine.store(&handle, StoreOperation::Set, 0),
            Err(EngineError::InvalidArgument { .. })
        ));
        assert!(matches!(
            engine.set_value(&handle, 0, b"zz"),
            Err(EngineError::InvalidArgument { .. })
        ));
        engine.release(handle).unwrap();
    }

    #[test]
    fn test_arithmetic_not_supported() {
        let (engine, _clock, _dir) = test_engine();
        assert!(matches!(
            engine.arithmetic(b"n", true, 1, 0, 0),
            Err(EngineError::NotSupported { operation: "arithmetic" })
        ));
    }

    #[test]
    fn test_without_cas() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.use_cas = false;
        let engine = PmemEngine::open(config).unwrap();
        assert_eq!(set(&engine, b"k", b"v", StoreOperation::Set).unwrap(), 0);
        assert_eq!(engine.fetch(b"k").unwrap().cas, 0);
    }

    #[test]
    fn test_reopen_keeps_items_and_cas() {
        let dir = TempDir::new().unwrap();
        let last = {
            let engine = PmemEngine::open(test_config(&dir)).unwrap();
            set(&engine, b"a", b"1", StoreOperation::Set).unwrap();
            set(&engine, b"b", b"2", StoreOperation::Set).unwrap();
            set(&engine, b"gone", b"3", StoreOperation::Set).unwrap();
            engine.delete(b"gone", 0).unwrap();
            set(&engine, b"b", b"22", StoreOperation::Set).unwrap()
        };
        let engine = PmemEngine::open(test_config(&dir)).unwrap();
        assert!(!engine.recovery().created);
        assert_eq!(engine.recovery().max_cas, last);
        assert_eq!(value(&engine, b"a"), Some(b"1".to_vec()));
        assert_eq!(value(&engine, b"b"), Some(b"22".to_vec()));
        assert_eq!(value(&engine, b"gone"), None);
        assert_eq!(engine.stats().curr_items, 2);
        assert!(set(&engine, b"c", b"3", StoreOperation::Set).unwrap() > last);
    }

    #[test]
    fn test_unreleased_allocation_reclaimed_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = PmemEngine::open(test_config(&dir)).unwrap();
            let handle = engine.allocate(b"never-stored", 0, 0, 16).unwrap();
            std::mem::forget(handle);
        }
        let engine = PmemEngine::open(test_config(&dir)).unwrap();
        assert_eq!(engine.recovery().orphans, 1);
        assert_eq!(engine.stats().reclaimed, 1);
        engine.reset_stats();
        assert_eq!(engine.stats().reclaimed, 0);
    }

    #[test]
    fn test_poisoned_engine_refuses_work() {
        let (engine, _clock, _dir) = test_engine();
        set(&engine, b"held", b"v", StoreOperation::Set).unwrap();
        let held = engine.get(b"held").unwrap();

        let _ = engine.structural::<()>(Err(PoolError::LogFull { needed: 2, capacity: 1 }.into()));
        assert!(engine.is_poisoned());
        assert!(matches!(engine.get(b"k"), Err(EngineError::Fatal { .. })));
        assert!(set(&engine, b"k", b"v", StoreOperation::Set).unwrap_err().is_fatal());
        assert!(engine.item_info(&held).unwrap_err().is_fatal());
        assert!(engine.len().unwrap_err().is_fatal());
        assert!(engine.flush(0).unwrap_err().is_fatal());
        std::mem::forget(held);
    }

    #[test]
    fn test_concurrent_writers() {
        let (engine, _clock, _dir) = test_engine();
        let engine = Arc::new(engine);
        let mut handles = vec![];
        for t in 0..4 {
            let e = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("t{}-k{}", t, i);
                    set(&e, key.as_bytes(), key.as_bytes(), StoreOperation::Set).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(engine.len().unwrap(), 200);
        assert_eq!(value(&engine, b"t3-k49"), Some(b"t3-k49".to_vec()));
    }
}
