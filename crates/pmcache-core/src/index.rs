//! Persistent hash index
//!
//! The pool root is the index descriptor:
//!
//! ```text
//!   [0..4]   hashsize   u32 - bucket count, a power of two
//!   [4..8]   hashmask   u32 - hashsize - 1
//!   [8..16]  table      u64 - bucket array object, 0 until initialised
//!   [16..24] hash_items u64 - items reachable from the table
//!   [24..32] epoch      u64 - UNIX seconds at pool creation
//!   [32..40] cas_high   u64 - highest CAS token ever linked
//!   [40..44] oldest_live u32 - flush watermark in cache time, 0 = unset
//! ```
//!
//! Each bucket is a u64 chain head (0 = empty). Chains are threaded through
//! the items' `h_next` field and are newest-first. Every mutation runs inside
//! a caller-supplied [`Transaction`], so a chain is never observed half-linked.

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult, PoolError};
use crate::item::{self, ItemHeader, ITEM_TYPE_NUM, OFF_H_NEXT};
use crate::pool::{Pool, Transaction};

/// Type number of the bucket array object
pub const TABLE_TYPE_NUM: u16 = 2;

/// Size of the root descriptor
pub const ROOT_SIZE: u64 = 48;

/// Seed for key hashing. Changing it invalidates every existing pool.
pub const HASH_SEED: u32 = 0x9747_b28c;

const ROOT_HASHSIZE: u64 = 0;
const ROOT_HASHMASK: u64 = 4;
const ROOT_TABLE: u64 = 8;
const ROOT_HASH_ITEMS: u64 = 16;
const ROOT_EPOCH: u64 = 24;
const ROOT_CAS_HIGH: u64 = 32;
const ROOT_OLDEST_LIVE: u64 = 40;

/// Hash a key. CRC32C is stable across processes, unlike a randomly keyed
/// hasher, which the persistent bucket layout requires.
pub fn hash_key(key: &[u8], seed: u32) -> u32 {
    crc32c::crc32c_append(seed, key)
}

/// Outcome of a recovery sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Buckets visited
    pub buckets: u64,
    /// Linked, stored items left in place
    pub kept: u64,
    /// Items unlinked and freed because they were never stored
    pub purged: u64,
}

/// Handle on an initialised index. Cheap to copy; all state lives in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashIndex {
    root: u64,
    table: u64,
    mask: u32,
    size: u32,
}

impl HashIndex {
    /// Attach to the index rooted at `root`, creating the bucket array on
    /// first use. Idempotent: an initialised index keeps its size and epoch.
    pub fn init(pool: &mut Pool, root: u64, hash_power: u8, epoch: u64) -> EngineResult<Self> {
        let table = pool.read_u64(root + ROOT_TABLE)?;
        if table != 0 {
            let size = pool.read_u32(root + ROOT_HASHSIZE)?;
            let mask = pool.read_u32(root + ROOT_HASHMASK)?;
            if !size.is_power_of_two() || mask != size - 1 {
                return Err(PoolError::CorruptHeap {
                    offset: root,
                    reason: format!("hash descriptor size {} mask {:#x}", size, mask),
                }
                .into());
            }
            let index = Self { root, table, mask, size };
            debug!(buckets = size, items = index.items(pool)?, "attached hash index");
            return Ok(index);
        }

        if hash_power == 0 || hash_power > 31 {
            return Err(EngineError::invalid(format!("hash_power {} out of range", hash_power)));
        }
        let size = 1u32 << hash_power;
        let mut tx = pool.begin();
        let table = tx.alloc(size as u64 * 8, TABLE_TYPE_NUM)?;
        tx.write_u32(root + ROOT_HASHSIZE, size)?;
        tx.write_u32(root + ROOT_HASHMASK, size - 1)?;
        tx.write_u64(root + ROOT_TABLE, table)?;
        tx.write_u64(root + ROOT_HASH_ITEMS, 0)?;
        tx.write_u64(root + ROOT_EPOCH, epoch)?;
        tx.commit()?;

        info!(buckets = size, table, "created hash index");
        Ok(Self { root, table, mask: size - 1, size })
    }

    /// Number of buckets
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Pool clock epoch stored with the index
    pub fn epoch(&self, pool: &Pool) -> EngineResult<u64> {
        Ok(pool.read_u64(self.root + ROOT_EPOCH)?)
    }

    /// Highest CAS token ever linked, including items since removed
    pub fn cas_high(&self, pool: &Pool) -> EngineResult<u64> {
        Ok(pool.read_u64(self.root + ROOT_CAS_HIGH)?)
    }

    /// Raise the CAS high-water mark to `cas` inside `tx`; never lowers it.
    pub fn raise_cas_high(&self, tx: &mut Transaction<'_>, cas: u64) -> EngineResult<()> {
        if cas > tx.read_u64(self.root + ROOT_CAS_HIGH)? {
            tx.write_u64(self.root + ROOT_CAS_HIGH, cas)?;
        }
        Ok(())
    }

    /// Persisted flush watermark
    pub fn oldest_live(&self, pool: &Pool) -> EngineResult<u32> {
        Ok(pool.read_u32(self.root + ROOT_OLDEST_LIVE)?)
    }

    pub fn set_oldest_live(&self, tx: &mut Transaction<'_>, when: u32) -> EngineResult<()> {
        tx.write_u32(self.root + ROOT_OLDEST_LIVE, when)?;
        Ok(())
    }

    /// Items currently reachable from the table
    pub fn items(&self, pool: &Pool) -> EngineResult<u64> {
        Ok(pool.read_u64(self.root + ROOT_HASH_ITEMS)?)
    }

    fn bucket(&self, hash: u32) -> u64 {
        self.table + (hash & self.mask) as u64 * 8
    }

    /// First item in `hash`'s bucket whose hash, key length and key match.
    pub fn find(&self, pool: &Pool, hash: u32, key: &[u8]) -> EngineResult<Option<u64>> {
        let mut cur = pool.read_u64(self.bucket(hash))?;
        while cur != 0 {
            let hdr = item::header(pool, cur)?;
            if Self::matches(pool, cur, &hdr, hash, key)? {
                return Ok(Some(cur));
            }
            cur = hdr.h_next.unwrap_or(0);
        }
        Ok(None)
    }

    /// Prepend `it` to its bucket. The key must not already be present.
    pub fn insert(&self, tx: &mut Transaction<'_>, hash: u32, it: u64) -> EngineResult<()> {
        let hdr = item::header(tx, it)?;
        let key = item::key(tx, it, &hdr)?.to_vec();
        if self.find(tx, hash, &key)?.is_some() {
            return Err(EngineError::invalid("duplicate key inserted into hash index"));
        }

        let bucket = self.bucket(hash);
        let head = tx.read_u64(bucket)?;
        tx.write_u64(it + OFF_H_NEXT, head)?;
        tx.write_u64(bucket, it)?;
        let count = tx.read_u64(self.root + ROOT_HASH_ITEMS)?;
        tx.write_u64(self.root + ROOT_HASH_ITEMS, count + 1)?;
        Ok(())
    }

    /// Unlink the item matching `key` from its chain and return it.
    pub fn delete(
        &self,
        tx: &mut Transaction<'_>,
        hash: u32,
        key: &[u8],
    ) -> EngineResult<Option<u64>> {
        let bucket = self.bucket(hash);
        let mut prev: Option<u64> = None;
        let mut cur = tx.read_u64(bucket)?;
        while cur != 0 {
            let hdr = item::header(tx, cur)?;
            if Self::matches(tx, cur, &hdr, hash, key)? {
                self.unlink_at(tx, bucket, prev, cur, &hdr)?;
                return Ok(Some(cur));
            }
            prev = Some(cur);
            cur = hdr.h_next.unwrap_or(0);
        }
        Ok(None)
    }

    fn unlink_at(
        &self,
        tx: &mut Transaction<'_>,
        bucket: u64,
        prev: Option<u64>,
        cur: u64,
        hdr: &ItemHeader,
    ) -> EngineResult<()> {
        let next = hdr.h_next.unwrap_or(0);
        match prev {
            Some(p) => tx.write_u64(p + OFF_H_NEXT, next)?,
            None => tx.write_u64(bucket, next)?,
        }
        tx.write_u64(cur + OFF_H_NEXT, 0)?;
        let count = tx.read_u64(self.root + ROOT_HASH_ITEMS)?;
        tx.write_u64(self.root + ROOT_HASH_ITEMS, count.saturating_sub(1))?;
        Ok(())
    }

    fn matches(
        pool: &Pool,
        off: u64,
        hdr: &ItemHeader,
        hash: u32,
        key: &[u8],
    ) -> EngineResult<bool> {
        Ok(hdr.hval == hash
            && hdr.nkey as usize == key.len()
            && item::key(pool, off, hdr)? == key)
    }

    /// Every item reachable from the table, bucket by bucket.
    pub fn linked_items(&self, pool: &Pool) -> EngineResult<Vec<u64>> {
        let mut items = Vec::new();
        for b in 0..self.size as u64 {
            let mut cur = pool.read_u64(self.table + b * 8)?;
            while cur != 0 {
                items.push(cur);
                cur = item::header(pool, cur)?.h_next.unwrap_or(0);
            }
        }
        Ok(items)
    }

    /// Unlink and free every item in the table that was never stored.
    ///
    /// Each removal is its own transaction, so a sweep interrupted by a
    /// crash resumes where it left off on the next open.
    pub fn sweep(&self, pool: &mut Pool) -> EngineResult<SweepReport> {
        let mut report = SweepReport { buckets: self.size as u64, ..SweepReport::default() };

        for b in 0..self.size as u64 {
            let bucket = self.table + b * 8;
            let mut prev: Option<u64> = None;
            let mut cur = pool.read_u64(bucket)?;
            while cur != 0 {
                let block = pool.block_header(cur)?;
                if block.type_num != ITEM_TYPE_NUM {
                    return Err(PoolError::CorruptHeap {
                        offset: cur,
                        reason: format!("bucket {} chains to a type {} object", b, block.type_num),
                    }
                    .into());
                }
                let hdr = item::header(pool, cur)?;
                let next = hdr.h_next.unwrap_or(0);
                if hdr.stored && hdr.is_linked() {
                    report.kept += 1;
                    prev = Some(cur);
                } else {
                    let mut tx = pool.begin();
                    self.unlink_at(&mut tx, bucket, prev, cur, &hdr)?;
                    tx.free(cur)?;
                    tx.commit()?;
                    report.purged += 1;
                    debug!(offset = cur, bucket = b, "purged unstored item");
                }
                cur = next;
            }
        }
        Ok(report)
    }
}
