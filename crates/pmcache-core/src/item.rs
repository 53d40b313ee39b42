//! Item records
//!
//! One key/value pair lives in one pool object:
//!
//! ```text
//! +----------------------+-----------------+-----------+--------------+
//! | header (56 bytes)    | cas u64 (opt.)  | key bytes | value bytes  |
//! +----------------------+-----------------+-----------+--------------+
//! ```
//!
//! Header layout (little-endian):
//!   [0..2]   refcount  u16 - volatile, reset on open
//!   [2]      clsid     u8  - always 1
//!   [3]      refchunk  u8  - refcount overflow chunks
//!   [4..8]   flags     u32 - opaque client flags
//!   [8..16]  lru_prev  u64
//!   [16..24] lru_next  u64
//!   [24..32] h_next    u64 - next item in the hash chain, 0 = none
//!   [32..36] time      u32 - last access, pool-relative seconds
//!   [36..40] exptime   u32 - 0 = never
//!   [40..42] iflag     u16 - WITH_CAS | LINKED
//!   [42..44] nkey      u16
//!   [44..46] nprefix   u16 - always 0
//!   [46]     lru tag   u8  - 0 = unlinked, 1 = linked
//!   [47]     stored    u8  - set in the same transaction as the index insert
//!   [48..52] hval      u32 - hash of the key
//!   [52..56] nbytes    u32 - value length

use crate::error::{EngineError, EngineResult, PoolError};
use crate::pool::{Pool, Transaction};

/// Type number of item objects in the pool heap
pub const ITEM_TYPE_NUM: u16 = 3;

/// Fixed header size
pub const ITEM_HEADER_SIZE: u64 = 56;

/// Item carries an 8-byte CAS token after the header
pub const ITEM_WITH_CAS: u16 = 1;

/// Item is reachable from the hash index
pub const ITEM_LINKED: u16 = 1 << 8;

/// Storage class of every item
pub const ITEM_CLSID: u8 = 1;

/// Refcount value that triggers a spill into `refchunk`
pub const REFCOUNT_FULL: u16 = 65535;

/// Amount moved between `refcount` and `refchunk`
pub const REFCOUNT_MOVE: u16 = 32768;

pub(crate) const OFF_REFCOUNT: u64 = 0;
pub(crate) const OFF_H_NEXT: u64 = 24;
pub(crate) const OFF_TIME: u64 = 32;
pub(crate) const OFF_IFLAG: u64 = 40;
pub(crate) const OFF_STORED: u64 = 47;
pub(crate) const OFF_HVAL: u64 = 48;

/// Position of an item in the (unused) LRU list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruState {
    Unlinked,
    Linked { prev: u64, next: u64 },
}

/// Split reference count: `chunk * REFCOUNT_MOVE + count` references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefCount {
    pub count: u16,
    pub chunk: u8,
}

impl RefCount {
    /// One more reference; None if the chunk counter would overflow.
    pub fn incr(self) -> Option<Self> {
        let mut next = self;
        next.count += 1;
        if next.count == REFCOUNT_FULL {
            next.count -= REFCOUNT_MOVE;
            next.chunk = next.chunk.checked_add(1)?;
        }
        Some(next)
    }

    /// One reference fewer; None if there are none.
    pub fn decr(self) -> Option<Self> {
        if self.is_zero() {
            return None;
        }
        let mut next = self;
        if next.count == 0 {
            next.chunk -= 1;
            next.count = REFCOUNT_MOVE;
        }
        next.count -= 1;
        if next.count == 0 && next.chunk > 0 {
            next.chunk -= 1;
            next.count = REFCOUNT_MOVE;
        }
        Some(next)
    }

    pub fn is_zero(self) -> bool {
        self.count == 0 && self.chunk == 0
    }

    /// Total number of references
    pub fn total(self) -> u32 {
        self.chunk as u32 * REFCOUNT_MOVE as u32 + self.count as u32
    }
}

/// Decoded item header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemHeader {
    pub refcount: RefCount,
    pub clsid: u8,
    pub flags: u32,
    pub lru: LruState,
    pub h_next: Option<u64>,
    pub time: u32,
    pub exptime: u32,
    pub iflag: u16,
    pub nkey: u16,
    pub nprefix: u16,
    pub stored: bool,
    pub hval: u32,
    pub nbytes: u32,
}

impl ItemHeader {
    /// Header of a freshly allocated, unlinked item
    pub fn new(nkey: u16, flags: u32, exptime: u32, nbytes: u32, use_cas: bool) -> Self {
        Self {
            refcount: RefCount { count: 1, chunk: 0 },
            clsid: ITEM_CLSID,
            flags,
            lru: LruState::Unlinked,
            h_next: None,
            time: 0,
            exptime,
            iflag: if use_cas { ITEM_WITH_CAS } else { 0 },
            nkey,
            nprefix: 0,
            stored: false,
            hval: 0,
            nbytes,
        }
    }

    pub fn to_bytes(&self) -> [u8; ITEM_HEADER_SIZE as usize] {
        let mut buf = [0u8; ITEM_HEADER_SIZE as usize];
        buf[0..2].copy_from_slice(&self.refcount.count.to_le_bytes());
        buf[2] = self.clsid;
        buf[3] = self.refcount.chunk;
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        let (tag, prev, next) = match self.lru {
            LruState::Unlinked => (0u8, 0u64, 0u64),
            LruState::Linked { prev, next } => (1, prev, next),
        };
        buf[8..16].copy_from_slice(&prev.to_le_bytes());
        buf[16..24].copy_from_slice(&next.to_le_bytes());
        buf[24..32].copy_from_slice(&self.h_next.unwrap_or(0).to_le_bytes());
        buf[32..36].copy_from_slice(&self.time.to_le_bytes());
        buf[36..40].copy_from_slice(&self.exptime.to_le_bytes());
        buf[40..42].copy_from_slice(&self.iflag.to_le_bytes());
        buf[42..44].copy_from_slice(&self.nkey.to_le_bytes());
        buf[44..46].copy_from_slice(&self.nprefix.to_le_bytes());
        buf[46] = tag;
        buf[47] = self.stored as u8;
        buf[48..52].copy_from_slice(&self.hval.to_le_bytes());
        buf[52..56].copy_from_slice(&self.nbytes.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let lru = match buf[46] {
            0 => LruState::Unlinked,
            _ => LruState::Linked { prev: u64_at(8), next: u64_at(16) },
        };
        let h_next = u64_at(24);
        Self {
            refcount: RefCount { count: u16_at(0), chunk: buf[3] },
            clsid: buf[2],
            flags: u32_at(4),
            lru,
            h_next: if h_next == 0 { None } else { Some(h_next) },
            time: u32_at(32),
            exptime: u32_at(36),
            iflag: u16_at(40),
            nkey: u16_at(42),
            nprefix: u16_at(44),
            stored: buf[47] != 0,
            hval: u32_at(48),
            nbytes: u32_at(52),
        }
    }

    pub fn has_cas(&self) -> bool {
        self.iflag & ITEM_WITH_CAS != 0
    }

    pub fn is_linked(&self) -> bool {
        self.iflag & ITEM_LINKED != 0
    }

    /// Offset of the key relative to the item start
    pub fn key_offset(&self) -> u64 {
        ITEM_HEADER_SIZE + if self.has_cas() { 8 } else { 0 }
    }

    /// Offset of the value relative to the item start
    pub fn value_offset(&self) -> u64 {
        self.key_offset() + self.nkey as u64
    }

    /// Whole record size
    pub fn total_size(&self) -> u64 {
        self.value_offset() + self.nbytes as u64
    }

    /// Live check against the pool clock and the flush watermark.
    pub fn is_valid(&self, now: u32, oldest_live: u32) -> bool {
        if self.exptime != 0 && self.exptime <= now {
            return false;
        }
        if oldest_live != 0 && oldest_live <= now && self.time <= oldest_live {
            return false;
        }
        true
    }
}

/// Record size for a key/value pair
pub fn record_size(nkey: usize, nbytes: usize, use_cas: bool) -> u64 {
    ITEM_HEADER_SIZE + if use_cas { 8 } else { 0 } + nkey as u64 + nbytes as u64
}

/// Allocate an unlinked item with refcount 1 and the key copied in.
///
/// Callers validate key and value sizes first. The value bytes are zero.
pub fn alloc(
    pool: &mut Pool,
    key: &[u8],
    flags: u32,
    exptime: u32,
    nbytes: u32,
    use_cas: bool,
) -> EngineResult<u64> {
    let nkey = u16::try_from(key.len())
        .map_err(|_| EngineError::invalid("key longer than 65535 bytes"))?;
    let header = ItemHeader::new(nkey, flags, exptime, nbytes, use_cas);
    let total = header.total_size();

    let mut tx = pool.begin();
    let off = tx.alloc(total, ITEM_TYPE_NUM).map_err(|e| match e {
        PoolError::OutOfSpace { .. } => EngineError::OutOfMemory { requested: total },
        other => EngineError::Pool(other),
    })?;
    tx.write(off, &header.to_bytes())?;
    tx.write(off + header.key_offset(), key)?;
    tx.commit()?;
    Ok(off)
}

/// Read the header of the item at `off`.
pub fn header(pool: &Pool, off: u64) -> EngineResult<ItemHeader> {
    Ok(ItemHeader::from_bytes(pool.bytes(off, ITEM_HEADER_SIZE)?))
}

pub fn key<'p>(pool: &'p Pool, off: u64, header: &ItemHeader) -> EngineResult<&'p [u8]> {
    Ok(pool.bytes(off + header.key_offset(), header.nkey as u64)?)
}

pub fn data<'p>(pool: &'p Pool, off: u64, header: &ItemHeader) -> EngineResult<&'p [u8]> {
    Ok(pool.bytes(off + header.value_offset(), header.nbytes as u64)?)
}

/// CAS token, 0 when the item has no CAS slot.
pub fn cas(pool: &Pool, off: u64, header: &ItemHeader) -> EngineResult<u64> {
    if !header.has_cas() {
        return Ok(0);
    }
    Ok(pool.read_u64(off + ITEM_HEADER_SIZE)?)
}

/// Set the CAS token inside a transaction; no-op without a CAS slot.
pub fn set_cas(
    tx: &mut Transaction<'_>,
    off: u64,
    header: &ItemHeader,
    value: u64,
) -> EngineResult<()> {
    if header.has_cas() {
        tx.write_u64(off + ITEM_HEADER_SIZE, value)?;
    }
    Ok(())
}

/// Current reference count (volatile state)
pub fn refcount(pool: &Pool, off: u64) -> EngineResult<RefCount> {
    let count = pool.read_u16(off + OFF_REFCOUNT)?;
    let chunk = pool.read_u8(off + 3)?;
    Ok(RefCount { count, chunk })
}

fn store_refcount(pool: &mut Pool, off: u64, rc: RefCount) -> EngineResult<()> {
    let mut buf = [0u8; 4];
    buf[0..2].copy_from_slice(&rc.count.to_le_bytes());
    buf[2] = ITEM_CLSID;
    buf[3] = rc.chunk;
    pool.write_volatile(off + OFF_REFCOUNT, &buf)?;
    Ok(())
}

pub fn incr_ref(pool: &mut Pool, off: u64) -> EngineResult<RefCount> {
    let rc = refcount(pool, off)?
        .incr()
        .ok_or_else(|| EngineError::invalid(format!("reference count overflow on item {}", off)))?;
    store_refcount(pool, off, rc)?;
    Ok(rc)
}

pub fn decr_ref(pool: &mut Pool, off: u64) -> EngineResult<RefCount> {
    let rc = refcount(pool, off)?
        .decr()
        .ok_or_else(|| EngineError::invalid(format!("reference count underflow on item {}", off)))?;
    store_refcount(pool, off, rc)?;
    Ok(rc)
}

/// Force the reference count, used by recovery.
pub fn reset_ref(pool: &mut Pool, off: u64, count: u16) -> EngineResult<()> {
    store_refcount(pool, off, RefCount { count, chunk: 0 })
}
