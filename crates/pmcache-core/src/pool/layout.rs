//! On-media layout of a pool file
//!
//! ```text
//! +-------------+------------------+-----------------------------------+
//! | superblock  |     undo log     |               heap                |
//! |   4 KiB     |  log_size bytes  |  [block hdr | payload] ...  top → |
//! +-------------+------------------+-----------------------------------+
//! ```
//!
//! All integers are little-endian. Block sizes are power-of-two size
//! classes so a freed block can be reused by any request of its class and
//! the heap can be walked header to header from `heap_start` to `heap_top`.

use crate::error::{PoolError, PoolResult};

/// Magic bytes identifying a pmcache pool file
pub const POOL_MAGIC: [u8; 8] = *b"PMCACHE\0";

/// On-media format version
pub const POOL_VERSION: u32 = 1;

/// Superblock size in bytes (one page)
pub const SUPERBLOCK_SIZE: u64 = 4096;

/// Bytes reserved for the layout name, including the NUL terminator
pub const LAYOUT_NAME_LEN: usize = 32;

/// Number of power-of-two size classes with a free list
pub const NUM_CLASSES: usize = 48;

/// Smallest block handed out by the allocator
pub const MIN_BLOCK: u64 = 64;

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: u64 = 16;

/// Undo log header: record count (u64) + bytes used (u64)
pub const LOG_HEADER_SIZE: u64 = 16;

/// Undo record header: target offset (u64) + length (u64) + crc32c (u32) + pad
pub const UNDO_RECORD_HEADER: u64 = 24;

pub(crate) const SB_ROOT_OFF: u64 = 56;
pub(crate) const SB_ROOT_SIZE: u64 = 64;
pub(crate) const SB_HEAP_START: u64 = 72;
pub(crate) const SB_HEAP_TOP: u64 = 80;
pub(crate) const SB_FREE_HEADS: u64 = 104;

/// Bytes of the superblock covered by [`Superblock::to_bytes`]
pub(crate) const SB_FIXED_SIZE: usize = SB_FREE_HEADS as usize;

/// Offset of the free list head for a size class
pub(crate) fn free_head_offset(class: usize) -> u64 {
    SB_FREE_HEADS + (class as u64) * 8
}

/// Round `value` up to a multiple of `align` (a power of two)
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Size class and block size for a request of `total` bytes (header included).
///
/// Returns None when no class is large enough.
pub(crate) fn size_class(total: u64) -> Option<(usize, u64)> {
    let block = total.max(MIN_BLOCK).checked_next_power_of_two()?;
    let class = (block.trailing_zeros() - MIN_BLOCK.trailing_zeros()) as usize;
    if class >= NUM_CLASSES {
        return None;
    }
    Some((class, block))
}

/// Fixed part of the superblock
///
/// Layout:
///   [0..8]     magic:      [u8;8] - "PMCACHE\0"
///   [8..12]    version:    u32
///   [12..16]   reserved
///   [16..24]   pool_size:  u64
///   [24..56]   layout:     [u8;32] NUL-padded name
///   [56..64]   root_off:   u64 - payload offset of the root object, 0 if none
///   [64..72]   root_size:  u64
///   [72..80]   heap_start: u64
///   [80..88]   heap_top:   u64 - first byte never handed out
///   [88..96]   log_off:    u64
///   [96..104]  log_size:   u64
///   [104..488] free_heads: [u64;48] - block offset of each class's first free block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: [u8; 8],
    pub version: u32,
    pub pool_size: u64,
    pub layout: [u8; LAYOUT_NAME_LEN],
    pub root_off: u64,
    pub root_size: u64,
    pub heap_start: u64,
    pub heap_top: u64,
    pub log_off: u64,
    pub log_size: u64,
}

impl Superblock {
    /// Superblock for a freshly formatted pool
    pub fn new(pool_size: u64, layout: &str, log_size: u64) -> PoolResult<Self> {
        let name = layout.as_bytes();
        if name.is_empty() || name.len() >= LAYOUT_NAME_LEN {
            return Err(PoolError::LayoutMismatch {
                expected: format!("1..{} byte name", LAYOUT_NAME_LEN),
                found: layout.to_string(),
            });
        }
        let mut layout_bytes = [0u8; LAYOUT_NAME_LEN];
        layout_bytes[..name.len()].copy_from_slice(name);

        let log_off = SUPERBLOCK_SIZE;
        let heap_start = align_up(log_off + log_size, SUPERBLOCK_SIZE);
        Ok(Self {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            pool_size,
            layout: layout_bytes,
            root_off: 0,
            root_size: 0,
            heap_start,
            heap_top: heap_start,
            log_off,
            log_size,
        })
    }

    /// Layout name without NUL padding
    pub fn layout_name(&self) -> String {
        let end = self.layout.iter().position(|&b| b == 0).unwrap_or(LAYOUT_NAME_LEN);
        String::from_utf8_lossy(&self.layout[..end]).into_owned()
    }

    /// Serialize the fixed fields
    pub fn to_bytes(&self) -> [u8; SB_FIXED_SIZE] {
        let mut buf = [0u8; SB_FIXED_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.pool_size.to_le_bytes());
        buf[24..56].copy_from_slice(&self.layout);
        buf[56..64].copy_from_slice(&self.root_off.to_le_bytes());
        buf[64..72].copy_from_slice(&self.root_size.to_le_bytes());
        buf[72..80].copy_from_slice(&self.heap_start.to_le_bytes());
        buf[80..88].copy_from_slice(&self.heap_top.to_le_bytes());
        buf[88..96].copy_from_slice(&self.log_off.to_le_bytes());
        buf[96..104].copy_from_slice(&self.log_size.to_le_bytes());
        buf
    }

    /// Parse the fixed fields
    pub fn from_bytes(buf: &[u8; SB_FIXED_SIZE]) -> Self {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let mut layout = [0u8; LAYOUT_NAME_LEN];
        layout.copy_from_slice(&buf[24..56]);
        Self {
            magic,
            version: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            pool_size: le_u64(&buf[16..24]),
            layout,
            root_off: le_u64(&buf[56..64]),
            root_size: le_u64(&buf[64..72]),
            heap_start: le_u64(&buf[72..80]),
            heap_top: le_u64(&buf[80..88]),
            log_off: le_u64(&buf[88..96]),
            log_size: le_u64(&buf[96..104]),
        }
    }
}

/// Allocation state of a heap block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    Allocated = 1,
}

/// Heap block header
///
/// Layout:
///   [0..8]   size:     u64 - whole block including this header
///   [8..10]  type_num: u16 - object type tag, 0 when free
///   [10]     state:    u8
///   [11..16] reserved
///
/// A free block keeps the offset of the next free block of its class in the
/// first 8 payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub size: u64,
    pub type_num: u16,
    pub state: BlockState,
}

impl BlockHeader {
    pub fn allocated(size: u64, type_num: u16) -> Self {
        Self { size, type_num, state: BlockState::Allocated }
    }

    pub fn free(size: u64) -> Self {
        Self { size, type_num: 0, state: BlockState::Free }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..10].copy_from_slice(&self.type_num.to_le_bytes());
        buf[10] = self.state as u8;
        buf
    }

    /// Parse a header; None if the state byte or size is not plausible.
    pub fn from_bytes(buf: &[u8; BLOCK_HEADER_SIZE as usize]) -> Option<Self> {
        let size = le_u64(&buf[0..8]);
        if size < MIN_BLOCK || !size.is_power_of_two() {
            return None;
        }
        let state = match buf[10] {
            0 => BlockState::Free,
            1 => BlockState::Allocated,
            _ => return None,
        };
        Some(Self {
            size,
            type_num: u16::from_le_bytes([buf[8], buf[9]]),
            state,
        })
    }
}

pub(crate) fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
