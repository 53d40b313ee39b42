//! Persistent memory pool
//!
//! A pool is a file mapped into the address space and treated as
//! byte-addressable persistent memory. `flush_range` on the mapping is the
//! persist barrier. On top of the raw mapping the pool provides:
//!
//! - a superblock with a named layout and a single root object,
//! - a power-of-two heap allocator with per-class free lists,
//! - undo-logged transactions ([`Transaction`]) that make any group of
//!   writes, allocations and frees atomic with respect to a crash.
//!
//! A transaction interrupted by a crash is rolled back the next time the
//! pool is opened, before any caller can observe its partial effects.

mod layout;
mod tx;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::platform_durability::{durable_sync, sync_parent_dir};

pub use layout::{
    BlockHeader, BlockState, Superblock, BLOCK_HEADER_SIZE, MIN_BLOCK, POOL_MAGIC, POOL_VERSION,
    SUPERBLOCK_SIZE,
};
pub use tx::Transaction;

use layout::{
    align_up, le_u64, LOG_HEADER_SIZE, SB_FIXED_SIZE, SB_HEAP_START, SB_HEAP_TOP, SB_ROOT_OFF,
    SB_ROOT_SIZE, UNDO_RECORD_HEADER,
};

/// Type number of the root object
pub const ROOT_TYPE_NUM: u16 = 1;

/// Smallest heap a pool is created with
const MIN_HEAP_SIZE: u64 = 1024 * 1024;

/// A mapped pool file.
///
/// Offsets handed out by the pool (`u64`, 0 meaning "none") are relative to
/// the start of the file, so they stay valid across remaps and restarts.
pub struct Pool {
    /// Memory-mapped pool file
    mmap: MmapMut,
    /// File handle kept open for the lifetime of the mapping
    _file: File,
    /// Pool file path (for error context)
    path: PathBuf,
    /// Mapped size in bytes
    size: u64,
    /// Layout name from the superblock
    layout: String,
    /// Undo log region
    log_off: u64,
    log_size: u64,
    /// Records currently in the undo log (mirrors the persistent header)
    log_records: u64,
    /// Record bytes currently in the undo log
    log_used: u64,
}

impl Pool {
    /// Format a new pool file, replacing anything at `path`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        layout: &str,
        size: u64,
        log_size: u64,
    ) -> PoolResult<Self> {
        let path = path.as_ref().to_path_buf();
        let superblock = Superblock::new(size, layout, log_size)?;
        let minimum = superblock.heap_start + MIN_HEAP_SIZE;
        if size < minimum {
            return Err(PoolError::PoolTooSmall { requested: size, minimum });
        }

        info!(path = %path.display(), size, log_size, layout, "creating pool");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_error(&path, "Failed to create pool file", e))?;
        file.set_len(size)
            .map_err(|e| io_error(&path, "Failed to size pool file", e))?;
        durable_sync(&file)
            .map_err(|e| io_error(&path, "Failed to sync pool file", e))?;
        sync_parent_dir(&path)
            .map_err(|e| io_error(&path, "Failed to sync pool directory", e))?;

        // SAFETY: the file was just created and sized by us and stays open for
        // the lifetime of the mapping. Concurrent modification by other
        // processes is outside the pool's contract.
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| io_error(&path, "Failed to map pool file", e))?;

        let mut pool = Self {
            mmap,
            _file: file,
            path,
            size,
            layout: layout.to_string(),
            log_off: superblock.log_off,
            log_size: superblock.log_size,
            log_records: 0,
            log_used: 0,
        };

        // Log header and free list heads are zero in a fresh sparse file;
        // the superblock goes in last so a half-formatted file has no magic.
        pool.write_log_header()?;
        let mut fixed = superblock.to_bytes();
        fixed[..8].fill(0);
        pool.copy_in(0, &fixed)?;
        pool.persist(0, SUPERBLOCK_SIZE)?;
        pool.copy_in(0, &POOL_MAGIC)?;
        pool.persist(0, 8)?;

        Ok(pool)
    }

    /// Open an existing pool file and roll back any interrupted transaction.
    pub fn open<P: AsRef<Path>>(path: P, layout: &str) -> PoolResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_error(&path, "Failed to open pool file", e))?;
        let file_len = file
            .metadata()
            .map_err(|e| io_error(&path, "Failed to stat pool file", e))?
            .len();
        if file_len < SUPERBLOCK_SIZE {
            return Err(PoolError::BadMagic { path, found: [0; 8] });
        }

        // SAFETY: see `create`; the file handle outlives the mapping.
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| io_error(&path, "Failed to map pool file", e))?;

        let mut fixed = [0u8; SB_FIXED_SIZE];
        fixed.copy_from_slice(&mmap[..SB_FIXED_SIZE]);
        let sb = Superblock::from_bytes(&fixed);

        if sb.magic != POOL_MAGIC {
            return Err(PoolError::BadMagic { path, found: sb.magic });
        }
        if sb.version != POOL_VERSION {
            return Err(PoolError::VersionMismatch { expected: POOL_VERSION, found: sb.version });
        }
        let found_layout = sb.layout_name();
        if found_layout != layout {
            return Err(PoolError::LayoutMismatch {
                expected: layout.to_string(),
                found: found_layout,
            });
        }
        if sb.pool_size > file_len
            || sb.log_off + sb.log_size > sb.heap_start
            || sb.heap_top < sb.heap_start
            || sb.heap_top > sb.pool_size
        {
            return Err(PoolError::CorruptHeap {
                offset: 0,
                reason: format!(
                    "superblock inconsistent: size {} (file {}), log {}+{}, heap {}..{}",
                    sb.pool_size, file_len, sb.log_off, sb.log_size, sb.heap_start, sb.heap_top
                ),
            });
        }

        let mut pool = Self {
            mmap,
            _file: file,
            path,
            size: sb.pool_size,
            layout: found_layout,
            log_off: sb.log_off,
            log_size: sb.log_size,
            log_records: 0,
            log_used: 0,
        };

        let rolled_back = pool.rollback_log()?;
        if rolled_back > 0 {
            warn!(
                path = %pool.path.display(),
                records = rolled_back,
                "rolled back interrupted transaction"
            );
        }

        info!(
            path = %pool.path.display(),
            size = pool.size,
            heap_used = pool.heap_used()?,
            "opened pool"
        );
        Ok(pool)
    }

    /// Open the pool at `path`, creating it if the file does not exist.
    ///
    /// Returns the pool and whether it was freshly created.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        layout: &str,
        size: u64,
        log_size: u64,
    ) -> PoolResult<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::open(path, layout)?, false))
        } else {
            Ok((Self::create(path, layout, size, log_size)?, true))
        }
    }

    /// Pool file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pool size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Layout name.
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Offset of the root object, if one has been created.
    pub fn root_offset(&self) -> PoolResult<Option<u64>> {
        let off = self.read_u64(SB_ROOT_OFF)?;
        Ok(if off == 0 { None } else { Some(off) })
    }

    /// Return the root object, allocating a zeroed one of `size` bytes the
    /// first time.
    pub fn root(&mut self, size: u64) -> PoolResult<u64> {
        if let Some(off) = self.root_offset()? {
            let existing = self.read_u64(SB_ROOT_SIZE)?;
            if existing < size {
                return Err(PoolError::InvalidOffset { offset: off, len: size });
            }
            return Ok(off);
        }

        let mut tx = self.begin();
        let off = tx.alloc(size, ROOT_TYPE_NUM)?;
        tx.write_u64(SB_ROOT_OFF, off)?;
        tx.write_u64(SB_ROOT_SIZE, size)?;
        tx.commit()?;
        debug!(offset = off, size, "created root object");
        Ok(off)
    }

    /// Start a transaction. Dropping it without `commit` rolls it back.
    pub fn begin(&mut self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Borrow `len` bytes at `off`.
    pub fn bytes(&self, off: u64, len: u64) -> PoolResult<&[u8]> {
        self.check_range(off, len)?;
        Ok(&self.mmap[off as usize..(off + len) as usize])
    }

    pub fn read_u8(&self, off: u64) -> PoolResult<u8> {
        Ok(self.bytes(off, 1)?[0])
    }

    pub fn read_u16(&self, off: u64) -> PoolResult<u16> {
        let b = self.bytes(off, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, off: u64) -> PoolResult<u32> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, off: u64) -> PoolResult<u64> {
        Ok(le_u64(self.bytes(off, 8)?))
    }

    /// Store without logging or flushing.
    ///
    /// For state that is meaningless after a restart (reference counts).
    pub fn write_volatile(&mut self, off: u64, bytes: &[u8]) -> PoolResult<()> {
        self.copy_in(off, bytes)
    }

    /// Store and persist without a transaction.
    ///
    /// Only for memory no other structure can reach yet, such as the payload
    /// of an item that is not linked into the index.
    pub fn write_persist(&mut self, off: u64, bytes: &[u8]) -> PoolResult<()> {
        self.copy_in(off, bytes)?;
        self.persist(off, bytes.len() as u64)
    }

    /// Flush a range of the mapping to the backing file.
    pub fn persist(&self, off: u64, len: u64) -> PoolResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_range(off, len)?;
        self.mmap
            .flush_range(off as usize, len as usize)
            .map_err(|e| io_error(&self.path, "Failed to persist pool range", e))
    }

    /// Header of the block holding the object at payload offset `off`.
    pub fn block_header(&self, off: u64) -> PoolResult<BlockHeader> {
        if off < BLOCK_HEADER_SIZE {
            return Err(PoolError::InvalidOffset { offset: off, len: 0 });
        }
        let block = off - BLOCK_HEADER_SIZE;
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        buf.copy_from_slice(self.bytes(block, BLOCK_HEADER_SIZE)?);
        BlockHeader::from_bytes(&buf).ok_or_else(|| PoolError::CorruptHeap {
            offset: block,
            reason: "unreadable block header".to_string(),
        })
    }

    /// Usable payload bytes of the object at `off`.
    pub fn usable_size(&self, off: u64) -> PoolResult<u64> {
        Ok(self.block_header(off)?.size - BLOCK_HEADER_SIZE)
    }

    /// Payload offsets of every allocated object with the given type number,
    /// in heap order.
    pub fn objects(&self, type_num: u16) -> PoolResult<Vec<u64>> {
        let heap_start = self.read_u64(SB_HEAP_START)?;
        let heap_top = self.read_u64(SB_HEAP_TOP)?;
        let mut found = Vec::new();
        let mut block = heap_start;
        while block < heap_top {
            let header = self.block_header(block + BLOCK_HEADER_SIZE)?;
            if block + header.size > heap_top {
                return Err(PoolError::CorruptHeap {
                    offset: block,
                    reason: format!(
                        "block of {} bytes runs past heap top {}",
                        header.size, heap_top
                    ),
                });
            }
            if header.state == BlockState::Allocated && header.type_num == type_num {
                found.push(block + BLOCK_HEADER_SIZE);
            }
            block += header.size;
        }
        Ok(found)
    }

    /// Bytes between heap start and heap top (allocated or on a free list).
    pub fn heap_used(&self) -> PoolResult<u64> {
        Ok(self.read_u64(SB_HEAP_TOP)? - self.read_u64(SB_HEAP_START)?)
    }

    /// Bytes never handed out by the bump allocator.
    pub fn heap_available(&self) -> PoolResult<u64> {
        Ok(self.size - self.read_u64(SB_HEAP_TOP)?)
    }

    /// Number of records in the undo log (nonzero only inside a transaction).
    pub fn pending_undo_records(&self) -> u64 {
        self.log_records
    }

    pub(crate) fn check_range(&self, off: u64, len: u64) -> PoolResult<()> {
        match off.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(PoolError::InvalidOffset { offset: off, len }),
        }
    }

    pub(crate) fn copy_in(&mut self, off: u64, bytes: &[u8]) -> PoolResult<()> {
        self.check_range(off, bytes.len() as u64)?;
        let start = off as usize;
        self.mmap[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn fill_zero(&mut self, off: u64, len: u64) -> PoolResult<()> {
        self.check_range(off, len)?;
        self.mmap[off as usize..(off + len) as usize].fill(0);
        Ok(())
    }

    /// Snapshot `len` bytes at `off` into the undo log.
    ///
    /// The record is persisted before the header count covers it, so a
    /// counted record is always complete.
    pub(crate) fn append_undo(&mut self, off: u64, len: u64) -> PoolResult<()> {
        let record_size = UNDO_RECORD_HEADER + align_up(len, 8);
        let capacity = self.log_size - LOG_HEADER_SIZE;
        if self.log_used + record_size > capacity {
            return Err(PoolError::LogFull { needed: self.log_used + record_size, capacity });
        }

        let snapshot = self.bytes(off, len)?.to_vec();
        let mut header = [0u8; UNDO_RECORD_HEADER as usize];
        header[0..8].copy_from_slice(&off.to_le_bytes());
        header[8..16].copy_from_slice(&len.to_le_bytes());
        header[16..20].copy_from_slice(&crc32c::crc32c(&snapshot).to_le_bytes());

        let record = self.log_off + LOG_HEADER_SIZE + self.log_used;
        self.copy_in(record, &header)?;
        self.copy_in(record + UNDO_RECORD_HEADER, &snapshot)?;
        self.persist(record, record_size)?;

        self.log_used += record_size;
        self.log_records += 1;
        self.write_log_header()
    }

    /// Empty the undo log. This is the commit point of a transaction.
    pub(crate) fn clear_log(&mut self) -> PoolResult<()> {
        self.log_records = 0;
        self.log_used = 0;
        self.write_log_header()
    }

    /// Restore every snapshot in the undo log, newest first, then empty it.
    ///
    /// Safe to repeat: a crash part-way leaves the log intact and the next
    /// attempt reapplies the same pre-images.
    pub(crate) fn rollback_log(&mut self) -> PoolResult<u64> {
        let count = self.read_u64(self.log_off)?;
        if count == 0 {
            self.log_records = 0;
            self.log_used = 0;
            return Ok(0);
        }
        let used = self.read_u64(self.log_off + 8)?;
        let start = self.log_off + LOG_HEADER_SIZE;
        let end = start + used;
        if end > self.log_off + self.log_size {
            return Err(PoolError::CorruptLog {
                offset: self.log_off,
                reason: format!(
                    "log claims {} bytes, capacity {}",
                    used,
                    self.log_size - LOG_HEADER_SIZE
                ),
            });
        }

        let mut records = Vec::with_capacity(count as usize);
        let mut cursor = start;
        for _ in 0..count {
            if cursor + UNDO_RECORD_HEADER > end {
                return Err(PoolError::CorruptLog {
                    offset: cursor,
                    reason: "record header past end of log".to_string(),
                });
            }
            let target = self.read_u64(cursor)?;
            let len = self.read_u64(cursor + 8)?;
            let checksum = self.read_u32(cursor + 16)?;
            let size = UNDO_RECORD_HEADER + align_up(len, 8);
            if cursor + size > end {
                return Err(PoolError::CorruptLog {
                    offset: cursor,
                    reason: format!("record of {} bytes past end of log", len),
                });
            }
            let computed = crc32c::crc32c(self.bytes(cursor + UNDO_RECORD_HEADER, len)?);
            if computed != checksum {
                return Err(PoolError::CorruptLog {
                    offset: cursor,
                    reason: format!(
                        "checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
                        checksum, computed
                    ),
                });
            }
            self.check_range(target, len)?;
            records.push((cursor + UNDO_RECORD_HEADER, target, len));
            cursor += size;
        }

        for &(data, target, len) in records.iter().rev() {
            let snapshot = self.bytes(data, len)?.to_vec();
            self.copy_in(target, &snapshot)?;
            self.persist(target, len)?;
        }

        self.clear_log()?;
        Ok(count)
    }

    fn write_log_header(&mut self) -> PoolResult<()> {
        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&self.log_records.to_le_bytes());
        header[8..16].copy_from_slice(&self.log_used.to_le_bytes());
        self.copy_in(self.log_off, &header)?;
        self.persist(self.log_off, LOG_HEADER_SIZE)
    }

    #[cfg(test)]
    pub(crate) fn superblock(&self) -> PoolResult<Superblock> {
        let mut fixed = [0u8; SB_FIXED_SIZE];
        fixed.copy_from_slice(self.bytes(0, SB_FIXED_SIZE as u64)?);
        Ok(Superblock::from_bytes(&fixed))
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("layout", &self.layout)
            .finish()
    }
}

fn io_error(path: &Path, what: &str, e: std::io::Error) -> PoolError {
    PoolError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("{}: {}", what, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LAYOUT: &str = "TEST_POOL";
    const SIZE: u64 = 8 * 1024 * 1024;
    const LOG: u64 = 64 * 1024;

    fn test_pool() -> (Pool, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = Pool::create(dir.path().join("pool.obj"), LAYOUT, SIZE, LOG).unwrap();
        (pool, dir)
    }

    #[test]
    fn test_create_and_reopen() {
        let (pool, dir) = test_pool();
        let sb = pool.superblock().unwrap();
        assert_eq!(sb.magic, POOL_MAGIC);
        assert_eq!(sb.pool_size, SIZE);
        assert_eq!(pool.heap_used().unwrap(), 0);
        drop(pool);

        let pool = Pool::open(dir.path().join("pool.obj"), LAYOUT).unwrap();
        assert_eq!(pool.size(), SIZE);
        assert_eq!(pool.layout(), LAYOUT);
        assert!(pool.root_offset().unwrap().is_none());
    }

    #[test]
    fn test_open_rejects_wrong_layout() {
        let (pool, dir) = test_pool();
        drop(pool);
        let result = Pool::open(dir.path().join("pool.obj"), "OTHER");
        assert!(matches!(result, Err(PoolError::LayoutMismatch { .. })));
    }

    #[test]
    fn test_open_rejects_non_pool_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0xAB; 8192]).unwrap();
        assert!(matches!(Pool::open(&path, LAYOUT), Err(PoolError::BadMagic { .. })));
    }

    #[test]
    fn test_create_rejects_tiny_pool() {
        let dir = TempDir::new().unwrap();
        let result = Pool::create(dir.path().join("p"), LAYOUT, 64 * 1024, LOG);
        assert!(matches!(result, Err(PoolError::PoolTooSmall { .. })));
    }

    #[test]
    fn test_open_or_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.obj");
        let (pool, created) = Pool::open_or_create(&path, LAYOUT, SIZE, LOG).unwrap();
        assert!(created);
        drop(pool);
        let (_pool, created) = Pool::open_or_create(&path, LAYOUT, SIZE, LOG).unwrap();
        assert!(!created);
    }

    #[test]
    fn test_root_is_stable_across_reopen() {
        let (mut pool, dir) = test_pool();
        let root = pool.root(24).unwrap();
        assert_eq!(pool.root(24).unwrap(), root);
        assert!(pool.bytes(root, 24).unwrap().iter().all(|&b| b == 0));
        drop(pool);

        let mut pool = Pool::open(dir.path().join("pool.obj"), LAYOUT).unwrap();
        assert_eq!(pool.root_offset().unwrap(), Some(root));
        assert_eq!(pool.root(24).unwrap(), root);
        assert_eq!(pool.objects(ROOT_TYPE_NUM).unwrap(), vec![root]);
    }

    #[test]
    fn test_out_of_range_reads_fail() {
        let (pool, _dir) = test_pool();
        assert!(matches!(pool.read_u64(SIZE - 4), Err(PoolError::InvalidOffset { .. })));
        assert!(matches!(pool.bytes(u64::MAX, 2), Err(PoolError::InvalidOffset { .. })));
    }

    #[test]
    fn test_write_persist_survives_reopen() {
        let (mut pool, dir) = test_pool();
        let off = {
            let mut tx = pool.begin();
            let off = tx.alloc(32, 9).unwrap();
            tx.commit().unwrap();
            off
        };
        pool.write_persist(off, b"persisted bytes").unwrap();
        drop(pool);

        let pool = Pool::open(dir.path().join("pool.obj"), LAYOUT).unwrap();
        assert_eq!(pool.bytes(off, 15).unwrap(), b"persisted bytes");
    }
}
