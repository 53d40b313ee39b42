//! Undo-logged pool transactions
//!
//! Every byte range a transaction is about to modify is snapshotted into the
//! pool's undo log first. Commit persists the modified ranges and then
//! empties the log; an empty log is the commit point. Anything short of that
//! (explicit abort, drop, crash) restores the snapshots.
//!
//! Memory allocated inside the transaction is exempt from logging: if the
//! transaction rolls back, the allocation itself is undone and the block's
//! contents are unreachable. Frees are deferred to commit so a rolled-back
//! transaction never leaves a block it still referenced on a free list.

use std::ops::Deref;

use tracing::{trace, warn};

use super::layout::{
    free_head_offset, size_class, BlockHeader, BlockState, BLOCK_HEADER_SIZE, SB_HEAP_TOP,
};
use super::Pool;
use crate::error::{PoolError, PoolResult};

/// An open transaction over a [`Pool`].
///
/// Reads go through `Deref<Target = Pool>`; writes must go through the
/// transaction so they are logged.
pub struct Transaction<'a> {
    pool: &'a mut Pool,
    /// Ranges already snapshotted in this transaction
    logged: Vec<(u64, u64)>,
    /// Blocks allocated in this transaction (start, end)
    fresh: Vec<(u64, u64)>,
    /// Ranges written and not yet persisted
    dirty: Vec<(u64, u64)>,
    /// Payload offsets to release on commit
    pending_frees: Vec<u64>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(pool: &'a mut Pool) -> Self {
        Self {
            pool,
            logged: Vec::new(),
            fresh: Vec::new(),
            dirty: Vec::new(),
            pending_frees: Vec::new(),
            finished: false,
        }
    }

    /// Snapshot `[off, off + len)` so the transaction may modify it.
    pub fn add_range(&mut self, off: u64, len: u64) -> PoolResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.pool.check_range(off, len)?;
        let end = off + len;
        let covered = |ranges: &[(u64, u64)]| ranges.iter().any(|&(s, e)| s <= off && end <= e);
        if covered(&self.fresh) || covered(&self.logged) {
            return Ok(());
        }
        self.pool.append_undo(off, len)?;
        self.logged.push((off, end));
        Ok(())
    }

    /// Logged write of `bytes` at `off`.
    pub fn write(&mut self, off: u64, bytes: &[u8]) -> PoolResult<()> {
        self.add_range(off, bytes.len() as u64)?;
        self.pool.copy_in(off, bytes)?;
        self.mark_dirty(off, bytes.len() as u64);
        Ok(())
    }

    pub fn write_u8(&mut self, off: u64, value: u8) -> PoolResult<()> {
        self.write(off, &[value])
    }

    pub fn write_u16(&mut self, off: u64, value: u16) -> PoolResult<()> {
        self.write(off, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, off: u64, value: u32) -> PoolResult<()> {
        self.write(off, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, off: u64, value: u64) -> PoolResult<()> {
        self.write(off, &value.to_le_bytes())
    }

    /// Allocate a zeroed object of at least `size` bytes tagged `type_num`.
    ///
    /// Returns the payload offset. Writes into the new object need no
    /// snapshot for the rest of this transaction.
    pub fn alloc(&mut self, size: u64, type_num: u16) -> PoolResult<u64> {
        let total = size.checked_add(BLOCK_HEADER_SIZE).ok_or(PoolError::OutOfSpace {
            requested: size,
            available: 0,
        })?;
        let (class, block_size) = size_class(total).ok_or(PoolError::OutOfSpace {
            requested: total,
            available: 0,
        })?;

        let head_off = free_head_offset(class);
        let head = self.pool.read_u64(head_off)?;

        let block = if head != 0 {
            let header = self.pool.block_header(head + BLOCK_HEADER_SIZE)?;
            if header.state != BlockState::Free || header.size != block_size {
                return Err(PoolError::CorruptHeap {
                    offset: head,
                    reason: format!(
                        "free list {} holds {:?} block of {} bytes",
                        class, header.state, header.size
                    ),
                });
            }
            let next = self.pool.read_u64(head + BLOCK_HEADER_SIZE)?;
            // Header and the free-list link are the only parts of a free
            // block anyone can observe after a rollback.
            self.add_range(head, BLOCK_HEADER_SIZE + 8)?;
            self.write_u64(head_off, next)?;
            self.write(head, &BlockHeader::allocated(block_size, type_num).to_bytes())?;
            self.fresh.push((head + BLOCK_HEADER_SIZE, head + block_size));
            head
        } else {
            let top = self.pool.read_u64(SB_HEAP_TOP)?;
            let available = self.pool.size().saturating_sub(top);
            if block_size > available {
                return Err(PoolError::OutOfSpace { requested: block_size, available });
            }
            self.write_u64(SB_HEAP_TOP, top + block_size)?;
            self.fresh.push((top, top + block_size));
            self.write(top, &BlockHeader::allocated(block_size, type_num).to_bytes())?;
            top
        };

        let payload = block + BLOCK_HEADER_SIZE;
        let payload_len = block_size - BLOCK_HEADER_SIZE;
        self.pool.fill_zero(payload, payload_len)?;
        self.mark_dirty(payload, payload_len);

        trace!(offset = payload, block_size, type_num, "tx alloc");
        Ok(payload)
    }

    /// Release the object at payload offset `off` when the transaction commits.
    pub fn free(&mut self, off: u64) -> PoolResult<()> {
        let header = self.pool.block_header(off)?;
        if header.state != BlockState::Allocated || self.pending_frees.contains(&off) {
            return Err(PoolError::InvalidOffset { offset: off, len: header.size });
        }
        self.pending_frees.push(off);
        Ok(())
    }

    /// Persist every change and make the transaction durable.
    pub fn commit(mut self) -> PoolResult<()> {
        let frees = std::mem::take(&mut self.pending_frees);
        for off in frees {
            self.release_block(off)?;
        }

        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(dirty.len());
        for (start, end) in dirty {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        for &(start, end) in &merged {
            self.pool.persist(start, end - start)?;
        }

        self.pool.clear_log()?;
        self.finished = true;
        trace!(ranges = merged.len(), "tx commit");
        Ok(())
    }

    /// Undo every change made by the transaction.
    pub fn abort(mut self) -> PoolResult<()> {
        self.finished = true;
        self.pool.rollback_log().map(|_| ())
    }

    fn release_block(&mut self, off: u64) -> PoolResult<()> {
        let block = off - BLOCK_HEADER_SIZE;
        let header = self.pool.block_header(off)?;
        let (class, _) = size_class(header.size).ok_or(PoolError::CorruptHeap {
            offset: block,
            reason: format!("block size {} has no size class", header.size),
        })?;
        let head_off = free_head_offset(class);
        let head = self.pool.read_u64(head_off)?;

        self.write(block, &BlockHeader::free(header.size).to_bytes())?;
        self.write_u64(off, head)?;
        self.write_u64(head_off, block)?;
        trace!(offset = off, block_size = header.size, "tx free");
        Ok(())
    }

    fn mark_dirty(&mut self, off: u64, len: u64) {
        if len > 0 {
            self.dirty.push((off, off + len));
        }
    }
}

impl Deref for Transaction<'_> {
    type Target = Pool;

    fn deref(&self) -> &Pool {
        self.pool
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.pool.rollback_log() {
            // The log is left in place; the next open retries the rollback.
            warn!(error = %e, "transaction rollback failed");
        }
    }
}
