//! Shared memory arena backing every per-table memtable.
//!
//! ## Design Invariants
//!
//! - All skiplist nodes and row bodies live inside arena buffers; a
//!   [`SlotRef`] names a contiguous region and stays valid for the
//!   lifetime of its generation.
//! - At any instant there are at most two generations: the active one
//!   (`mem`, accepts allocations) and one frozen one (`imem`,
//!   immutable, owned by the in-flight commit).
//! - Freezing is O(1): the active [`MemPool`] is moved behind an `Arc`
//!   and a fresh empty pool becomes active.
//! - Reclaiming returns buffers to a warm free pool rather than to the
//!   OS, so capacity built up under load is kept.
//! - Total buffer bytes across active, frozen, and free pool never
//!   exceed the configured cap; allocation beyond it fails with
//!   [`CacheError::CacheFull`].
//!
//! ## Concurrency
//!
//! `Cache` itself is not synchronized; the repository serializes
//! `alloc`/`freeze`/`reclaim` under its mutex. A frozen `Arc<MemPool>`
//! may be read without any lock because nothing mutates a frozen
//! generation.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Size of one arena buffer.
pub const CACHE_BLOCK_SIZE: usize = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by arena operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The configured cap is exhausted; a commit must drain the frozen
    /// generation before further writes.
    #[error("cache full")]
    CacheFull,

    /// A single allocation cannot span buffers.
    #[error("allocation of {0} bytes exceeds cache block size")]
    AllocTooLarge(usize),

    /// `freeze` was called while a frozen generation already exists.
    #[error("a frozen generation already exists")]
    FrozenExists,
}

// ------------------------------------------------------------------------------------------------
// SlotRef
// ------------------------------------------------------------------------------------------------

/// Handle to a contiguous region inside one generation of the arena.
///
/// `block` indexes the generation's buffer list; `offset`/`len` locate
/// the region inside that buffer. The all-ones `block` is the nil
/// sentinel used for skiplist link termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    /// Buffer index within the generation.
    pub block: u32,
    /// Byte offset within the buffer.
    pub offset: u32,
    /// Region length in bytes.
    pub len: u32,
}

impl SlotRef {
    /// The nil handle.
    pub const NIL: SlotRef = SlotRef {
        block: u32::MAX,
        offset: 0,
        len: 0,
    };

    /// Whether this is the nil handle.
    pub fn is_nil(self) -> bool {
        self.block == u32::MAX
    }
}

// ------------------------------------------------------------------------------------------------
// MemPool — one generation
// ------------------------------------------------------------------------------------------------

struct PoolBlock {
    data: Box<[u8]>,
    used: usize,
}

/// One arena generation: a list of fixed-capacity buffers filled by
/// bump allocation.
///
/// A pool is mutated only while it is the active generation; once
/// frozen it is shared read-only behind an `Arc`.
pub struct MemPool {
    blocks: Vec<PoolBlock>,
    bytes_used: usize,
}

impl MemPool {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            bytes_used: 0,
        }
    }

    /// Bytes handed out from this generation.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Number of buffers in this generation.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Read-only view of the region named by `slot`.
    pub fn slice(&self, slot: SlotRef) -> &[u8] {
        let block = &self.blocks[slot.block as usize];
        &block.data[slot.offset as usize..(slot.offset + slot.len) as usize]
    }

    /// Mutable view of the region named by `slot`.
    pub fn slice_mut(&mut self, slot: SlotRef) -> &mut [u8] {
        let block = &mut self.blocks[slot.block as usize];
        &mut block.data[slot.offset as usize..(slot.offset + slot.len) as usize]
    }

    /// Read the byte at `(block, offset)`.
    pub fn read_u8(&self, block: u32, offset: u32) -> u8 {
        self.blocks[block as usize].data[offset as usize]
    }

    /// Read an LE `u32` at `(block, offset)`.
    pub fn read_u32(&self, block: u32, offset: u32) -> u32 {
        let data = &self.blocks[block as usize].data;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&data[offset as usize..offset as usize + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Write an LE `u32` at `(block, offset)`.
    pub fn write_u32(&mut self, block: u32, offset: u32, value: u32) {
        let data = &mut self.blocks[block as usize].data;
        data[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Bump-allocate `len` bytes, drawing a buffer from `spare` when the
    /// current one is full. Returns `None` when a new buffer is needed
    /// but `spare` is empty.
    fn alloc(&mut self, len: usize, spare: &mut Vec<Box<[u8]>>) -> Option<SlotRef> {
        let need_new = match self.blocks.last() {
            Some(block) => block.used + len > block.data.len(),
            None => true,
        };

        if need_new {
            let data = spare.pop()?;
            self.blocks.push(PoolBlock { data, used: 0 });
        }

        let block_idx = self.blocks.len() - 1;
        let block = &mut self.blocks[block_idx];
        let offset = block.used;
        block.used += len;
        self.bytes_used += len;

        Some(SlotRef {
            block: block_idx as u32,
            offset: offset as u32,
            len: len as u32,
        })
    }

    /// Tear the generation down into its raw buffers.
    fn into_buffers(self) -> Vec<Box<[u8]>> {
        self.blocks.into_iter().map(|b| b.data).collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Cache — generation manager
// ------------------------------------------------------------------------------------------------

/// The process-wide arena: active generation, at most one frozen
/// generation, and the warm free-buffer pool.
pub struct Cache {
    mem: MemPool,
    imem: Option<Arc<MemPool>>,
    free_buffers: Vec<Box<[u8]>>,
    /// Total buffer bytes currently owned (active + frozen + free).
    bytes_held: usize,
    max_bytes: usize,
}

impl Cache {
    /// Creates an empty cache capped at `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            mem: MemPool::new(),
            imem: None,
            free_buffers: Vec::new(),
            bytes_held: 0,
            max_bytes,
        }
    }

    /// Updates the cap. An already-over-cap cache keeps its buffers;
    /// only new buffer acquisition is affected.
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Active generation, read-only.
    pub fn mem(&self) -> &MemPool {
        &self.mem
    }

    /// Active generation, mutable.
    pub fn mem_mut(&mut self) -> &mut MemPool {
        &mut self.mem
    }

    /// The frozen generation, if a commit is pending or in flight.
    pub fn imem(&self) -> Option<&Arc<MemPool>> {
        self.imem.as_ref()
    }

    /// Total buffer bytes currently owned.
    pub fn bytes_held(&self) -> usize {
        self.bytes_held
    }

    /// Allocates `len` bytes in the active generation and returns the
    /// handle of the (uninitialised, zeroed) region.
    pub fn alloc(&mut self, len: usize) -> Result<SlotRef, CacheError> {
        if len > CACHE_BLOCK_SIZE {
            return Err(CacheError::AllocTooLarge(len));
        }

        // Make sure a spare buffer is on hand before asking the pool,
        // respecting the cap.
        if self.free_buffers.is_empty() {
            let full = match self.mem.blocks.last() {
                Some(block) => block.used + len > block.data.len(),
                None => true,
            };
            if full {
                if self.bytes_held + CACHE_BLOCK_SIZE > self.max_bytes {
                    warn!(
                        bytes_held = self.bytes_held,
                        max_bytes = self.max_bytes,
                        "arena cap reached"
                    );
                    return Err(CacheError::CacheFull);
                }
                self.free_buffers
                    .push(vec![0u8; CACHE_BLOCK_SIZE].into_boxed_slice());
                self.bytes_held += CACHE_BLOCK_SIZE;
                debug!(total = self.bytes_held, "grew arena by one buffer");
            }
        }

        match self.mem.alloc(len, &mut self.free_buffers) {
            Some(slot) => {
                trace!(?slot, "arena alloc");
                Ok(slot)
            }
            // Unreachable in practice: a spare was staged above.
            None => Err(CacheError::CacheFull),
        }
    }

    /// Allocates and fills a region with `bytes`.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<SlotRef, CacheError> {
        let slot = self.alloc(bytes.len())?;
        self.mem.slice_mut(slot).copy_from_slice(bytes);
        Ok(slot)
    }

    /// Seals the active generation and starts a fresh one.
    ///
    /// Fails with [`CacheError::FrozenExists`] while a prior frozen
    /// generation has not been reclaimed; the caller must finish (or
    /// retry) the outstanding commit first.
    pub fn freeze(&mut self) -> Result<Arc<MemPool>, CacheError> {
        if self.imem.is_some() {
            return Err(CacheError::FrozenExists);
        }

        let frozen = Arc::new(std::mem::replace(&mut self.mem, MemPool::new()));
        self.imem = Some(Arc::clone(&frozen));
        debug!(
            frozen_bytes = frozen.bytes_used(),
            frozen_blocks = frozen.num_blocks(),
            "froze active generation"
        );
        Ok(frozen)
    }

    /// Discards the frozen generation, returning its buffers to the
    /// free pool when no outside reference remains.
    pub fn reclaim(&mut self) {
        let Some(frozen) = self.imem.take() else {
            return;
        };

        match Arc::try_unwrap(frozen) {
            Ok(pool) => {
                let buffers = pool.into_buffers();
                debug!(buffers = buffers.len(), "reclaimed frozen generation");
                self.free_buffers.extend(buffers);
            }
            Err(still_shared) => {
                // A late reader still holds the generation; give the
                // bytes back to the OS instead of the warm pool.
                self.bytes_held -= still_shared.num_blocks() * CACHE_BLOCK_SIZE;
                warn!("frozen generation still referenced at reclaim; dropping");
            }
        }
    }
}
