//! Per-table in-memory write buffer.
//!
//! ## Design Invariants
//!
//! - A memtable holds rows for exactly one table, ordered by timestamp
//!   in a skiplist whose nodes live in the shared arena ([`Cache`]).
//! - Equal timestamps are an update, never a second entry: the later
//!   row overwrites the earlier one (last writer wins).
//! - `key_first ≤ key_last` whenever the memtable is non-empty, and
//!   `num_points` counts distinct timestamps.
//! - Node handles stay valid for the lifetime of the generation they
//!   were allocated from; a frozen memtable therefore keeps a reference
//!   to its frozen generation and nothing else.
//!
//! ## Node layout
//!
//! A node is one arena region:
//!
//! ```text
//! [level u8][forward × level: (block u32, offset u32)][row_cap u32][row bytes…]
//! ```
//!
//! `row_cap` is the capacity reserved for the row body; in-place
//! overwrite is possible while the replacement row fits, otherwise a
//! replacement node is spliced in and the old region is left to die
//! with its generation.
//!
//! ## Freeze Semantics
//!
//! `freeze` consumes the memtable value and pairs it with the frozen
//! arena generation, yielding a read-only [`FrozenMemtable`]. The
//! committer iterates frozen memtables without any lock because no
//! writer can reach a frozen generation.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::trace;

use crate::cache::{Cache, CacheError, MemPool, SlotRef};
use crate::schema::{row_len_of, row_ts};

/// Maximum skiplist height.
pub const MAX_LEVEL: usize = 5;

/// Level sampling: promote with probability 1/4 per level.
const BRANCH: u32 = 4;

const NODE_LEVEL_OFFSET: u32 = 0;
const NODE_FORWARD_OFFSET: u32 = 1;
const FORWARD_ENTRY_SIZE: u32 = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// The shared arena rejected an allocation.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The row record's self-described length does not match its
    /// buffer.
    #[error("malformed row record ({0} bytes)")]
    BadRow(usize),
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// Skiplist header for one table's pending rows.
///
/// The structure itself is tiny — every node lives in the arena — so
/// freezing moves it by value.
pub struct Memtable {
    head: [SlotRef; MAX_LEVEL],
    level: usize,
    key_first: i64,
    key_last: i64,
    num_points: u32,
    rng: SmallRng,
}

impl Memtable {
    /// Creates an empty memtable. The seed only drives skiplist level
    /// sampling; deriving it from the table identity keeps rebuilds
    /// deterministic.
    pub fn new(seed: u64) -> Self {
        Self {
            head: [SlotRef::NIL; MAX_LEVEL],
            level: 1,
            key_first: 0,
            key_last: 0,
            num_points: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Smallest timestamp present. Meaningless while empty.
    pub fn key_first(&self) -> i64 {
        self.key_first
    }

    /// Largest timestamp present. Meaningless while empty.
    pub fn key_last(&self) -> i64 {
        self.key_last
    }

    /// Number of distinct timestamps.
    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    /// True when no row has been inserted.
    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }

    // --------------------------------------------------------------------------------------------
    // Node accessors
    //
    // A nil `node` stands for the virtual head, whose forward pointers
    // live in `self.head`.
    // --------------------------------------------------------------------------------------------

    fn next_of(&self, pool: &MemPool, node: SlotRef, lvl: usize) -> SlotRef {
        if node.is_nil() {
            return self.head[lvl];
        }
        let base = node.offset + NODE_FORWARD_OFFSET + FORWARD_ENTRY_SIZE * lvl as u32;
        SlotRef {
            block: pool.read_u32(node.block, base),
            offset: pool.read_u32(node.block, base + 4),
            len: 0,
        }
    }

    fn set_next(&mut self, pool: &mut MemPool, node: SlotRef, lvl: usize, target: SlotRef) {
        if node.is_nil() {
            self.head[lvl] = target;
            return;
        }
        let base = node.offset + NODE_FORWARD_OFFSET + FORWARD_ENTRY_SIZE * lvl as u32;
        pool.write_u32(node.block, base, target.block);
        pool.write_u32(node.block, base + 4, target.offset);
    }

    fn node_level(pool: &MemPool, node: SlotRef) -> usize {
        pool.read_u8(node.block, node.offset + NODE_LEVEL_OFFSET) as usize
    }

    fn row_region(pool: &MemPool, node: SlotRef) -> (u32, u32) {
        let level = Self::node_level(pool, node) as u32;
        let cap_off = node.offset + NODE_FORWARD_OFFSET + FORWARD_ENTRY_SIZE * level;
        let cap = pool.read_u32(node.block, cap_off);
        (cap_off + 4, cap)
    }

    fn node_row<'p>(pool: &'p MemPool, node: SlotRef) -> &'p [u8] {
        let (row_off, cap) = Self::row_region(pool, node);
        let region = pool.slice(SlotRef {
            block: node.block,
            offset: row_off,
            len: cap,
        });
        let len = row_len_of(region).unwrap_or(0).min(region.len());
        &region[..len]
    }

    fn node_ts(pool: &MemPool, node: SlotRef) -> i64 {
        row_ts(Self::node_row(pool, node))
    }

    fn sample_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.random_range(0..BRANCH) == 0 {
            level += 1;
        }
        level
    }

    // --------------------------------------------------------------------------------------------
    // Operations
    // --------------------------------------------------------------------------------------------

    /// Inserts a row record, overwriting in place when its timestamp is
    /// already present.
    ///
    /// The caller has validated the record against the table schema;
    /// only the self-described length is re-checked here.
    pub fn insert(&mut self, cache: &mut Cache, row: &[u8]) -> Result<(), MemtableError> {
        if row_len_of(row) != Some(row.len()) {
            return Err(MemtableError::BadRow(row.len()));
        }
        let ts = row_ts(row);

        // Collect the rightmost node before `ts` on every level.
        let mut update = [SlotRef::NIL; MAX_LEVEL];
        let mut cur = SlotRef::NIL;
        for lvl in (0..self.level).rev() {
            loop {
                let next = self.next_of(cache.mem(), cur, lvl);
                if next.is_nil() || Self::node_ts(cache.mem(), next) >= ts {
                    break;
                }
                cur = next;
            }
            update[lvl] = cur;
        }

        let found = self.next_of(cache.mem(), update[0], 0);
        if !found.is_nil() && Self::node_ts(cache.mem(), found) == ts {
            self.overwrite(cache, &update, found, row)?;
        } else {
            self.splice_new(cache, &mut update, row, ts)?;
        }
        Ok(())
    }

    fn overwrite(
        &mut self,
        cache: &mut Cache,
        update: &[SlotRef; MAX_LEVEL],
        node: SlotRef,
        row: &[u8],
    ) -> Result<(), MemtableError> {
        let (row_off, cap) = Self::row_region(cache.mem(), node);
        if row.len() as u32 <= cap {
            let region = cache.mem_mut().slice_mut(SlotRef {
                block: node.block,
                offset: row_off,
                len: row.len() as u32,
            });
            region.copy_from_slice(row);
            trace!(ts = row_ts(row), "overwrote row in place");
            return Ok(());
        }

        // Replacement row grew past the node's capacity: splice in a
        // fresh node of the same height and let the old region die with
        // the generation.
        let level = Self::node_level(cache.mem(), node);
        let fresh = self.alloc_node(cache, level, row)?;
        for lvl in 0..level {
            let succ = self.next_of(cache.mem(), node, lvl);
            self.set_next(cache.mem_mut(), fresh, lvl, succ);
            self.set_next(cache.mem_mut(), update[lvl], lvl, fresh);
        }
        trace!(ts = row_ts(row), "replaced row with larger node");
        Ok(())
    }

    fn splice_new(
        &mut self,
        cache: &mut Cache,
        update: &mut [SlotRef; MAX_LEVEL],
        row: &[u8],
        ts: i64,
    ) -> Result<(), MemtableError> {
        let level = self.sample_level();
        if level > self.level {
            for slot in update.iter_mut().take(level).skip(self.level) {
                *slot = SlotRef::NIL;
            }
            self.level = level;
        }

        let node = self.alloc_node(cache, level, row)?;
        for lvl in 0..level {
            let succ = self.next_of(cache.mem(), update[lvl], lvl);
            self.set_next(cache.mem_mut(), node, lvl, succ);
            self.set_next(cache.mem_mut(), update[lvl], lvl, node);
        }

        if self.num_points == 0 {
            self.key_first = ts;
            self.key_last = ts;
        } else {
            self.key_first = self.key_first.min(ts);
            self.key_last = self.key_last.max(ts);
        }
        self.num_points += 1;
        Ok(())
    }

    fn alloc_node(
        &mut self,
        cache: &mut Cache,
        level: usize,
        row: &[u8],
    ) -> Result<SlotRef, MemtableError> {
        let size =
            NODE_FORWARD_OFFSET as usize + FORWARD_ENTRY_SIZE as usize * level + 4 + row.len();
        let node = cache.alloc(size)?;

        let header = cache.mem_mut().slice_mut(node);
        header[NODE_LEVEL_OFFSET as usize] = level as u8;
        let cap_at = NODE_FORWARD_OFFSET as usize + FORWARD_ENTRY_SIZE as usize * level;
        header[cap_at..cap_at + 4].copy_from_slice(&(row.len() as u32).to_le_bytes());
        header[cap_at + 4..].copy_from_slice(row);
        Ok(node)
    }

    /// Forward cursor over the rows, in timestamp order.
    pub fn iter<'p>(&'p self, pool: &'p MemPool) -> MemtableIter<'p> {
        MemtableIter {
            memtable: self,
            pool,
            cur: self.head[0],
        }
    }

    /// Consumes the memtable into its frozen, read-only form bound to
    /// the given frozen generation.
    pub fn freeze(self, pool: Arc<MemPool>) -> FrozenMemtable {
        FrozenMemtable { inner: self, pool }
    }
}

// ------------------------------------------------------------------------------------------------
// Iteration
// ------------------------------------------------------------------------------------------------

/// Forward-only ordered cursor over a memtable.
pub struct MemtableIter<'p> {
    memtable: &'p Memtable,
    pool: &'p MemPool,
    cur: SlotRef,
}

impl<'p> MemtableIter<'p> {
    /// Row under the cursor, if any.
    pub fn get(&self) -> Option<&'p [u8]> {
        if self.cur.is_nil() {
            None
        } else {
            Some(Memtable::node_row(self.pool, self.cur))
        }
    }

    /// Timestamp under the cursor, if any.
    pub fn peek_ts(&self) -> Option<i64> {
        self.get().map(row_ts)
    }

    /// Advances the cursor; returns whether a row remains.
    pub fn advance(&mut self) -> bool {
        if self.cur.is_nil() {
            return false;
        }
        self.cur = self.memtable.next_of(self.pool, self.cur, 0);
        !self.cur.is_nil()
    }
}

impl<'p> Iterator for MemtableIter<'p> {
    type Item = &'p [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.get()?;
        self.advance();
        Some(row)
    }
}

// ------------------------------------------------------------------------------------------------
// Frozen Memtable
// ------------------------------------------------------------------------------------------------

/// A read-only memtable bound to the frozen arena generation it was
/// built from.
///
/// The committer reads frozen memtables without holding the repository
/// mutex; soundness follows from the generation being immutable.
pub struct FrozenMemtable {
    inner: Memtable,
    pool: Arc<MemPool>,
}

impl FrozenMemtable {
    /// Smallest timestamp present.
    pub fn key_first(&self) -> i64 {
        self.inner.key_first()
    }

    /// Largest timestamp present.
    pub fn key_last(&self) -> i64 {
        self.inner.key_last()
    }

    /// Number of distinct timestamps.
    pub fn num_points(&self) -> u32 {
        self.inner.num_points()
    }

    /// True when the frozen memtable holds no rows.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Forward cursor over the frozen rows.
    pub fn iter(&self) -> MemtableIter<'_> {
        self.inner.iter(&self.pool)
    }
}
