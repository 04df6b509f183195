//! The commit pipeline: durable promotion of a frozen generation into
//! the time-partitioned file groups.
//!
//! ## Phases
//!
//! 1. **Plan** — compute the partition range `[sfid, efid]` covered by
//!    the frozen rows and open one cursor per table.
//! 2. **Partition loop** — for each partition with new rows, rewrite
//!    the group: stage a replacement `.head` (and `.last` when the old
//!    one is oversized), walk tables in `tid` order deciding append /
//!    sub-block append / merge per table, carry untouched tables
//!    forward, then fsync and rename (`.last` before `.head`).
//! 3. **Publish** — performed by the caller under the repository mutex
//!    once `run` returns successfully.
//!
//! ## Merge rules
//!
//! Within one partition and table, each cursor chunk selects a merge
//! set: the suffix of existing super blocks starting at the first one
//! whose `key_last` reaches the chunk, with the tail block always
//! included when present. The merge set's rows and the chunk are
//! merged by timestamp — the chunk (newer) wins ties — and rewritten
//! as full `.data` blocks plus at most one under-full `.last` residue.
//! The one exception is the sub-block fast path: rows strictly above a
//! small tail that stay jointly under `min_rows_per_file_block` are
//! appended to `.last` as an extra sub-block instead of rewriting it.
//!
//! ## Failure behavior
//!
//! Any error aborts the run before the partition's renames, so the old
//! files stay authoritative; staged `.t` files are discarded here and,
//! after a crash, on the next open. The frozen generation is retained
//! by the caller for retry.


use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::TsdbConfig;
use crate::fgroup::dir::FileDir;
use crate::fgroup::writer::{copy_block_data, write_block, HeadWriter, InfoBuilder, InfoSummary};
use crate::fgroup::{
    load_info_from, map_file, open_for_append, BlockMeta, FileError, FileGroup, IdxEntry,
    InfoRegion, MAX_LAST_FILE_SIZE, MAX_SUB_BLOCKS,
};
use crate::memtable::{FrozenMemtable, MemtableIter};
use crate::schema::{row_ts, ColumnBatch, Schema, SchemaError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the commit pipeline.
#[derive(Debug, Error)]
pub enum CommitError {
    /// File group I/O or corruption.
    #[error("file group error: {0}")]
    File(#[from] FileError),

    /// Row / column conversion failure.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk blocks were written under an incompatible schema
    /// version; merging across versions is not supported.
    #[error("schema version mismatch for table {tid}")]
    SchemaMismatch {
        /// Affected table.
        tid: i32,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Inputs and outputs
// ------------------------------------------------------------------------------------------------

/// One table's share of a commit, captured under the repository mutex
/// at freeze time. Dropping or altering the table afterwards does not
/// affect the in-flight commit.
pub struct CommitTable {
    /// Dense table id.
    pub tid: i32,
    /// Table uid at freeze time.
    pub uid: u64,
    /// Schema at freeze time.
    pub schema: Arc<Schema>,
    /// The frozen rows.
    pub frozen: Arc<FrozenMemtable>,
}

/// A full commit request.
pub struct CommitReq {
    /// Repository configuration at freeze time.
    pub cfg: TsdbConfig,
    /// Data directory holding the file groups.
    pub data_dir: PathBuf,
    /// Tables with a frozen memtable, ascending by `tid`.
    pub tables: Vec<CommitTable>,
}

/// Counters reported by a finished commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    /// Partitions rewritten.
    pub partitions: usize,
    /// Blocks written (data, last, and coalesced copies).
    pub blocks: usize,
    /// Frozen rows committed.
    pub rows: u64,
}

// ------------------------------------------------------------------------------------------------
// Entry point
// ------------------------------------------------------------------------------------------------

/// Executes phases 1 and 2 of a commit.
///
/// Takes the file directory mutex only to look up or register groups;
/// all file I/O happens without any lock. Returns the stats on success
/// so the caller can publish (phase 3) under the repository mutex.
pub fn run(req: &CommitReq, fdir: &Mutex<FileDir>) -> Result<CommitStats, CommitError> {
    let mut stats = CommitStats::default();

    // Phase 1 — plan.
    let live: Vec<&CommitTable> = req.tables.iter().filter(|t| !t.frozen.is_empty()).collect();
    if live.is_empty() {
        debug!("commit: frozen state empty, nothing to do");
        return Ok(stats);
    }

    let sfid = live
        .iter()
        .map(|t| req.cfg.fid_of(t.frozen.key_first()))
        .min()
        .ok_or_else(|| CommitError::Internal("empty plan".into()))?;
    let efid = live
        .iter()
        .map(|t| req.cfg.fid_of(t.frozen.key_last()))
        .max()
        .ok_or_else(|| CommitError::Internal("empty plan".into()))?;

    let mut cursors: Vec<MemtableIter<'_>> = live.iter().map(|t| t.frozen.iter()).collect();

    info!(
        sfid,
        efid,
        tables = live.len(),
        "commit: starting partition loop"
    );

    // Phase 2 — partition loop.
    for fid in sfid..=efid {
        let window = req.cfg.fid_window(fid);

        let has_rows = cursors
            .iter()
            .any(|c| c.peek_ts().is_some_and(|ts| ts >= window.0 && ts <= window.1));
        if !has_rows {
            continue;
        }

        commit_partition(req, fdir, fid, window, &live, &mut cursors, &mut stats)?;
        stats.partitions += 1;
    }

    info!(
        partitions = stats.partitions,
        blocks = stats.blocks,
        rows = stats.rows,
        "commit: partition loop finished"
    );
    Ok(stats)
}

// ------------------------------------------------------------------------------------------------
// Partition rewrite
// ------------------------------------------------------------------------------------------------

/// Working representation of one super block while a table's entry is
/// being rebuilt.
struct WorkingSuper {
    meta: BlockMeta,
    /// Physical sub-blocks; empty for a plain block.
    subs: Vec<BlockMeta>,
    /// Row cache for tails written during this partition (their bytes
    /// may live in a staged file that loaders cannot see yet).
    rows: Option<Vec<Vec<u8>>>,
}

#[allow(clippy::too_many_arguments)]
fn commit_partition(
    req: &CommitReq,
    fdir: &Mutex<FileDir>,
    fid: i64,
    window: (i64, i64),
    live: &[&CommitTable],
    cursors: &mut [MemtableIter<'_>],
    stats: &mut CommitStats,
) -> Result<(), CommitError> {
    let cfg = &req.cfg;

    // Look up or create the group under the directory lock, then work
    // on plain paths without it.
    let group: FileGroup = {
        let mut dir = fdir
            .lock()
            .map_err(|_| CommitError::Internal("file directory mutex poisoned".into()))?;
        dir.ensure(fid, cfg.max_tables)?.clone()
    };

    let result = rewrite_group(req, &group, window, live, cursors, stats);
    if result.is_err() {
        // Leave the old files authoritative; staged output is garbage.
        let _ = fs::remove_file(group.head_tmp_path());
        let _ = fs::remove_file(group.last_tmp_path());
    }
    result
}

fn rewrite_group(
    req: &CommitReq,
    group: &FileGroup,
    window: (i64, i64),
    live: &[&CommitTable],
    cursors: &mut [MemtableIter<'_>],
    stats: &mut CommitStats,
) -> Result<(), CommitError> {
    let cfg = &req.cfg;
    let old_idx = group.load_idx(cfg.max_tables)?;
    let old_head = map_file(&group.head_path())?;
    let old_last = map_file(&group.last_path())?;

    let rewrite_last = fs::metadata(group.last_path())?.len() > MAX_LAST_FILE_SIZE;
    if rewrite_last {
        debug!(fid = group.fid, "compacting oversized last file");
    }

    let mut data_file = open_for_append(&group.data_path())?;
    let mut last_file = if rewrite_last {
        crate::fgroup::create_file(&group.last_tmp_path())?
    } else {
        open_for_append(&group.last_path())?
    };
    let mut head = HeadWriter::create(&group.head_tmp_path(), cfg.max_tables)?;
    let mut new_idx = vec![IdxEntry::default(); cfg.max_tables as usize];

    let mut live_at = 0usize;
    for tid in 0..cfg.max_tables {
        // Advance to this table's cursor, if it is part of the commit.
        let table_slot = loop {
            match live.get(live_at) {
                Some(t) if t.tid < tid => live_at += 1,
                Some(t) if t.tid == tid => break Some(live_at),
                _ => break None,
            }
        };

        let old_entry = old_idx[tid as usize];
        let has_rows = table_slot.is_some_and(|slot| {
            cursors[slot]
                .peek_ts()
                .is_some_and(|ts| ts >= window.0 && ts <= window.1)
        });

        let entry = if has_rows {
            let slot = table_slot.ok_or_else(|| CommitError::Internal("lost cursor".into()))?;
            commit_table_rows(
                cfg,
                group,
                &old_head,
                &old_last,
                rewrite_last,
                &mut data_file,
                &mut last_file,
                &mut head,
                live[slot],
                &mut cursors[slot],
                old_entry,
                window.1,
                stats,
            )?
        } else {
            carry_forward(
                &old_head,
                &old_last,
                rewrite_last,
                &mut last_file,
                &mut head,
                old_entry,
                stats,
            )?
        };
        new_idx[tid as usize] = entry;
    }

    // Make everything durable, then flip the group over. `.last` is
    // renamed before `.head` so a crash in between leaves the old head
    // still pointing at files it understands.
    data_file.sync_all()?;
    last_file.sync_all()?;
    head.finish(&new_idx)?;

    if rewrite_last {
        fs::rename(group.last_tmp_path(), group.last_path())?;
    }
    fs::rename(group.head_tmp_path(), group.head_path())?;
    sync_dir(&req.data_dir)?;

    trace!(fid = group.fid, "partition rewrite complete");
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<(), CommitError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Per-table paths
// ------------------------------------------------------------------------------------------------

/// Carries a table with no new rows into the replacement head.
#[allow(clippy::too_many_arguments)]
fn carry_forward(
    old_head: &Mmap,
    old_last: &Mmap,
    rewrite_last: bool,
    last_file: &mut File,
    head: &mut HeadWriter,
    old_entry: IdxEntry,
    stats: &mut CommitStats,
) -> Result<IdxEntry, CommitError> {
    if !old_entry.is_present() {
        return Ok(IdxEntry::default());
    }

    if !rewrite_last {
        // Byte-wise copy of the info region; the idx entry only moves.
        let start = old_entry.offset as usize;
        let end = start + old_entry.len as usize;
        if end > old_head.len() {
            return Err(FileError::Corrupt(format!(
                "info region [{start}, {end}) escapes head file of {} bytes",
                old_head.len()
            ))
            .into());
        }
        let offset = head.append_info(&old_head[start..end])?;
        return Ok(IdxEntry { offset, ..old_entry });
    }

    // The tail file is being rewritten: tails move, so the info region
    // must be rebuilt with fresh offsets and checksum.
    let info = load_info_from(old_head, &old_entry)?;
    let mut builder = InfoBuilder::new(info.uid);
    for sup in &info.supers {
        if sup.last == 1 {
            let merged = copy_block_data(last_file, old_last, &info, sup)?;
            stats.blocks += 1;
            builder.push(merged);
        } else if sup.has_sub_blocks() {
            builder.push_with_subs(info.physical_blocks(sup)?)?;
        } else {
            builder.push(*sup);
        }
    }
    finish_info(head, builder)
}

/// Commits one table's in-window rows, merging with existing blocks as
/// required, and returns the table's new idx entry.
#[allow(clippy::too_many_arguments)]
fn commit_table_rows(
    cfg: &TsdbConfig,
    group: &FileGroup,
    old_head: &Mmap,
    old_last: &Mmap,
    rewrite_last: bool,
    data_file: &mut File,
    last_file: &mut File,
    head: &mut HeadWriter,
    table: &CommitTable,
    cursor: &mut MemtableIter<'_>,
    old_entry: IdxEntry,
    max_key: i64,
    stats: &mut CommitStats,
) -> Result<IdxEntry, CommitError> {
    let schema = &table.schema;
    let min_rows = cfg.min_rows_per_file_block as usize;
    let max_rows = cfg.max_rows_per_file_block as usize;
    let chunk_cap = (max_rows * 4 / 5).max(1);

    // Materialise the existing super blocks.
    let mut old_info: Option<InfoRegion> = None;
    let mut working: Vec<WorkingSuper> = Vec::new();
    if old_entry.is_present() {
        let info = load_info_from(old_head, &old_entry)?;
        if info.uid == table.uid {
            for sup in &info.supers {
                let phys = info.physical_blocks(sup)?;
                working.push(WorkingSuper {
                    meta: *sup,
                    subs: if phys.len() > 1 { phys } else { Vec::new() },
                    rows: None,
                });
            }
            old_info = Some(info);
        } else {
            // The slot was dropped and re-created; the old uid's data
            // is no longer reachable through this table.
            warn!(
                tid = table.tid,
                old_uid = info.uid,
                uid = table.uid,
                "discarding blocks of a re-created table"
            );
        }
    }

    loop {
        let chunk = read_chunk(cursor, max_key, chunk_cap);
        if chunk.is_empty() {
            break;
        }
        let chunk_first = row_ts(&chunk[0]);
        stats.rows += chunk.len() as u64;

        // Merge set: the suffix reaching the chunk, tail always included.
        let mut merge_from = working
            .iter()
            .position(|w| w.meta.key_last >= chunk_first)
            .unwrap_or(working.len());
        if let Some(tail_at) = working.iter().position(|w| w.meta.last == 1) {
            merge_from = merge_from.min(tail_at);
        }

        let tail_only = merge_from == working.len().saturating_sub(1)
            && working
                .last()
                .is_some_and(|w| w.meta.last == 1 && w.meta.key_last < chunk_first);
        let combined = working
            .get(merge_from..)
            .map(|ws| ws.iter().map(|w| w.meta.num_points as usize).sum::<usize>())
            .unwrap_or(0)
            + chunk.len();
        let sub_budget_ok = working
            .last()
            .is_some_and(|w| w.subs.len().max(1) < MAX_SUB_BLOCKS);

        if tail_only && combined < min_rows && sub_budget_ok {
            append_tail_sub(
                group,
                old_last,
                rewrite_last,
                last_file,
                schema,
                table,
                &old_info,
                working.last_mut().ok_or_else(|| {
                    CommitError::Internal("tail fast path without a tail".into())
                })?,
                chunk,
                stats,
            )?;
            continue;
        }

        // Merge-rewrite the suffix.
        let mut old_rows = Vec::new();
        for w in &working[merge_from..] {
            old_rows.extend(load_super_rows(group, table.tid, schema, w)?);
        }
        working.truncate(merge_from);

        let merged = merge_rows(old_rows, chunk);
        emit_blocks(
            schema, table.uid, min_rows, max_rows, data_file, last_file, merged, &mut working,
            stats,
        )?;
    }

    if working.is_empty() {
        return Ok(IdxEntry::default());
    }

    let mut builder = InfoBuilder::new(table.uid);
    for w in &working {
        if w.subs.len() >= 2 {
            builder.push_with_subs(w.subs.clone())?;
        } else {
            builder.push(w.meta);
        }
    }
    finish_info(head, builder)
}

/// Reads up to `cap` cursor rows with timestamps inside the partition
/// window.
fn read_chunk(cursor: &mut MemtableIter<'_>, max_key: i64, cap: usize) -> Vec<Vec<u8>> {
    let mut rows = Vec::new();
    while rows.len() < cap {
        match cursor.get() {
            Some(row) if row_ts(row) <= max_key => {
                rows.push(row.to_vec());
                cursor.advance();
            }
            _ => break,
        }
    }
    rows
}

/// Two-way merge of sorted row streams; `new` wins timestamp ties.
fn merge_rows(old: Vec<Vec<u8>>, new: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(old.len() + new.len());
    let mut old_it = old.into_iter().peekable();
    let mut new_it = new.into_iter().peekable();

    loop {
        match (old_it.peek(), new_it.peek()) {
            (Some(o), Some(n)) => {
                let (ots, nts) = (row_ts(o), row_ts(n));
                if ots < nts {
                    out.push(old_it.next().unwrap_or_default());
                } else if ots > nts {
                    out.push(new_it.next().unwrap_or_default());
                } else {
                    old_it.next();
                    out.push(new_it.next().unwrap_or_default());
                }
            }
            (Some(_), None) => out.push(old_it.next().unwrap_or_default()),
            (None, Some(_)) => out.push(new_it.next().unwrap_or_default()),
            (None, None) => break,
        }
    }
    out
}

/// Loads the rows of one working super block, preferring the row cache
/// for tails written during this partition. Blocks without a cache are
/// read from the group's real files; that covers both old blocks and
/// `.data` blocks appended earlier in this partition, since `.data` is
/// never staged.
fn load_super_rows(
    group: &FileGroup,
    tid: i32,
    schema: &Schema,
    w: &WorkingSuper,
) -> Result<Vec<Vec<u8>>, CommitError> {
    if let Some(rows) = &w.rows {
        return Ok(rows.clone());
    }

    let phys: Vec<BlockMeta> = if w.subs.is_empty() {
        vec![w.meta]
    } else {
        w.subs.clone()
    };

    let mut rows = Vec::with_capacity(w.meta.num_points as usize);
    for meta in phys {
        let cols = group.load_block_cols(&meta)?;
        if cols.len() != schema.num_cols() || meta.sversion != schema.version() {
            return Err(CommitError::SchemaMismatch { tid });
        }
        let mut batch = ColumnBatch::new(schema);
        for (idx, (col, bytes)) in cols.iter().enumerate() {
            let def = schema.cols()[idx];
            if col.col_id != def.id || col.ty != def.ty.as_u8() {
                return Err(CommitError::SchemaMismatch { tid });
            }
            batch.load_col(idx, bytes, meta.num_points as usize)?;
        }
        for i in 0..meta.num_points as usize {
            rows.push(batch.row_at(schema, i));
        }
    }
    Ok(rows)
}

/// Sub-block fast path: the chunk sits strictly above a small tail and
/// the pair stays under the data-block threshold, so the tail is
/// extended in place instead of rewritten.
#[allow(clippy::too_many_arguments)]
fn append_tail_sub(
    group: &FileGroup,
    old_last: &Mmap,
    rewrite_last: bool,
    last_file: &mut File,
    schema: &Schema,
    table: &CommitTable,
    old_info: &Option<InfoRegion>,
    tail: &mut WorkingSuper,
    chunk: Vec<Vec<u8>>,
    stats: &mut CommitStats,
) -> Result<(), CommitError> {
    let mut subs: Vec<BlockMeta>;
    let mut rows: Option<Vec<Vec<u8>>> = None;

    if rewrite_last && tail.rows.is_none() {
        // The old tail's bytes will disappear with the old last file:
        // coalesce them into the staged one and remember the rows for
        // later merges within this partition.
        let info = old_info.as_ref().ok_or_else(|| {
            CommitError::Internal("tail rewrite without an info region".into())
        })?;
        let old_rows = load_super_rows(group, table.tid, schema, tail)?;
        let moved = copy_block_data(last_file, old_last, info, &tail.meta)?;
        stats.blocks += 1;
        subs = vec![moved];
        let mut all = old_rows;
        all.extend(chunk.iter().cloned());
        rows = Some(all);
    } else {
        subs = if tail.subs.is_empty() {
            vec![tail.meta]
        } else {
            tail.subs.clone()
        };
        if let Some(cached) = &tail.rows {
            let mut all = cached.clone();
            all.extend(chunk.iter().cloned());
            rows = Some(all);
        }
    }

    let mut batch = ColumnBatch::new(schema);
    for row in &chunk {
        batch.push_row(schema, row)?;
    }
    let sub = write_block(last_file, table.uid, schema, &batch, true)?;
    stats.blocks += 1;
    subs.push(sub);

    tail.meta = BlockMeta {
        key_first: subs.iter().map(|b| b.key_first).min().unwrap_or(0),
        key_last: subs.iter().map(|b| b.key_last).max().unwrap_or(0),
        num_points: subs.iter().map(|b| b.num_points).sum(),
        num_sub_blocks: subs.len() as u8,
        ..tail.meta
    };
    tail.subs = subs;
    if rows.is_some() {
        tail.rows = rows;
    }
    trace!(tid = table.tid, "extended tail with a sub-block");
    Ok(())
}

/// Writes merged rows out as full `.data` blocks plus at most one
/// `.last` residue, appending the produced super blocks to `working`.
#[allow(clippy::too_many_arguments)]
fn emit_blocks(
    schema: &Schema,
    uid: u64,
    min_rows: usize,
    max_rows: usize,
    data_file: &mut File,
    last_file: &mut File,
    rows: Vec<Vec<u8>>,
    working: &mut Vec<WorkingSuper>,
    stats: &mut CommitStats,
) -> Result<(), CommitError> {
    let mut at = 0usize;
    let total = rows.len();

    while at < total {
        let remaining = total - at;
        let take = remaining.min(max_rows);
        let is_residue = take < min_rows;

        let mut batch = ColumnBatch::new(schema);
        for row in &rows[at..at + take] {
            batch.push_row(schema, row)?;
        }

        if is_residue {
            let meta = write_block(last_file, uid, schema, &batch, true)?;
            stats.blocks += 1;
            working.push(WorkingSuper {
                meta,
                subs: Vec::new(),
                rows: Some(rows[at..at + take].to_vec()),
            });
        } else {
            let meta = write_block(data_file, uid, schema, &batch, false)?;
            stats.blocks += 1;
            working.push(WorkingSuper {
                meta,
                subs: Vec::new(),
                rows: None,
            });
        }
        at += take;
    }
    Ok(())
}

/// Finishes an info builder into the staged head, producing the idx
/// entry.
fn finish_info(head: &mut HeadWriter, builder: InfoBuilder) -> Result<IdxEntry, CommitError> {
    let (raw, summary): (Vec<u8>, InfoSummary) = builder.finish()?;
    let offset = head.append_info(&raw)?;
    Ok(IdxEntry {
        offset,
        len: summary.len,
        has_last: summary.has_last,
        max_key: summary.max_key,
        num_super_blocks: summary.num_super_blocks,
        checksum: summary.checksum,
    })
}
