//! Block and head-file writers for the commit pipeline.
//!
//! Everything here appends: blocks are appended to `.data`/`.last`,
//! info regions to a staged replacement head. Nothing in this module
//! renames files — the commit pipeline sequences fsyncs and renames so
//! that a crash at any point leaves the old group intact.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use tracing::trace;

use crate::encoding::Encode;
use crate::schema::{ColumnBatch, Schema};

use super::{
    create_file, load_block_cols_from, BlockMeta, ColMeta, FileError, IdxEntry, InfoRegion,
    BLOCK_META_SIZE, COL_META_SIZE, DELIMITER, FILE_HEAD_SIZE, IDX_ENTRY_SIZE, PREAMBLE_SIZE,
};

// ------------------------------------------------------------------------------------------------
// Block writer
// ------------------------------------------------------------------------------------------------

/// Appends one block to `file` (already positioned at its end) and
/// returns the block's metadata.
///
/// The batch must be non-empty and sorted by timestamp; `last` selects
/// the `last` flag recorded in the metadata, the caller chooses the
/// destination file to match.
pub fn write_block(
    file: &mut File,
    uid: u64,
    schema: &Schema,
    batch: &ColumnBatch,
    last: bool,
) -> Result<BlockMeta, FileError> {
    if batch.is_empty() {
        return Err(FileError::Internal("attempted to write an empty block".into()));
    }

    let offset = file.stream_position()?;
    let num_cols = schema.num_cols();
    let header_len = PREAMBLE_SIZE + num_cols * COL_META_SIZE;

    let mut block = Vec::with_capacity(header_len);
    DELIMITER.encode_to(&mut block)?;
    uid.encode_to(&mut block)?;

    let mut payload_off = header_len as u32;
    for (idx, col) in schema.cols().iter().enumerate() {
        let payload = batch.col_bytes(idx);
        ColMeta {
            col_id: col.id,
            ty: col.ty.as_u8(),
            offset: payload_off,
            len: payload.len() as u32,
        }
        .encode_to(&mut block)?;
        payload_off += payload.len() as u32;
    }
    for idx in 0..num_cols {
        block.extend_from_slice(batch.col_bytes(idx));
    }

    file.write_all(&block)?;

    let n = batch.num_rows();
    let meta = BlockMeta {
        offset,
        len: block.len() as u32,
        key_first: batch.ts_at(0),
        key_last: batch.ts_at(n - 1),
        num_points: n as u32,
        num_cols: num_cols as u16,
        num_sub_blocks: 1,
        last: u8::from(last),
        algorithm: 0,
        sversion: schema.version(),
    };
    trace!(
        offset,
        rows = n,
        last,
        key_first = meta.key_first,
        key_last = meta.key_last,
        "wrote block"
    );
    Ok(meta)
}

/// Rewrites a super block from `src` into `out` as a single coalesced
/// physical block, resolving sub-blocks. Used when `.last` is being
/// compacted during a partition rewrite.
pub fn copy_block_data(
    out: &mut File,
    src: &Mmap,
    info: &InfoRegion,
    sup: &BlockMeta,
) -> Result<BlockMeta, FileError> {
    let phys = info.physical_blocks(sup)?;

    // Single physical block: a verbatim byte copy is enough, every
    // offset inside a block is relative to the block start.
    if phys.len() == 1 {
        let one = phys[0];
        let start = one.offset as usize;
        let end = start + one.len as usize;
        if end > src.len() {
            return Err(FileError::Corrupt(format!(
                "block [{start}, {end}) escapes file of {} bytes",
                src.len()
            )));
        }
        let offset = out.stream_position()?;
        out.write_all(&src[start..end])?;
        return Ok(BlockMeta { offset, ..one });
    }

    // Multiple sub-blocks: concatenate the column payloads in
    // sub-block order and emit one block.
    let first_cols = load_block_cols_from(src, &phys[0])?;
    let mut merged: Vec<(ColMeta, Vec<u8>)> = first_cols;
    for sub in &phys[1..] {
        let cols = load_block_cols_from(src, sub)?;
        if cols.len() != merged.len() {
            return Err(FileError::Corrupt(
                "sub-blocks disagree on column count".into(),
            ));
        }
        for ((dst_meta, dst), (src_meta, bytes)) in merged.iter_mut().zip(cols) {
            if dst_meta.col_id != src_meta.col_id || dst_meta.ty != src_meta.ty {
                return Err(FileError::Corrupt(
                    "sub-blocks disagree on column layout".into(),
                ));
            }
            dst.extend_from_slice(&bytes);
        }
    }

    let offset = out.stream_position()?;
    let header_len = PREAMBLE_SIZE + merged.len() * COL_META_SIZE;
    let mut block = Vec::with_capacity(header_len);
    DELIMITER.encode_to(&mut block)?;
    info.uid.encode_to(&mut block)?;

    let mut payload_off = header_len as u32;
    for (col, bytes) in &merged {
        ColMeta {
            col_id: col.col_id,
            ty: col.ty,
            offset: payload_off,
            len: bytes.len() as u32,
        }
        .encode_to(&mut block)?;
        payload_off += bytes.len() as u32;
    }
    for (_, bytes) in &merged {
        block.extend_from_slice(bytes);
    }
    out.write_all(&block)?;

    let num_points: u32 = phys.iter().map(|b| b.num_points).sum();
    Ok(BlockMeta {
        offset,
        len: block.len() as u32,
        key_first: phys[0].key_first,
        key_last: phys[phys.len() - 1].key_last,
        num_points,
        num_cols: sup.num_cols,
        num_sub_blocks: 1,
        last: sup.last,
        algorithm: sup.algorithm,
        sversion: sup.sversion,
    })
}

// ------------------------------------------------------------------------------------------------
// Info region builder
// ------------------------------------------------------------------------------------------------

/// Summary of a finished info region, ready to become an [`IdxEntry`].
pub struct InfoSummary {
    /// Region length in bytes.
    pub len: u32,
    /// Whether any super block lives in `.last`.
    pub has_last: u8,
    /// Largest `key_last` across super blocks.
    pub max_key: i64,
    /// Number of super blocks.
    pub num_super_blocks: u32,
    /// CRC32 over the encoded region.
    pub checksum: u32,
}

/// Builds one table's info region: preamble, super-block array, and
/// the sub-block area.
pub struct InfoBuilder {
    uid: u64,
    entries: Vec<(BlockMeta, Vec<BlockMeta>)>,
}

impl InfoBuilder {
    /// Starts an empty region for `uid`.
    pub fn new(uid: u64) -> Self {
        Self {
            uid,
            entries: Vec::new(),
        }
    }

    /// True when no super block has been pushed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a plain super block.
    pub fn push(&mut self, meta: BlockMeta) {
        self.entries.push((
            BlockMeta {
                num_sub_blocks: 1,
                ..meta
            },
            Vec::new(),
        ));
    }

    /// Appends a super block composed of `subs` physical blocks (at
    /// least two). Range and row count are derived from the run.
    pub fn push_with_subs(&mut self, subs: Vec<BlockMeta>) -> Result<(), FileError> {
        if subs.len() < 2 {
            return Err(FileError::Internal(
                "a sub-block run needs at least two blocks".into(),
            ));
        }
        let template = subs[0];
        let sup = BlockMeta {
            key_first: subs.iter().map(|b| b.key_first).min().unwrap_or(0),
            key_last: subs.iter().map(|b| b.key_last).max().unwrap_or(0),
            num_points: subs.iter().map(|b| b.num_points).sum(),
            num_sub_blocks: subs.len() as u8,
            // offset/len point into the sub-block area, assigned in finish().
            offset: 0,
            len: 0,
            ..template
        };
        self.entries.push((sup, subs));
        Ok(())
    }

    /// Encodes the region and computes its summary.
    pub fn finish(self) -> Result<(Vec<u8>, InfoSummary), FileError> {
        let supers_end = PREAMBLE_SIZE + self.entries.len() * BLOCK_META_SIZE;

        // Lay out the sub-block area first so super entries can point
        // into it.
        let mut sub_area = Vec::new();
        let mut supers = Vec::with_capacity(self.entries.len());
        for (mut sup, subs) in self.entries {
            if !subs.is_empty() {
                sup.offset = (supers_end + sub_area.len()) as u64;
                sup.len = (subs.len() * BLOCK_META_SIZE) as u32;
                for sub in &subs {
                    BlockMeta {
                        num_sub_blocks: 0,
                        ..*sub
                    }
                    .encode_to(&mut sub_area)?;
                }
            }
            supers.push(sup);
        }

        let mut raw = Vec::with_capacity(supers_end + sub_area.len());
        DELIMITER.encode_to(&mut raw)?;
        self.uid.encode_to(&mut raw)?;
        for sup in &supers {
            sup.encode_to(&mut raw)?;
        }
        raw.extend_from_slice(&sub_area);

        let mut hasher = Crc32::new();
        hasher.update(&raw);

        let summary = InfoSummary {
            len: raw.len() as u32,
            has_last: u8::from(supers.iter().any(|s| s.last == 1)),
            max_key: supers.iter().map(|s| s.key_last).max().unwrap_or(0),
            num_super_blocks: supers.len() as u32,
            checksum: hasher.finalize(),
        };
        Ok((raw, summary))
    }
}

// ------------------------------------------------------------------------------------------------
// Head writer
// ------------------------------------------------------------------------------------------------

/// Writes a staged replacement head file: header, idx array, and the
/// packed info regions.
pub struct HeadWriter {
    file: File,
    path: PathBuf,
    cursor: u64,
    max_tables: i32,
}

impl HeadWriter {
    /// Creates the staged file with a zeroed idx array.
    pub fn create(path: &Path, max_tables: i32) -> Result<Self, FileError> {
        let mut file = create_file(path)?;
        let idx_region = vec![0u8; max_tables as usize * IDX_ENTRY_SIZE];
        file.write_all(&idx_region)?;
        let cursor = FILE_HEAD_SIZE + idx_region.len() as u64;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            cursor,
            max_tables,
        })
    }

    /// Appends one table's encoded info region, returning the offset
    /// it landed at.
    pub fn append_info(&mut self, raw: &[u8]) -> Result<u64, FileError> {
        let offset = self.cursor;
        self.file.write_all(raw)?;
        self.cursor += raw.len() as u64;
        Ok(offset)
    }

    /// Writes the idx array and syncs the staged file. The caller
    /// renames it into place.
    pub fn finish(mut self, idx: &[IdxEntry]) -> Result<(), FileError> {
        if idx.len() != self.max_tables as usize {
            return Err(FileError::Internal(format!(
                "idx array has {} entries, expected {}",
                idx.len(),
                self.max_tables
            )));
        }

        let mut region = Vec::with_capacity(idx.len() * IDX_ENTRY_SIZE);
        for entry in idx {
            entry.encode_to(&mut region)?;
        }

        self.file.seek(SeekFrom::Start(FILE_HEAD_SIZE))?;
        self.file.write_all(&region)?;
        self.file.sync_all()?;
        trace!(path = %self.path.display(), "staged replacement head");
        Ok(())
    }
}
