//! Time-partitioned file groups and their on-disk format.
//!
//! One partition `fid` is a trio of files under the data directory:
//!
//! - `f<fid>.head` — file header, dense idx array `IdxEntry ×
//!   max_tables`, then the packed per-table info regions.
//! - `f<fid>.data` — append-only full blocks (each ≥
//!   `min_rows_per_file_block` rows).
//! - `f<fid>.last` — tail blocks: at most one under-full super block
//!   per table.
//!
//! # On-disk layout
//!
//! ```text
//! every file:   [magic "TSDF"][version u32][crc32 u32][zero pad]  = 512 B header
//! .head:        [header][IdxEntry × max_tables][info region]…
//! info region:  [delimiter u32][uid u64][BlockMeta × n][sub-block area]
//! block:        [delimiter u32][uid u64][ColMeta × num_cols][column payloads]
//! ```
//!
//! All integers little-endian. A super block with `num_sub_blocks > 1`
//! stores, in `offset`/`len`, the position of its run of sub-block
//! `BlockMeta` entries inside the sub-block area of its own info
//! region; sub-block entries carry `num_sub_blocks = 0`.
//!
//! # Integrity
//!
//! `IdxEntry.checksum` is a CRC32 over the table's full encoded info
//! region; it is verified on every `load_info`. Delimiters guard block
//! and info boundaries. A mismatch surfaces as [`FileError::Corrupt`]
//! and aborts the partition's commit, leaving the old files in place.
//!
//! # Atomicity
//!
//! `.data` and `.last` grow by append only; `.head` (and `.last` when
//! compacted) are replaced by writing `<name>.t` and renaming over the
//! old file, `.head` always last, so a crash at any point leaves a
//! consistent group.

pub mod dir;
pub mod writer;

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

use crate::encoding::{Decode, Encode, EncodingError};

/// Reserved size of the header at the start of every file.
pub const FILE_HEAD_SIZE: u64 = 512;

/// Magic bytes opening every file of a group.
pub const FILE_MAGIC: [u8; 4] = *b"TSDF";

/// On-disk format version.
pub const FILE_VERSION: u32 = 1;

/// Boundary marker for info regions and block data.
pub const DELIMITER: u32 = 0xF00A_FA0F;

/// Encoded size of one [`IdxEntry`].
pub const IDX_ENTRY_SIZE: usize = 29;

/// Encoded size of one [`BlockMeta`].
pub const BLOCK_META_SIZE: usize = 40;

/// Encoded size of one [`ColMeta`].
pub const COL_META_SIZE: usize = 12;

/// Encoded size of the `[delimiter][uid]` preamble shared by info
/// regions and blocks.
pub const PREAMBLE_SIZE: usize = 12;

/// Threshold above which a partition rewrite compacts `.last` instead
/// of appending to it.
pub const MAX_LAST_FILE_SIZE: u64 = 1024 * 1024;

/// Cap on sub-blocks per super block.
pub const MAX_SUB_BLOCKS: usize = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by file-group operations.
#[derive(Debug, Error)]
pub enum FileError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bad delimiter, checksum mismatch, or structural damage.
    #[error("corrupt file group data: {0}")]
    Corrupt(String),

    /// The file directory is at capacity.
    #[error("too many file groups (cap {0})")]
    TooManyGroups(usize),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk structures
// ------------------------------------------------------------------------------------------------

/// Per-table entry of the dense idx array in `.head`.
///
/// An all-zero entry (in particular `offset == 0`) means the table has
/// no data in this partition; real info regions always sit past the
/// idx array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdxEntry {
    /// Absolute offset of the table's info region in `.head`.
    pub offset: u64,
    /// Length of the info region in bytes.
    pub len: u32,
    /// Whether a tail block exists for the table (0 or 1).
    pub has_last: u8,
    /// `key_last` of the table's final super block.
    pub max_key: i64,
    /// Number of super blocks in the info region.
    pub num_super_blocks: u32,
    /// CRC32 over the encoded info region.
    pub checksum: u32,
}

impl IdxEntry {
    /// Whether the table has data in this partition.
    pub fn is_present(&self) -> bool {
        self.offset != 0
    }
}

impl Encode for IdxEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.len.encode_to(buf)?;
        self.has_last.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.num_super_blocks.encode_to(buf)?;
        self.checksum.encode_to(buf)
    }
}

impl Decode for IdxEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (has_last, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (num_super_blocks, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (checksum, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                offset,
                len,
                has_last,
                max_key,
                num_super_blocks,
                checksum,
            },
            off,
        ))
    }
}

/// Metadata of one super block (or, with `num_sub_blocks == 0`, one
/// sub-block) in an info region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockMeta {
    /// Offset of the block in `.data`/`.last` — or, for a super block
    /// with sub-blocks, of its sub-block run inside the info region.
    pub offset: u64,
    /// Byte length of the block (or of the sub-block run).
    pub len: u32,
    /// Smallest timestamp in the block.
    pub key_first: i64,
    /// Largest timestamp in the block.
    pub key_last: i64,
    /// Number of rows.
    pub num_points: u32,
    /// Number of columns.
    pub num_cols: u16,
    /// 1 for a plain block, > 1 for a super block with that many
    /// sub-blocks, 0 for a sub-block entry.
    pub num_sub_blocks: u8,
    /// 1 when the block lives in `.last`.
    pub last: u8,
    /// Compression algorithm; 0 = uncompressed.
    pub algorithm: u8,
    /// Schema version the block was written under.
    pub sversion: u16,
}

impl BlockMeta {
    /// Whether this super block points at a run of sub-blocks.
    pub fn has_sub_blocks(&self) -> bool {
        self.num_sub_blocks > 1
    }
}

impl Encode for BlockMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.len.encode_to(buf)?;
        self.key_first.encode_to(buf)?;
        self.key_last.encode_to(buf)?;
        self.num_points.encode_to(buf)?;
        self.num_cols.encode_to(buf)?;
        self.num_sub_blocks.encode_to(buf)?;
        self.last.encode_to(buf)?;
        self.algorithm.encode_to(buf)?;
        0u8.encode_to(buf)?; // pad
        self.sversion.encode_to(buf)
    }
}

impl Decode for BlockMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (key_first, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (key_last, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (num_points, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (num_cols, n) = u16::decode_from(&buf[off..])?;
        off += n;
        let (num_sub_blocks, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (last, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (algorithm, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (_pad, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (sversion, n) = u16::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                offset,
                len,
                key_first,
                key_last,
                num_points,
                num_cols,
                num_sub_blocks,
                last,
                algorithm,
                sversion,
            },
            off,
        ))
    }
}

/// Per-column descriptor inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColMeta {
    /// Stable column id.
    pub col_id: i16,
    /// Column type discriminant.
    pub ty: u8,
    /// Payload offset relative to the block start.
    pub offset: u32,
    /// Payload length in bytes.
    pub len: u32,
}

impl Encode for ColMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.col_id.encode_to(buf)?;
        self.ty.encode_to(buf)?;
        0u8.encode_to(buf)?; // pad
        self.offset.encode_to(buf)?;
        self.len.encode_to(buf)
    }
}

impl Decode for ColMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (col_id, n) = i16::decode_from(&buf[off..])?;
        off += n;
        let (ty, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (_pad, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                col_id,
                ty,
                offset,
                len,
            },
            off,
        ))
    }
}

/// A table's decoded info region plus its raw bytes (kept for
/// carry-forward and sub-block resolution).
pub struct InfoRegion {
    /// Table uid recorded in the region.
    pub uid: u64,
    /// Super blocks, sorted by `key_first`.
    pub supers: Vec<BlockMeta>,
    /// The full encoded region.
    pub raw: Vec<u8>,
}

impl InfoRegion {
    /// Resolves a super block into its physical blocks: itself when
    /// plain, or its sub-block run.
    pub fn physical_blocks(&self, sup: &BlockMeta) -> Result<Vec<BlockMeta>, FileError> {
        if !sup.has_sub_blocks() {
            return Ok(vec![*sup]);
        }

        let start = sup.offset as usize;
        let end = start + sup.len as usize;
        if end > self.raw.len() || sup.len as usize != sup.num_sub_blocks as usize * BLOCK_META_SIZE
        {
            return Err(FileError::Corrupt(format!(
                "sub-block run [{start}, {end}) escapes info region of {} bytes",
                self.raw.len()
            )));
        }

        let mut subs = Vec::with_capacity(sup.num_sub_blocks as usize);
        let mut off = start;
        for _ in 0..sup.num_sub_blocks {
            let (meta, n) = BlockMeta::decode_from(&self.raw[off..])?;
            off += n;
            subs.push(meta);
        }
        Ok(subs)
    }
}

// ------------------------------------------------------------------------------------------------
// FileGroup
// ------------------------------------------------------------------------------------------------

/// Handle to one partition's file trio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    /// Partition id.
    pub fid: i64,
    dir: PathBuf,
}

impl FileGroup {
    /// Path of the `.head` file.
    pub fn head_path(&self) -> PathBuf {
        self.dir.join(format!("f{}.head", self.fid))
    }

    /// Path of the `.data` file.
    pub fn data_path(&self) -> PathBuf {
        self.dir.join(format!("f{}.data", self.fid))
    }

    /// Path of the `.last` file.
    pub fn last_path(&self) -> PathBuf {
        self.dir.join(format!("f{}.last", self.fid))
    }

    /// Temporary path a replacement `.head` is staged at.
    pub fn head_tmp_path(&self) -> PathBuf {
        self.dir.join(format!("f{}.head.t", self.fid))
    }

    /// Temporary path a replacement `.last` is staged at.
    pub fn last_tmp_path(&self) -> PathBuf {
        self.dir.join(format!("f{}.last.t", self.fid))
    }

    /// Creates the three files of a fresh partition. `.head` gets a
    /// zeroed idx array so lookups by `tid` are a constant-offset read.
    pub fn create(dir: &Path, fid: i64, max_tables: i32) -> Result<Self, FileError> {
        let group = Self {
            fid,
            dir: dir.to_path_buf(),
        };

        let mut head = create_file(&group.head_path())?;
        let idx_region = vec![0u8; max_tables as usize * IDX_ENTRY_SIZE];
        head.write_all(&idx_region)?;
        head.sync_all()?;

        create_file(&group.data_path())?.sync_all()?;
        create_file(&group.last_path())?.sync_all()?;

        trace!(fid, "created file group");
        Ok(group)
    }

    /// Opens an existing partition, verifying every file header.
    pub fn open(dir: &Path, fid: i64) -> Result<Self, FileError> {
        let group = Self {
            fid,
            dir: dir.to_path_buf(),
        };
        for path in [group.head_path(), group.data_path(), group.last_path()] {
            check_file_header(&path)?;
        }
        Ok(group)
    }

    /// Whether all three files exist on disk.
    pub fn exists(dir: &Path, fid: i64) -> bool {
        let group = Self {
            fid,
            dir: dir.to_path_buf(),
        };
        group.head_path().exists() && group.data_path().exists() && group.last_path().exists()
    }

    /// Removes all three files from the filesystem.
    pub fn remove(&self) -> Result<(), FileError> {
        for path in [self.head_path(), self.data_path(), self.last_path()] {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Byte offset of `tid`'s idx entry in `.head`.
    pub fn idx_offset(tid: i32) -> u64 {
        FILE_HEAD_SIZE + tid as u64 * IDX_ENTRY_SIZE as u64
    }

    /// First byte past the idx array, where info regions may start.
    pub fn info_base(max_tables: i32) -> u64 {
        FILE_HEAD_SIZE + max_tables as u64 * IDX_ENTRY_SIZE as u64
    }

    /// Reads the full idx array from `.head`.
    pub fn load_idx(&self, max_tables: i32) -> Result<Vec<IdxEntry>, FileError> {
        self.load_idx_from(&self.head_path(), max_tables)
    }

    /// Reads the full idx array from an arbitrary head file (used on
    /// staged replacements in tests and recovery checks).
    pub fn load_idx_from(&self, path: &Path, max_tables: i32) -> Result<Vec<IdxEntry>, FileError> {
        let mmap = map_file(path)?;
        let start = Self::idx_offset(0) as usize;
        let end = Self::info_base(max_tables) as usize;
        if mmap.len() < end {
            return Err(FileError::Corrupt(format!(
                "head file {} shorter than idx array",
                path.display()
            )));
        }

        let mut entries = Vec::with_capacity(max_tables as usize);
        let mut off = start;
        for _ in 0..max_tables {
            let (entry, n) = IdxEntry::decode_from(&mmap[off..])?;
            off += n;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Loads and verifies one table's info region from `.head`.
    pub fn load_info(&self, entry: &IdxEntry) -> Result<InfoRegion, FileError> {
        let mmap = map_file(&self.head_path())?;
        load_info_from(&mmap, entry)
    }

    /// Loads one physical block's columns from `.data` or `.last`
    /// (chosen by `meta.last`) as raw per-column payloads.
    pub fn load_block_cols(&self, meta: &BlockMeta) -> Result<Vec<(ColMeta, Vec<u8>)>, FileError> {
        let path = if meta.last == 1 {
            self.last_path()
        } else {
            self.data_path()
        };
        let mmap = map_file(&path)?;
        load_block_cols_from(&mmap, meta)
    }

    /// Loads a single column of a block, addressed by its descriptor.
    pub fn load_col(
        &self,
        meta: &BlockMeta,
        col: &ColMeta,
    ) -> Result<Vec<u8>, FileError> {
        let path = if meta.last == 1 {
            self.last_path()
        } else {
            self.data_path()
        };
        let mmap = map_file(&path)?;
        let start = meta.offset as usize + col.offset as usize;
        let end = start + col.len as usize;
        if end > mmap.len() {
            return Err(FileError::Corrupt(format!(
                "column [{start}, {end}) escapes file of {} bytes",
                mmap.len()
            )));
        }
        Ok(mmap[start..end].to_vec())
    }
}

// ------------------------------------------------------------------------------------------------
// Shared low-level helpers
// ------------------------------------------------------------------------------------------------

/// Creates a file and writes the standard 512-byte header.
pub fn create_file(path: &Path) -> Result<File, FileError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .read(true)
        .open(path)?;

    let mut header = Vec::with_capacity(FILE_HEAD_SIZE as usize);
    header.extend_from_slice(&FILE_MAGIC);
    header.extend_from_slice(&FILE_VERSION.to_le_bytes());

    let mut hasher = Crc32::new();
    hasher.update(&header);
    header.extend_from_slice(&hasher.finalize().to_le_bytes());
    header.resize(FILE_HEAD_SIZE as usize, 0);

    file.write_all(&header)?;
    Ok(file)
}

/// Opens a file for appending, leaving the cursor at the end.
pub fn open_for_append(path: &Path) -> Result<File, FileError> {
    check_file_header(path)?;
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::End(0))?;
    Ok(file)
}

/// Verifies the magic, version, and header CRC of a file.
pub fn check_file_header(path: &Path) -> Result<(), FileError> {
    let mmap = map_file(path)?;
    if mmap.len() < FILE_HEAD_SIZE as usize {
        return Err(FileError::Corrupt(format!(
            "{} shorter than the file header",
            path.display()
        )));
    }
    if mmap[..4] != FILE_MAGIC {
        return Err(FileError::Corrupt(format!("bad magic in {}", path.display())));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&mmap[4..8]);
    if u32::from_le_bytes(version) != FILE_VERSION {
        return Err(FileError::Corrupt(format!(
            "unsupported file version in {}",
            path.display()
        )));
    }

    let mut stored = [0u8; 4];
    stored.copy_from_slice(&mmap[8..12]);
    let mut hasher = Crc32::new();
    hasher.update(&mmap[..8]);
    if hasher.finalize() != u32::from_le_bytes(stored) {
        return Err(FileError::Corrupt(format!(
            "header checksum mismatch in {}",
            path.display()
        )));
    }
    Ok(())
}

/// Maps a whole file read-only.
pub fn map_file(path: &Path) -> Result<Mmap, FileError> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and the engine never truncates
    // a mapped file while a mapping is live; writers only append or
    // replace whole files via rename.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

/// Decodes and verifies an info region out of a mapped head file.
pub fn load_info_from(head: &Mmap, entry: &IdxEntry) -> Result<InfoRegion, FileError> {
    let start = entry.offset as usize;
    let end = start + entry.len as usize;
    if !entry.is_present() || end > head.len() {
        return Err(FileError::Corrupt(format!(
            "info region [{start}, {end}) escapes head file of {} bytes",
            head.len()
        )));
    }
    let raw = head[start..end].to_vec();

    let mut hasher = Crc32::new();
    hasher.update(&raw);
    if hasher.finalize() != entry.checksum {
        return Err(FileError::Corrupt("info region checksum mismatch".into()));
    }

    parse_info(&raw, entry.num_super_blocks)
}

/// Parses an already-verified info region.
pub fn parse_info(raw: &[u8], num_super_blocks: u32) -> Result<InfoRegion, FileError> {
    let mut off = 0;
    let (delimiter, n) = u32::decode_from(raw)?;
    off += n;
    if delimiter != DELIMITER {
        return Err(FileError::Corrupt(format!(
            "bad info delimiter 0x{delimiter:08X}"
        )));
    }
    let (uid, n) = u64::decode_from(&raw[off..])?;
    off += n;

    let mut supers = Vec::with_capacity(num_super_blocks as usize);
    for _ in 0..num_super_blocks {
        let (meta, n) = BlockMeta::decode_from(&raw[off..])?;
        off += n;
        supers.push(meta);
    }

    Ok(InfoRegion {
        uid,
        supers,
        raw: raw.to_vec(),
    })
}

/// Parses a block's column descriptors and payloads out of a mapped
/// data or last file.
pub fn load_block_cols_from(
    mmap: &Mmap,
    meta: &BlockMeta,
) -> Result<Vec<(ColMeta, Vec<u8>)>, FileError> {
    let base = meta.offset as usize;
    let end = base + meta.len as usize;
    if end > mmap.len() {
        return Err(FileError::Corrupt(format!(
            "block [{base}, {end}) escapes file of {} bytes",
            mmap.len()
        )));
    }
    let block = &mmap[base..end];

    let mut off = 0;
    let (delimiter, n) = u32::decode_from(block)?;
    off += n;
    if delimiter != DELIMITER {
        return Err(FileError::Corrupt(format!(
            "bad block delimiter 0x{delimiter:08X}"
        )));
    }
    let (_uid, n) = u64::decode_from(&block[off..])?;
    off += n;

    let mut cols = Vec::with_capacity(meta.num_cols as usize);
    for _ in 0..meta.num_cols {
        let (col, n) = ColMeta::decode_from(&block[off..])?;
        off += n;
        let start = col.offset as usize;
        let stop = start + col.len as usize;
        if stop > block.len() {
            return Err(FileError::Corrupt(format!(
                "column payload [{start}, {stop}) escapes block of {} bytes",
                block.len()
            )));
        }
        cols.push((col, block[start..stop].to_vec()));
    }
    Ok(cols)
}
