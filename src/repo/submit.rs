//! Submit-message wire format.
//!
//! A submit message is the unit accepted by [`Tsdb::insert`]. Framing
//! is big-endian:
//!
//! ```text
//! header:  [length u32][num_blocks u32][compressed u32]
//! block:   [len u32][num_rows u16][uid u64][tid i32][sversion u32][padding u32][data…]
//! ```
//!
//! `length` covers the whole message, `len` covers one block's `data`
//! region. `data` is a dense run of row records, each self-describing
//! its byte length, so rows can be walked without the schema.
//!
//! [`Tsdb::insert`]: crate::repo::Tsdb::insert

use crate::schema::row_len_of;

const MSG_HEADER_SIZE: usize = 12;
const BLOCK_HEADER_SIZE: usize = 26;

/// One parsed submit block, borrowing the message buffer.
#[derive(Debug, Clone, Copy)]
pub struct SubmitBlock<'a> {
    /// Target table uid.
    pub uid: u64,
    /// Target table id.
    pub tid: i32,
    /// Schema version the rows were built under.
    pub sversion: u32,
    /// Declared row count.
    pub num_rows: u16,
    /// Dense row records.
    pub data: &'a [u8],
}

impl<'a> SubmitBlock<'a> {
    /// Walks the block's row records.
    ///
    /// Stops early on a malformed length prefix; callers compare the
    /// yielded count against `num_rows`.
    pub fn rows(&self) -> SubmitRows<'a> {
        SubmitRows { data: self.data }
    }
}

/// Iterator over the rows of a submit block.
pub struct SubmitRows<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for SubmitRows<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let len = row_len_of(self.data)?;
        if len == 0 || len > self.data.len() {
            return None;
        }
        let (row, rest) = self.data.split_at(len);
        self.data = rest;
        Some(row)
    }
}

fn read_u32_be(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

fn read_u16_be(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_be_bytes(bytes)
}

fn read_u64_be(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

/// Parses a submit message into its blocks.
pub fn parse_submit(msg: &[u8]) -> Result<Vec<SubmitBlock<'_>>, String> {
    if msg.len() < MSG_HEADER_SIZE {
        return Err(format!("message of {} bytes has no header", msg.len()));
    }
    let length = read_u32_be(msg, 0) as usize;
    let num_blocks = read_u32_be(msg, 4) as usize;
    let compressed = read_u32_be(msg, 8);

    if length != msg.len() {
        return Err(format!(
            "declared length {length} does not match buffer of {} bytes",
            msg.len()
        ));
    }
    if compressed != 0 {
        return Err("compressed submit messages are not supported".into());
    }

    let mut blocks = Vec::with_capacity(num_blocks);
    let mut at = MSG_HEADER_SIZE;
    for i in 0..num_blocks {
        if at + BLOCK_HEADER_SIZE > msg.len() {
            return Err(format!("block {i} header escapes the message"));
        }
        let len = read_u32_be(msg, at) as usize;
        let num_rows = read_u16_be(msg, at + 4);
        let uid = read_u64_be(msg, at + 6);
        let tid = read_u32_be(msg, at + 14) as i32;
        let sversion = read_u32_be(msg, at + 18);
        // 4 bytes of padding at `at + 22`.
        at += BLOCK_HEADER_SIZE;

        if at + len > msg.len() {
            return Err(format!("block {i} data escapes the message"));
        }
        blocks.push(SubmitBlock {
            uid,
            tid,
            sversion,
            num_rows,
            data: &msg[at..at + len],
        });
        at += len;
    }

    if at != msg.len() {
        return Err(format!("{} trailing bytes after the last block", msg.len() - at));
    }
    Ok(blocks)
}

/// Builds submit messages, mainly for callers that assemble writes in
/// process (and for tests).
#[derive(Default)]
pub struct SubmitBuilder {
    blocks: Vec<u8>,
    num_blocks: u32,
}

impl SubmitBuilder {
    /// Starts an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one block of row records for a table.
    pub fn add_block(&mut self, uid: u64, tid: i32, sversion: u32, rows: &[Vec<u8>]) -> &mut Self {
        let data_len: usize = rows.iter().map(|r| r.len()).sum();

        self.blocks.extend_from_slice(&(data_len as u32).to_be_bytes());
        self.blocks
            .extend_from_slice(&(rows.len() as u16).to_be_bytes());
        self.blocks.extend_from_slice(&uid.to_be_bytes());
        self.blocks.extend_from_slice(&(tid as u32).to_be_bytes());
        self.blocks.extend_from_slice(&sversion.to_be_bytes());
        self.blocks.extend_from_slice(&0u32.to_be_bytes());
        for row in rows {
            self.blocks.extend_from_slice(row);
        }
        self.num_blocks += 1;
        self
    }

    /// Seals the message.
    pub fn finish(&self) -> Vec<u8> {
        let total = MSG_HEADER_SIZE + self.blocks.len();
        let mut msg = Vec::with_capacity(total);
        msg.extend_from_slice(&(total as u32).to_be_bytes());
        msg.extend_from_slice(&self.num_blocks.to_be_bytes());
        msg.extend_from_slice(&0u32.to_be_bytes());
        msg.extend_from_slice(&self.blocks);
        msg
    }
}
