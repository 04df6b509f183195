//! Table schemas and the row ↔ column codec.
//!
//! A schema is an immutable, versioned, ordered list of fixed-width
//! columns; the first column is always the timestamp. Rows travel
//! through the write path as opaque byte records:
//!
//! ```text
//! [len u16][timestamp i64][payload]
//! ```
//!
//! where `payload` is the concatenation of the non-timestamp column
//! values in schema order, each at its type's fixed width, all
//! little-endian. `len` covers the whole record, so a submit block's
//! `data` region can be walked without the schema.
//!
//! [`ColumnBatch`] converts between row records and the column-major
//! layout blocks are written in: column 0 is the timestamp column,
//! column `j > 0` is the j-th schema column's values back to back.

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

/// Byte overhead of a row record before the payload (`u16` length +
/// `i64` timestamp).
pub const ROW_HEADER_SIZE: usize = 10;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by schema and row handling.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Structurally invalid schema definition.
    #[error("invalid schema: {0}")]
    Invalid(String),

    /// A row record does not match the schema's fixed row length.
    #[error("row length mismatch: expected {expected}, got {got}")]
    RowMismatch {
        /// Length required by the schema.
        expected: usize,
        /// Length found in the record.
        got: usize,
    },

    /// Unknown column type discriminant on disk.
    #[error("unknown column type {0}")]
    UnknownType(u8),
}

// ------------------------------------------------------------------------------------------------
// Column types
// ------------------------------------------------------------------------------------------------

/// Fixed-width column value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    /// 1-byte boolean.
    Bool,
    /// `i8`.
    TinyInt,
    /// `i16`.
    SmallInt,
    /// `i32`.
    Int,
    /// `i64`.
    BigInt,
    /// `f32`.
    Float,
    /// `f64`.
    Double,
    /// `i64` timestamp in the repository precision.
    Timestamp,
}

impl ColType {
    /// Value width in bytes.
    pub fn width(self) -> usize {
        match self {
            ColType::Bool | ColType::TinyInt => 1,
            ColType::SmallInt => 2,
            ColType::Int | ColType::Float => 4,
            ColType::BigInt | ColType::Double | ColType::Timestamp => 8,
        }
    }

    /// On-disk discriminant.
    pub fn as_u8(self) -> u8 {
        match self {
            ColType::Bool => 1,
            ColType::TinyInt => 2,
            ColType::SmallInt => 3,
            ColType::Int => 4,
            ColType::BigInt => 5,
            ColType::Float => 6,
            ColType::Double => 7,
            ColType::Timestamp => 9,
        }
    }

    /// Parse an on-disk discriminant.
    pub fn from_u8(v: u8) -> Result<Self, SchemaError> {
        match v {
            1 => Ok(ColType::Bool),
            2 => Ok(ColType::TinyInt),
            3 => Ok(ColType::SmallInt),
            4 => Ok(ColType::Int),
            5 => Ok(ColType::BigInt),
            6 => Ok(ColType::Float),
            7 => Ok(ColType::Double),
            9 => Ok(ColType::Timestamp),
            other => Err(SchemaError::UnknownType(other)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Schema
// ------------------------------------------------------------------------------------------------

/// One column of a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Stable column id, unique within the schema.
    pub id: i16,
    /// Value type.
    pub ty: ColType,
}

/// An immutable, versioned column layout for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    version: u16,
    cols: Vec<ColumnDef>,
    row_len: usize,
}

impl Schema {
    /// Builds a schema, enforcing that the first column is the
    /// timestamp and column ids are unique.
    pub fn new(version: u16, cols: Vec<ColumnDef>) -> Result<Self, SchemaError> {
        if cols.is_empty() {
            return Err(SchemaError::Invalid("schema has no columns".into()));
        }
        if cols[0].ty != ColType::Timestamp {
            return Err(SchemaError::Invalid(
                "first column must be the timestamp".into(),
            ));
        }
        for pair in cols.windows(2) {
            if pair[1].id <= pair[0].id {
                return Err(SchemaError::Invalid(format!(
                    "column ids must be strictly increasing (saw {} after {})",
                    pair[1].id, pair[0].id
                )));
            }
        }

        let payload: usize = cols[1..].iter().map(|c| c.ty.width()).sum();
        let row_len = ROW_HEADER_SIZE + payload;
        if row_len > u16::MAX as usize {
            return Err(SchemaError::Invalid(format!(
                "row length {row_len} exceeds the u16 row header"
            )));
        }
        Ok(Self {
            version,
            cols,
            row_len,
        })
    }

    /// Schema version (`sversion` in block metadata).
    pub fn version(&self) -> u16 {
        self.version
    }

    /// All columns, timestamp first.
    pub fn cols(&self) -> &[ColumnDef] {
        &self.cols
    }

    /// Number of columns including the timestamp.
    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    /// Total encoded row length under this schema.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Assembles a row record from a timestamp and a payload.
    pub fn build_row(&self, ts: i64, payload: &[u8]) -> Result<Vec<u8>, SchemaError> {
        if ROW_HEADER_SIZE + payload.len() != self.row_len {
            return Err(SchemaError::RowMismatch {
                expected: self.row_len,
                got: ROW_HEADER_SIZE + payload.len(),
            });
        }

        let mut row = Vec::with_capacity(self.row_len);
        row.extend_from_slice(&(self.row_len as u16).to_le_bytes());
        row.extend_from_slice(&ts.to_le_bytes());
        row.extend_from_slice(payload);
        Ok(row)
    }

    /// Validates a raw row record against this schema.
    pub fn check_row(&self, row: &[u8]) -> Result<(), SchemaError> {
        if row.len() != self.row_len || row_len_of(row) != Some(self.row_len) {
            return Err(SchemaError::RowMismatch {
                expected: self.row_len,
                got: row.len(),
            });
        }
        Ok(())
    }
}

impl Encode for ColumnDef {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.ty.as_u8().encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ColumnDef {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (id, n) = i16::decode_from(&buf[off..])?;
        off += n;
        let (ty_raw, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let ty = ColType::from_u8(ty_raw).map_err(|_| EncodingError::InvalidTag {
            tag: ty_raw as u32,
            type_name: "ColType",
        })?;
        Ok((Self { id, ty }, off))
    }
}

impl Encode for Schema {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.version.encode_to(buf)?;
        crate::encoding::encode_vec(&self.cols, buf)?;
        Ok(())
    }
}

impl Decode for Schema {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (version, n) = u16::decode_from(&buf[off..])?;
        off += n;
        let (cols, n) = crate::encoding::decode_vec::<ColumnDef>(&buf[off..])?;
        off += n;
        let schema = Schema::new(version, cols).map_err(|_| EncodingError::InvalidTag {
            tag: version as u32,
            type_name: "Schema",
        })?;
        Ok((schema, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Raw row helpers
// ------------------------------------------------------------------------------------------------

/// Reads the self-described length of a row record, if the header is
/// present.
pub fn row_len_of(row: &[u8]) -> Option<usize> {
    if row.len() < ROW_HEADER_SIZE {
        return None;
    }
    Some(u16::from_le_bytes([row[0], row[1]]) as usize)
}

/// Reads the timestamp of a row record.
///
/// The caller must have validated the record against its schema.
pub fn row_ts(row: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&row[2..10]);
    i64::from_le_bytes(bytes)
}

// ------------------------------------------------------------------------------------------------
// ColumnBatch
// ------------------------------------------------------------------------------------------------

/// An in-memory batch of rows in column-major layout, the unit that
/// blocks are written from and merged through.
///
/// Column 0 is the timestamp column; column `j` holds the j-th schema
/// column's fixed-width values back to back, in row order.
pub struct ColumnBatch {
    widths: Vec<usize>,
    cols: Vec<Vec<u8>>,
    num_rows: usize,
}

impl ColumnBatch {
    /// Creates an empty batch shaped for `schema`.
    pub fn new(schema: &Schema) -> Self {
        let widths: Vec<usize> = schema.cols().iter().map(|c| c.ty.width()).collect();
        let cols = widths.iter().map(|_| Vec::new()).collect();
        Self {
            widths,
            cols,
            num_rows: 0,
        }
    }

    /// Number of rows in the batch.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Number of columns including the timestamp.
    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    /// True when no rows have been pushed.
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Raw bytes of column `idx`.
    pub fn col_bytes(&self, idx: usize) -> &[u8] {
        &self.cols[idx]
    }

    /// Timestamp of row `i`.
    pub fn ts_at(&self, i: usize) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.cols[0][i * 8..i * 8 + 8]);
        i64::from_le_bytes(bytes)
    }

    /// Splits a validated row record into the batch's columns.
    pub fn push_row(&mut self, schema: &Schema, row: &[u8]) -> Result<(), SchemaError> {
        schema.check_row(row)?;

        self.cols[0].extend_from_slice(&row[2..10]);
        let mut off = ROW_HEADER_SIZE;
        for (j, width) in self.widths.iter().enumerate().skip(1) {
            self.cols[j].extend_from_slice(&row[off..off + width]);
            off += width;
        }
        self.num_rows += 1;
        Ok(())
    }

    /// Reassembles row `i` into a row record.
    pub fn row_at(&self, schema: &Schema, i: usize) -> Vec<u8> {
        let mut row = Vec::with_capacity(schema.row_len());
        row.extend_from_slice(&(schema.row_len() as u16).to_le_bytes());
        row.extend_from_slice(&self.cols[0][i * 8..i * 8 + 8]);
        for (j, width) in self.widths.iter().enumerate().skip(1) {
            row.extend_from_slice(&self.cols[j][i * width..(i + 1) * width]);
        }
        row
    }

    /// Appends a column's raw bytes, used when loading a block from
    /// disk. `bytes.len()` must be `expected_rows × width`.
    pub fn load_col(&mut self, idx: usize, bytes: &[u8], expected_rows: usize) -> Result<(), SchemaError> {
        if bytes.len() != expected_rows * self.widths[idx] {
            return Err(SchemaError::RowMismatch {
                expected: expected_rows * self.widths[idx],
                got: bytes.len(),
            });
        }
        self.cols[idx] = bytes.to_vec();
        if idx == 0 {
            self.num_rows = expected_rows;
        }
        Ok(())
    }
}
