//! Repository configuration and the on-disk CONFIG file.
//!
//! A repository is described by a small fixed-size [`TsdbConfig`]
//! struct. It is validated once at create time and then written to
//! `<rootDir>/CONFIG` as an encoded struct followed by a CRC32, using
//! the usual tmp → fsync → rename sequence so the file is either the
//! old version or the new one, never a torn write.
//!
//! # Option bounds
//!
//! | Option                  | Default | Min    | Max     |
//! |-------------------------|---------|--------|---------|
//! | precision               | milli   | milli  | nano    |
//! | max_tables              | 1000    | 10     | 100000  |
//! | days_per_file           | 10      | 1      | 60      |
//! | min_rows_per_file_block | 100     | 10     | 1000    |
//! | max_rows_per_file_block | 4096    | 200    | 10000   |
//! | keep (days)             | 3650    | 1      | i32::MAX|
//! | max_cache_size          | 16 MiB  | 4 MiB  | 1 GiB   |
//!
//! Additionally `min_rows_per_file_block ≤ max_rows_per_file_block`
//! must hold.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::info;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// File name of the serialized configuration under the repository root.
pub const CONFIG_FILENAME: &str = "CONFIG";

/// Encoded size of [`TsdbConfig`] (fixed; the CONFIG file is this plus
/// a 4-byte CRC32).
pub const CONFIG_ENCODED_SIZE: usize = 33;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by configuration handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its documented bounds.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The CONFIG file failed checksum or structural validation.
    #[error("corrupt CONFIG file: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Precision
// ------------------------------------------------------------------------------------------------

/// Unit of the repository's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Milliseconds since the epoch.
    #[default]
    Milli,
    /// Microseconds since the epoch.
    Micro,
    /// Nanoseconds since the epoch.
    Nano,
}

impl Precision {
    /// Number of timestamp units in one day at this precision.
    pub fn units_per_day(self) -> i64 {
        match self {
            Precision::Milli => 86_400_000,
            Precision::Micro => 86_400_000_000,
            Precision::Nano => 86_400_000_000_000,
        }
    }

    /// On-disk discriminant.
    pub fn as_i8(self) -> i8 {
        match self {
            Precision::Milli => 0,
            Precision::Micro => 1,
            Precision::Nano => 2,
        }
    }

    /// Parse an on-disk discriminant.
    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            0 => Some(Precision::Milli),
            1 => Some(Precision::Micro),
            2 => Some(Precision::Nano),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TsdbConfig
// ------------------------------------------------------------------------------------------------

/// Repository configuration.
///
/// All fields except `keep` and `max_cache_size` are immutable after
/// the repository is created; they define the partition geometry and
/// on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsdbConfig {
    /// Timestamp unit for every table in the repository.
    pub precision: Precision,

    /// Opaque repository identifier, recorded in CONFIG.
    pub tsdb_id: i32,

    /// Size of the dense table-id space.
    pub max_tables: i32,

    /// Width of one file partition, in days.
    pub days_per_file: i32,

    /// Minimum rows for a block to be placed in `.data`; smaller blocks
    /// go to `.last`.
    pub min_rows_per_file_block: i32,

    /// Hard cap on rows per block.
    pub max_rows_per_file_block: i32,

    /// Retention horizon in days.
    pub keep: i32,

    /// Arena cap in bytes; allocation beyond this fails with
    /// `CacheError::CacheFull`.
    pub max_cache_size: i64,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            precision: Precision::Milli,
            tsdb_id: 0,
            max_tables: 1000,
            days_per_file: 10,
            min_rows_per_file_block: 100,
            max_rows_per_file_block: 4096,
            keep: 3650,
            max_cache_size: 16 * 1024 * 1024,
        }
    }
}

impl TsdbConfig {
    /// Validates every field against its documented bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(name: &str, v: i64, min: i64, max: i64) -> Result<(), ConfigError> {
            if v < min || v > max {
                return Err(ConfigError::Invalid(format!(
                    "{name} = {v} out of range [{min}, {max}]"
                )));
            }
            Ok(())
        }

        check("max_tables", self.max_tables as i64, 10, 100_000)?;
        check("days_per_file", self.days_per_file as i64, 1, 60)?;
        check(
            "min_rows_per_file_block",
            self.min_rows_per_file_block as i64,
            10,
            1000,
        )?;
        check(
            "max_rows_per_file_block",
            self.max_rows_per_file_block as i64,
            200,
            10_000,
        )?;
        check("keep", self.keep as i64, 1, i32::MAX as i64)?;
        check(
            "max_cache_size",
            self.max_cache_size,
            4 * 1024 * 1024,
            1024 * 1024 * 1024,
        )?;

        if self.min_rows_per_file_block > self.max_rows_per_file_block {
            return Err(ConfigError::Invalid(format!(
                "min_rows_per_file_block ({}) exceeds max_rows_per_file_block ({})",
                self.min_rows_per_file_block, self.max_rows_per_file_block
            )));
        }

        Ok(())
    }

    /// Checks that `new` only changes fields that are mutable after
    /// create (`keep`, `max_cache_size`).
    pub fn validate_update(&self, new: &TsdbConfig) -> Result<(), ConfigError> {
        new.validate()?;

        if new.precision != self.precision
            || new.tsdb_id != self.tsdb_id
            || new.max_tables != self.max_tables
            || new.days_per_file != self.days_per_file
            || new.min_rows_per_file_block != self.min_rows_per_file_block
            || new.max_rows_per_file_block != self.max_rows_per_file_block
        {
            return Err(ConfigError::Invalid(
                "only keep and max_cache_size may change after create".into(),
            ));
        }

        Ok(())
    }

    /// Timestamp units covered by one file partition.
    pub fn partition_span(&self) -> i64 {
        self.days_per_file as i64 * self.precision.units_per_day()
    }

    /// Partition id covering `ts`.
    pub fn fid_of(&self, ts: i64) -> i64 {
        ts.div_euclid(self.partition_span())
    }

    /// Inclusive `[min_key, max_key]` window of partition `fid`.
    pub fn fid_window(&self, fid: i64) -> (i64, i64) {
        let span = self.partition_span();
        (fid * span, fid * span + span - 1)
    }
}

impl Encode for TsdbConfig {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.precision.as_i8().encode_to(buf)?;
        self.tsdb_id.encode_to(buf)?;
        self.max_tables.encode_to(buf)?;
        self.days_per_file.encode_to(buf)?;
        self.min_rows_per_file_block.encode_to(buf)?;
        self.max_rows_per_file_block.encode_to(buf)?;
        self.keep.encode_to(buf)?;
        self.max_cache_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TsdbConfig {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (precision_raw, n) = i8::decode_from(&buf[off..])?;
        off += n;
        let precision = Precision::from_i8(precision_raw).ok_or(EncodingError::InvalidTag {
            tag: precision_raw as u32,
            type_name: "Precision",
        })?;
        let (tsdb_id, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (max_tables, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (days_per_file, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (min_rows, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (max_rows, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (keep, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (max_cache_size, n) = i64::decode_from(&buf[off..])?;
        off += n;

        Ok((
            Self {
                precision,
                tsdb_id,
                max_tables,
                days_per_file,
                min_rows_per_file_block: min_rows,
                max_rows_per_file_block: max_rows,
                keep,
                max_cache_size,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// CONFIG file I/O
// ------------------------------------------------------------------------------------------------

fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILENAME)
}

/// Atomically writes the CONFIG file under `root`.
///
/// Layout: `[TsdbConfig][crc32_le]` where the checksum covers the
/// encoded struct.
pub fn write_config(root: &Path, cfg: &TsdbConfig) -> Result<(), ConfigError> {
    let payload = encoding::encode_to_vec(cfg)?;

    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();

    let final_path = config_path(root);
    let tmp_path = final_path.with_extension("tmp");

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&payload)?;
    file.write_all(&checksum.to_le_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, &final_path)?;

    if let Ok(dir) = File::open(root) {
        dir.sync_all()?;
    }

    info!(path = %final_path.display(), "wrote CONFIG");
    Ok(())
}

/// Reads and validates the CONFIG file under `root`.
pub fn read_config(root: &Path) -> Result<TsdbConfig, ConfigError> {
    let path = config_path(root);
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;

    if bytes.len() != CONFIG_ENCODED_SIZE + 4 {
        return Err(ConfigError::Corrupt(format!(
            "CONFIG is {} bytes, expected {}",
            bytes.len(),
            CONFIG_ENCODED_SIZE + 4
        )));
    }

    let (payload, checksum_bytes) = bytes.split_at(CONFIG_ENCODED_SIZE);
    let mut stored = [0u8; 4];
    stored.copy_from_slice(checksum_bytes);
    let stored = u32::from_le_bytes(stored);

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored {
        return Err(ConfigError::Corrupt("CONFIG checksum mismatch".into()));
    }

    let (cfg, _) = TsdbConfig::decode_from(payload)?;
    cfg.validate()?;
    Ok(cfg)
}
