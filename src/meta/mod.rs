//! Table registry.
//!
//! Maps the dense table-id space `0..max_tables` to table handles.
//! Each handle carries the table identity (`uid`, `tid`), its kind,
//! the schema, and the table's active and frozen memtables.
//!
//! Definitions are persisted to a `META` snapshot (full rewrite via
//! tmp → fsync → rename, trailing CRC32) on every create / drop /
//! alter, so `open` can rebuild the registry. Memtables are runtime
//! state and are never persisted — durability of row data is the
//! commit pipeline's job.


use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::memtable::{FrozenMemtable, Memtable};
use crate::schema::{Schema, SchemaError};

/// File name of the table registry snapshot under the repository root.
pub const META_FILENAME: &str = "META";

const META_MAGIC: [u8; 4] = *b"TSME";
const META_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// `tid` is outside `0..max_tables`.
    #[error("table id {tid} out of bounds (max_tables = {max_tables})")]
    OutOfBounds {
        /// Requested table id.
        tid: i32,
        /// Configured table space.
        max_tables: i32,
    },

    /// No table occupies the slot.
    #[error("unknown table {0}")]
    Unknown(i32),

    /// The slot is occupied and the caller's uid does not match.
    #[error("uid mismatch for table {tid}: expected {expected}, got {got}")]
    UidMismatch {
        /// Table id.
        tid: i32,
        /// Registered uid.
        expected: u64,
        /// Caller-supplied uid.
        got: u64,
    },

    /// A table already occupies the slot.
    #[error("table {0} already exists")]
    Exists(i32),

    /// An altered schema must carry a strictly newer version.
    #[error("schema version {got} is not newer than {current}")]
    VersionNotNewer {
        /// Registered schema version.
        current: u16,
        /// Proposed schema version.
        got: u16,
    },

    /// Invalid schema definition.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The META snapshot failed checksum or structural validation.
    #[error("corrupt META file: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Table definitions
// ------------------------------------------------------------------------------------------------

/// The two table variants. They share the whole write path and differ
/// only in tag metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKind {
    /// Plain table.
    Normal,
    /// Child table of a super table, carrying its tag values.
    Child {
        /// Uid of the super table this child belongs to.
        super_uid: u64,
        /// Opaque encoded tag values.
        tags: Vec<u8>,
    },
}

/// Definition used to create a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Opaque user-assigned id; must match on every insert.
    pub uid: u64,
    /// Dense index into the registry.
    pub tid: i32,
    /// Table variant.
    pub kind: TableKind,
    /// Column layout.
    pub schema: Schema,
}

/// A registered table and its runtime state.
pub struct TableHandle {
    /// Opaque user-assigned id.
    pub uid: u64,
    /// Dense index into the registry.
    pub tid: i32,
    /// Table variant.
    pub kind: TableKind,
    /// Column layout, shared with the commit pipeline.
    pub schema: Arc<Schema>,
    /// Active memtable; created lazily on first insert.
    pub mem: Option<Memtable>,
    /// Frozen memtable owned jointly with the in-flight commit.
    pub imem: Option<Arc<FrozenMemtable>>,
}

impl TableHandle {
    /// Seed for this table's skiplist level sampling.
    pub fn memtable_seed(&self) -> u64 {
        self.uid ^ ((self.tid as u64) << 32)
    }
}

impl Encode for TableKind {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            TableKind::Normal => 0u8.encode_to(buf),
            TableKind::Child { super_uid, tags } => {
                1u8.encode_to(buf)?;
                super_uid.encode_to(buf)?;
                tags.encode_to(buf)
            }
        }
    }
}

impl Decode for TableKind {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut off) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((TableKind::Normal, off)),
            1 => {
                let (super_uid, n) = u64::decode_from(&buf[off..])?;
                off += n;
                let (tags, n) = Vec::<u8>::decode_from(&buf[off..])?;
                off += n;
                Ok((TableKind::Child { super_uid, tags }, off))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "TableKind",
            }),
        }
    }
}

impl Encode for TableConfig {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.uid.encode_to(buf)?;
        self.tid.encode_to(buf)?;
        self.kind.encode_to(buf)?;
        self.schema.encode_to(buf)
    }
}

impl Decode for TableConfig {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (uid, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tid, n) = i32::decode_from(&buf[off..])?;
        off += n;
        let (kind, n) = TableKind::decode_from(&buf[off..])?;
        off += n;
        let (schema, n) = Schema::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                uid,
                tid,
                kind,
                schema,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Meta
// ------------------------------------------------------------------------------------------------

/// The registry: a sparse array of table handles indexed by `tid`.
pub struct Meta {
    tables: Vec<Option<TableHandle>>,
}

impl Meta {
    /// Creates an empty registry sized for `max_tables`.
    pub fn new(max_tables: i32) -> Self {
        let mut tables = Vec::with_capacity(max_tables as usize);
        tables.resize_with(max_tables as usize, || None);
        Self { tables }
    }

    /// Configured table space.
    pub fn max_tables(&self) -> i32 {
        self.tables.len() as i32
    }

    /// Number of occupied slots.
    pub fn num_tables(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    fn check_bounds(&self, tid: i32) -> Result<usize, MetaError> {
        if tid < 0 || tid as usize >= self.tables.len() {
            return Err(MetaError::OutOfBounds {
                tid,
                max_tables: self.max_tables(),
            });
        }
        Ok(tid as usize)
    }

    /// Installs a table. The slot must be free.
    pub fn create(&mut self, cfg: TableConfig) -> Result<(), MetaError> {
        let slot = self.check_bounds(cfg.tid)?;
        if self.tables[slot].is_some() {
            return Err(MetaError::Exists(cfg.tid));
        }

        info!(tid = cfg.tid, uid = cfg.uid, "creating table");
        self.tables[slot] = Some(TableHandle {
            uid: cfg.uid,
            tid: cfg.tid,
            kind: cfg.kind,
            schema: Arc::new(cfg.schema),
            mem: None,
            imem: None,
        });
        Ok(())
    }

    /// Frees a slot. In-flight commit state is unaffected: the
    /// committer works from the frozen handles it captured at freeze
    /// time.
    pub fn drop_table(&mut self, tid: i32, uid: u64) -> Result<(), MetaError> {
        let slot = self.check_bounds(tid)?;
        let table = self.tables[slot].as_ref().ok_or(MetaError::Unknown(tid))?;
        if table.uid != uid {
            return Err(MetaError::UidMismatch {
                tid,
                expected: table.uid,
                got: uid,
            });
        }

        info!(tid, uid, "dropping table");
        self.tables[slot] = None;
        Ok(())
    }

    /// Replaces a table's schema with a strictly newer version.
    pub fn alter(&mut self, tid: i32, uid: u64, schema: Schema) -> Result<(), MetaError> {
        let slot = self.check_bounds(tid)?;
        let table = self.tables[slot].as_mut().ok_or(MetaError::Unknown(tid))?;
        if table.uid != uid {
            return Err(MetaError::UidMismatch {
                tid,
                expected: table.uid,
                got: uid,
            });
        }
        if schema.version() <= table.schema.version() {
            return Err(MetaError::VersionNotNewer {
                current: table.schema.version(),
                got: schema.version(),
            });
        }

        debug!(tid, version = schema.version(), "altering table schema");
        table.schema = Arc::new(schema);
        Ok(())
    }

    /// Returns the handle iff the slot is occupied and the uid matches.
    pub fn validate_for_insert(&mut self, tid: i32, uid: u64) -> Result<&mut TableHandle, MetaError> {
        let slot = self.check_bounds(tid)?;
        let table = self.tables[slot].as_mut().ok_or(MetaError::Unknown(tid))?;
        if table.uid != uid {
            return Err(MetaError::UidMismatch {
                tid,
                expected: table.uid,
                got: uid,
            });
        }
        Ok(table)
    }

    /// Read-only lookup.
    pub fn get(&self, tid: i32) -> Option<&TableHandle> {
        self.tables.get(tid as usize).and_then(|t| t.as_ref())
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, tid: i32) -> Option<&mut TableHandle> {
        self.tables.get_mut(tid as usize).and_then(|t| t.as_mut())
    }

    /// Iterates occupied slots in `tid` order.
    pub fn iter(&self) -> impl Iterator<Item = &TableHandle> {
        self.tables.iter().filter_map(|t| t.as_ref())
    }

    /// Iterates occupied slots mutably, in `tid` order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TableHandle> {
        self.tables.iter_mut().filter_map(|t| t.as_mut())
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    fn meta_path(root: &Path) -> PathBuf {
        root.join(META_FILENAME)
    }

    /// Atomically rewrites the META snapshot.
    ///
    /// Layout: `[magic][version u32][TableConfig vec][crc32_le]`, the
    /// checksum covering everything before it.
    pub fn save(&self, root: &Path) -> Result<(), MetaError> {
        let mut payload = Vec::new();
        META_MAGIC.encode_to(&mut payload)?;
        META_VERSION.encode_to(&mut payload)?;

        let defs: Vec<TableConfig> = self
            .iter()
            .map(|t| TableConfig {
                uid: t.uid,
                tid: t.tid,
                kind: t.kind.clone(),
                schema: (*t.schema).clone(),
            })
            .collect();
        encoding::encode_vec(&defs, &mut payload)?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let final_path = Self::meta_path(root);
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

        debug!(tables = defs.len(), "wrote META snapshot");
        Ok(())
    }

    /// Rebuilds a registry from the META snapshot. A missing file
    /// yields an empty registry (fresh repository).
    pub fn load(root: &Path, max_tables: i32) -> Result<Self, MetaError> {
        let path = Self::meta_path(root);
        let mut bytes = Vec::new();
        match File::open(&path) {
            Ok(mut file) => file.read_to_end(&mut bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new(max_tables)),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < 12 {
            return Err(MetaError::Corrupt("META too short".into()));
        }
        let (payload, checksum_bytes) = bytes.split_at(bytes.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(checksum_bytes);
        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != u32::from_le_bytes(stored) {
            return Err(MetaError::Corrupt("META checksum mismatch".into()));
        }

        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&payload[off..])?;
        off += n;
        if magic != META_MAGIC {
            return Err(MetaError::Corrupt("bad META magic".into()));
        }
        let (version, n) = u32::decode_from(&payload[off..])?;
        off += n;
        if version != META_VERSION {
            return Err(MetaError::Corrupt(format!("unsupported META version {version}")));
        }
        let (defs, _) = encoding::decode_vec::<TableConfig>(&payload[off..])?;

        let mut meta = Self::new(max_tables);
        for def in defs {
            meta.create(def)?;
        }
        info!(tables = meta.num_tables(), "restored META snapshot");
        Ok(meta)
    }
}
