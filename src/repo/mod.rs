//! The repository: top-level object tying the engine together.
//!
//! ## Design Overview
//!
//! A [`Tsdb`] owns the table registry, the shared arena, the file
//! directory, and one background committer thread. Writes are parsed
//! out of submit messages, validated against the registry, and spliced
//! into per-table memtables drawing from the arena. A commit freezes
//! the active generation under the repository mutex and hands the
//! frozen state to the committer over a channel.
//!
//! ## Concurrency Model
//!
//! One mutex guards `RepoInner` (registry + arena + state); a second
//! guards the file directory so the committer can register partitions
//! without touching writer state. The committer thread processes at
//! most one commit at a time; `close` enqueues a shutdown marker
//! behind any in-flight commit and joins, so closing always drains.
//!
//! ## States
//!
//! ```text
//! CONFIGURING --open-success--> ACTIVE
//! ACTIVE --close()---> CLOSED  (keeps files)
//! ACTIVE --destroy()-> CLOSED  (removes files)
//! ```
//!
//! Every user entry point other than `stats` rejects with
//! [`TsdbError::RepoClosed`] once closed.
//!
//! ## Durability
//!
//! A completed `trigger_commit` (freeze observed) followed by the
//! committer finishing establishes durability for all rows written
//! before the freeze. A failed commit keeps the frozen generation; the
//! next `trigger_commit` retries it before freezing anything new.

pub mod submit;

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cache::{Cache, CacheError};
use crate::commit::{self, CommitError, CommitReq, CommitTable};
use crate::config::{self, ConfigError, TsdbConfig};
use crate::fgroup::dir::FileDir;
use crate::fgroup::FileError;
use crate::memtable::{Memtable, MemtableError};
use crate::meta::{Meta, MetaError, TableConfig};
use crate::schema::{Schema, SchemaError};

/// Directory under the repository root holding the file groups.
pub const DATA_DIR: &str = "data";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the repository API.
#[derive(Debug, Error)]
pub enum TsdbError {
    /// Configuration validation or CONFIG file failure.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Table registry failure (unknown table, uid mismatch, bounds).
    #[error("meta error: {0}")]
    Meta(#[from] MetaError),

    /// Memtable failure (including an exhausted arena).
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Arena failure outside the memtable path.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Row / schema validation failure.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// File group I/O or corruption.
    #[error("file group error: {0}")]
    File(#[from] FileError),

    /// Commit pipeline failure.
    #[error("commit error: {0}")]
    Commit(#[from] CommitError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The repository has been closed; terminal.
    #[error("repository is closed")]
    RepoClosed,

    /// A commit is already in flight.
    #[error("a commit is already in progress")]
    CommitInProgress,

    /// Malformed submit message.
    #[error("bad submit message: {0}")]
    BadSubmitMsg(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

/// Repository lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    /// Being opened; not yet accepting operations.
    Configuring,
    /// Accepting operations.
    Active,
    /// Terminal; all user entry points reject.
    Closed,
}

/// Snapshot returned by [`Tsdb::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsdbStats {
    /// Current lifecycle state.
    pub state: RepoState,
    /// Occupied registry slots.
    pub num_tables: usize,
    /// Total arena bytes currently owned.
    pub cache_bytes: usize,
    /// Whether a commit is in flight.
    pub commit_in_flight: bool,
    /// Registered file groups.
    pub file_groups: usize,
}

struct RepoInner {
    state: RepoState,
    cfg: TsdbConfig,
    meta: Meta,
    cache: Cache,
    commit_in_flight: bool,
}

impl RepoInner {
    fn check_active(&self) -> Result<(), TsdbError> {
        match self.state {
            RepoState::Active => Ok(()),
            _ => Err(TsdbError::RepoClosed),
        }
    }
}

enum WorkerMsg {
    Commit(CommitReq),
    Shutdown,
}

// ------------------------------------------------------------------------------------------------
// Tsdb
// ------------------------------------------------------------------------------------------------

/// Handle to an open repository.
pub struct Tsdb {
    inner: Arc<Mutex<RepoInner>>,
    fdir: Arc<Mutex<FileDir>>,
    commit_done: Arc<Condvar>,
    tx: Sender<WorkerMsg>,
    worker: Option<JoinHandle<()>>,
    root: PathBuf,
}

impl Tsdb {
    /// Creates the on-disk layout for a fresh repository: the root and
    /// data directories, the CONFIG file, and an empty META snapshot.
    pub fn create(root: &Path, cfg: &TsdbConfig) -> Result<(), TsdbError> {
        cfg.validate()?;
        fs::create_dir_all(root.join(DATA_DIR))?;
        config::write_config(root, cfg)?;
        Meta::new(cfg.max_tables).save(root)?;
        info!(root = %root.display(), "created repository");
        Ok(())
    }

    /// Opens an existing repository: reads CONFIG, restores the table
    /// registry, scans the file directory (discarding staged files
    /// from an interrupted commit), and starts the committer thread.
    pub fn open(root: &Path) -> Result<Self, TsdbError> {
        let cfg = config::read_config(root)?;
        let meta = Meta::load(root, cfg.max_tables)?;

        let max_groups = (cfg.keep / cfg.days_per_file).max(1) as usize + 3;
        let fdir = FileDir::load(&root.join(DATA_DIR), max_groups)?;

        let inner = Arc::new(Mutex::new(RepoInner {
            state: RepoState::Configuring,
            cache: Cache::new(cfg.max_cache_size as usize),
            cfg,
            meta,
            commit_in_flight: false,
        }));
        let fdir = Arc::new(Mutex::new(fdir));

        let commit_done = Arc::new(Condvar::new());
        let (tx, rx) = unbounded::<WorkerMsg>();
        let worker_inner = Arc::clone(&inner);
        let worker_fdir = Arc::clone(&fdir);
        let worker_cv = Arc::clone(&commit_done);
        let worker = std::thread::Builder::new()
            .name("tsdb-committer".into())
            .spawn(move || committer_loop(rx, worker_inner, worker_fdir, worker_cv))?;

        {
            let mut guard = inner
                .lock()
                .map_err(|_| TsdbError::Internal("repository mutex poisoned".into()))?;
            guard.state = RepoState::Active;
        }

        info!(root = %root.display(), "opened repository");
        Ok(Self {
            inner,
            fdir,
            commit_done,
            tx,
            worker: Some(worker),
            root: root.to_path_buf(),
        })
    }

    /// Blocks until no commit is in flight.
    pub fn wait_commit_idle(&self) -> Result<(), TsdbError> {
        let mut inner = self.lock_inner()?;
        while inner.commit_in_flight {
            inner = self
                .commit_done
                .wait(inner)
                .map_err(|_| TsdbError::Internal("repository mutex poisoned".into()))?;
        }
        Ok(())
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, RepoInner>, TsdbError> {
        self.inner
            .lock()
            .map_err(|_| TsdbError::Internal("repository mutex poisoned".into()))
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    // --------------------------------------------------------------------------------------------
    // Table management
    // --------------------------------------------------------------------------------------------

    /// Registers a table and persists the registry.
    pub fn create_table(&self, table: TableConfig) -> Result<(), TsdbError> {
        let mut inner = self.lock_inner()?;
        inner.check_active()?;
        inner.meta.create(table)?;
        inner.meta.save(&self.root)?;
        Ok(())
    }

    /// Drops a table and persists the registry. Rows already frozen
    /// keep committing; rows on disk become unreachable through this
    /// slot.
    pub fn drop_table(&self, tid: i32, uid: u64) -> Result<(), TsdbError> {
        let mut inner = self.lock_inner()?;
        inner.check_active()?;
        inner.meta.drop_table(tid, uid)?;
        inner.meta.save(&self.root)?;
        Ok(())
    }

    /// Replaces a table's schema with a strictly newer version and
    /// persists the registry.
    pub fn alter_table(&self, tid: i32, uid: u64, schema: Schema) -> Result<(), TsdbError> {
        let mut inner = self.lock_inner()?;
        inner.check_active()?;
        inner.meta.alter(tid, uid, schema)?;
        inner.meta.save(&self.root)?;
        Ok(())
    }

    /// Returns a table's registered definition, or `None` for a free
    /// slot.
    pub fn get_table(&self, tid: i32) -> Result<Option<TableConfig>, TsdbError> {
        let inner = self.lock_inner()?;
        inner.check_active()?;
        Ok(inner.meta.get(tid).map(|t| TableConfig {
            uid: t.uid,
            tid: t.tid,
            kind: t.kind.clone(),
            schema: (*t.schema).clone(),
        }))
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Applies a submit message, returning the number of rows inserted.
    ///
    /// Rows are applied in order; a failing block stops processing but
    /// earlier rows stay inserted (inserts are not transactional
    /// across rows).
    pub fn insert(&self, msg: &[u8]) -> Result<u32, TsdbError> {
        let blocks = submit::parse_submit(msg).map_err(TsdbError::BadSubmitMsg)?;

        let mut inner = self.lock_inner()?;
        inner.check_active()?;
        let RepoInner { meta, cache, .. } = &mut *inner;

        let mut inserted = 0u32;
        for block in blocks {
            let table = meta.validate_for_insert(block.tid, block.uid)?;
            if u32::from(table.schema.version()) != block.sversion {
                return Err(TsdbError::BadSubmitMsg(format!(
                    "block for table {} carries sversion {}, table is at {}",
                    block.tid,
                    block.sversion,
                    table.schema.version()
                )));
            }

            let schema = Arc::clone(&table.schema);
            let seed = table.memtable_seed();
            let mem = table.mem.get_or_insert_with(|| Memtable::new(seed));

            let mut rows_in_block = 0u32;
            for row in block.rows() {
                schema.check_row(row)?;
                mem.insert(cache, row)?;
                rows_in_block += 1;
                inserted += 1;
            }
            if rows_in_block != u32::from(block.num_rows) {
                return Err(TsdbError::BadSubmitMsg(format!(
                    "block declared {} rows but carried {rows_in_block}",
                    block.num_rows
                )));
            }
        }
        Ok(inserted)
    }

    // --------------------------------------------------------------------------------------------
    // Commit
    // --------------------------------------------------------------------------------------------

    /// Freezes the active generation (unless a failed commit left a
    /// frozen one to retry) and hands it to the committer thread.
    ///
    /// Rejects with [`TsdbError::CommitInProgress`] while a commit is
    /// in flight.
    pub fn trigger_commit(&self) -> Result<(), TsdbError> {
        let mut inner = self.lock_inner()?;
        inner.check_active()?;
        if inner.commit_in_flight {
            return Err(TsdbError::CommitInProgress);
        }

        if inner.cache.imem().is_none() {
            let RepoInner { meta, cache, .. } = &mut *inner;
            let pool = cache.freeze()?;
            for table in meta.iter_mut() {
                if let Some(mem) = table.mem.take() {
                    if mem.is_empty() {
                        continue;
                    }
                    table.imem = Some(Arc::new(mem.freeze(Arc::clone(&pool))));
                }
            }
        }

        let req = CommitReq {
            cfg: inner.cfg.clone(),
            data_dir: self.data_dir(),
            tables: inner
                .meta
                .iter()
                .filter_map(|t| {
                    t.imem.as_ref().map(|frozen| CommitTable {
                        tid: t.tid,
                        uid: t.uid,
                        schema: Arc::clone(&t.schema),
                        frozen: Arc::clone(frozen),
                    })
                })
                .collect(),
        };

        inner.commit_in_flight = true;
        drop(inner);

        if self.tx.send(WorkerMsg::Commit(req)).is_err() {
            let mut inner = self.lock_inner()?;
            inner.commit_in_flight = false;
            return Err(TsdbError::Internal("committer thread is gone".into()));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Configuration, retention, stats
    // --------------------------------------------------------------------------------------------

    /// Applies a configuration update. Only `keep` and
    /// `max_cache_size` may change; the CONFIG file is rewritten
    /// atomically before the change takes effect.
    pub fn configure(&self, new: &TsdbConfig) -> Result<(), TsdbError> {
        let mut inner = self.lock_inner()?;
        inner.check_active()?;
        inner.cfg.validate_update(new)?;

        config::write_config(&self.root, new)?;
        inner.cfg = new.clone();
        inner.cache.set_max_bytes(new.max_cache_size as usize);
        info!(keep = new.keep, max_cache_size = new.max_cache_size, "reconfigured repository");
        Ok(())
    }

    /// Retention sweep: removes every file group whose whole time
    /// range is older than `keep` days before `now` (`now` in the
    /// repository's precision). Returns the removed partition ids.
    ///
    /// Rejected while a commit is in flight so the sweep never races a
    /// partition rewrite.
    pub fn retain(&self, now: i64) -> Result<Vec<i64>, TsdbError> {
        let inner = self.lock_inner()?;
        inner.check_active()?;
        if inner.commit_in_flight {
            return Err(TsdbError::CommitInProgress);
        }

        let cutoff = now.saturating_sub(
            (inner.cfg.keep as i64).saturating_mul(inner.cfg.precision.units_per_day()),
        );
        let min_fid = inner.cfg.fid_of(cutoff);

        let mut fdir = self
            .fdir
            .lock()
            .map_err(|_| TsdbError::Internal("file directory mutex poisoned".into()))?;
        Ok(fdir.sweep_expired(min_fid)?)
    }

    /// Point-in-time statistics; usable in any state.
    pub fn stats(&self) -> Result<TsdbStats, TsdbError> {
        let inner = self.lock_inner()?;
        let file_groups = self
            .fdir
            .lock()
            .map_err(|_| TsdbError::Internal("file directory mutex poisoned".into()))?
            .num_groups();
        Ok(TsdbStats {
            state: inner.state,
            num_tables: inner.meta.num_tables(),
            cache_bytes: inner.cache.bytes_held(),
            commit_in_flight: inner.commit_in_flight,
            file_groups,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Closes the repository, committing pending rows first and
    /// draining the committer thread. Files are kept. Idempotent.
    pub fn close(&mut self) -> Result<(), TsdbError> {
        {
            let inner = self.lock_inner()?;
            if inner.state == RepoState::Closed {
                return Ok(());
            }
        }

        // Best-effort final commit; an in-flight one will drain below.
        match self.trigger_commit() {
            Ok(()) | Err(TsdbError::CommitInProgress) => {}
            Err(e) => warn!(error = %e, "final commit on close failed"),
        }

        {
            let mut inner = self.lock_inner()?;
            inner.state = RepoState::Closed;
        }
        self.shutdown_worker();
        info!(root = %self.root.display(), "closed repository");
        Ok(())
    }

    /// Closes the repository and removes its files from disk.
    pub fn destroy(mut self) -> Result<(), TsdbError> {
        {
            let mut inner = self.lock_inner()?;
            inner.state = RepoState::Closed;
        }
        self.shutdown_worker();
        fs::remove_dir_all(&self.root)?;
        info!(root = %self.root.display(), "destroyed repository");
        Ok(())
    }

    fn shutdown_worker(&mut self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Tsdb {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

// ------------------------------------------------------------------------------------------------
// Committer thread
// ------------------------------------------------------------------------------------------------

fn committer_loop(
    rx: crossbeam::channel::Receiver<WorkerMsg>,
    inner: Arc<Mutex<RepoInner>>,
    fdir: Arc<Mutex<FileDir>>,
    commit_done: Arc<Condvar>,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Commit(req) => {
                let result = commit::run(&req, &fdir);
                // Release the frozen handles before publishing so the
                // arena can take its buffers back.
                drop(req);

                let Ok(mut guard) = inner.lock() else {
                    error!("repository mutex poisoned; committer exiting");
                    return;
                };
                match result {
                    Ok(stats) => {
                        for table in guard.meta.iter_mut() {
                            table.imem = None;
                        }
                        guard.cache.reclaim();
                        info!(
                            partitions = stats.partitions,
                            blocks = stats.blocks,
                            rows = stats.rows,
                            "commit published"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "commit failed; frozen state retained for retry");
                    }
                }
                guard.commit_in_flight = false;
                drop(guard);
                commit_done.notify_all();
            }
            WorkerMsg::Shutdown => return,
        }
    }
}
