//! # TempusDB
//!
//! An embeddable time-series storage engine. Ordered rows of
//! fixed-schema records, keyed by a monotonic timestamp, are buffered
//! in per-table memtables and durably promoted by a background commit
//! into time-partitioned on-disk file groups optimized for range
//! scans.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Tsdb                             │
//! │  ┌───────────┐   ┌─────────────┐   ┌────────────────┐  │
//! │  │  Meta     │   │   Cache     │   │  File groups   │  │
//! │  │ (tables)  │   │ mem / imem  │   │ .head/.data/   │  │
//! │  │  + mem-   │   │  (arena)    │   │ .last per fid  │  │
//! │  │  tables   │   └──────┬──────┘   └───────┬────────┘  │
//! │  └─────┬─────┘          │ freeze           │           │
//! │        └────────────────┴──►  Commit  ─────┘           │
//! │                          (background thread)           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`repo`] | Repository facade — open, insert, trigger commits, configure |
//! | [`meta`] | Table registry mapping `(uid, tid)` to schema and memtables |
//! | [`cache`] | Shared arena with active / frozen generations |
//! | [`memtable`] | Arena-backed per-table skiplist ordered by timestamp |
//! | [`commit`] | Background pipeline merging frozen rows into file groups |
//! | [`fgroup`] | File-group on-disk format, loaders, writers, directory |
//! | [`schema`] | Column types, row codec, row ↔ column conversion |
//! | [`config`] | Configuration bounds and the CONFIG file |
//! | [`encoding`] | Byte-stable binary encoding for on-disk structures |
//!
//! ## Key Properties
//!
//! - **Two-stage write path** — writes land in memtables; an explicit
//!   commit freezes a whole generation atomically and rewrites only
//!   the affected partitions.
//! - **Last writer wins** — duplicate timestamps replace the prior
//!   row, both in memory and during on-disk merges.
//! - **Crash safety** — partition rewrites stage replacement files and
//!   rename them into place (`.last` before `.head`); an interrupted
//!   commit leaves the old state and is retried from the retained
//!   frozen generation.
//! - **Bounded memory** — all memtable nodes come from one capped
//!   arena; exhaustion fails writes with `CacheFull` until a commit
//!   drains the frozen generation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tempusdb::{
//!     ColType, ColumnDef, Schema, SubmitBuilder, TableConfig, TableKind, Tsdb, TsdbConfig,
//! };
//!
//! let cfg = TsdbConfig::default();
//! Tsdb::create("/tmp/tempusdb".as_ref(), &cfg).unwrap();
//! let tsdb = Tsdb::open("/tmp/tempusdb".as_ref()).unwrap();
//!
//! // One table: (timestamp, double).
//! let schema = Schema::new(
//!     1,
//!     vec![
//!         ColumnDef { id: 0, ty: ColType::Timestamp },
//!         ColumnDef { id: 1, ty: ColType::Double },
//!     ],
//! )
//! .unwrap();
//! tsdb.create_table(TableConfig {
//!     uid: 1,
//!     tid: 0,
//!     kind: TableKind::Normal,
//!     schema: schema.clone(),
//! })
//! .unwrap();
//!
//! // Write a row and make it durable.
//! let row = schema.build_row(1_700_000_000_000, &4.2f64.to_le_bytes()).unwrap();
//! let mut msg = SubmitBuilder::new();
//! msg.add_block(1, 0, 1, &[row]);
//! tsdb.insert(&msg.finish()).unwrap();
//! tsdb.trigger_commit().unwrap();
//! tsdb.wait_commit_idle().unwrap();
//! ```

pub mod cache;
pub mod commit;
pub mod config;
pub mod encoding;
pub mod fgroup;
pub mod memtable;
pub mod meta;
pub mod repo;
pub mod schema;

pub use config::{Precision, TsdbConfig};
pub use meta::{TableConfig, TableKind};
pub use repo::submit::SubmitBuilder;
pub use repo::{RepoState, Tsdb, TsdbError, TsdbStats};
pub use schema::{ColType, ColumnDef, Schema};
