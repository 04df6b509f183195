use tempfile::TempDir;

use super::submit::SubmitBuilder;
use super::*;
use crate::meta::TableKind;
use crate::schema::{ColType, ColumnDef};

fn test_config() -> TsdbConfig {
    TsdbConfig {
        days_per_file: 1,
        min_rows_per_file_block: 10,
        max_rows_per_file_block: 200,
        ..TsdbConfig::default()
    }
}

fn test_schema(version: u16) -> Schema {
    Schema::new(
        version,
        vec![
            ColumnDef {
                id: 0,
                ty: ColType::Timestamp,
            },
            ColumnDef {
                id: 1,
                ty: ColType::BigInt,
            },
        ],
    )
    .unwrap()
}

fn open_with_table(dir: &TempDir) -> Tsdb {
    Tsdb::create(dir.path(), &test_config()).unwrap();
    let tsdb = Tsdb::open(dir.path()).unwrap();
    tsdb.create_table(TableConfig {
        uid: 42,
        tid: 0,
        kind: TableKind::Normal,
        schema: test_schema(1),
    })
    .unwrap();
    tsdb
}

fn submit_keys(uid: u64, tid: i32, keys: &[i64]) -> Vec<u8> {
    let schema = test_schema(1);
    let rows: Vec<Vec<u8>> = keys
        .iter()
        .map(|ts| schema.build_row(*ts, &ts.to_le_bytes()).unwrap())
        .collect();
    let mut builder = SubmitBuilder::new();
    builder.add_block(uid, tid, 1, &rows);
    builder.finish()
}

#[test]
fn create_open_close_lifecycle() {
    let dir = TempDir::new().unwrap();
    Tsdb::create(dir.path(), &test_config()).unwrap();

    let mut tsdb = Tsdb::open(dir.path()).unwrap();
    assert_eq!(tsdb.stats().unwrap().state, RepoState::Active);

    tsdb.close().unwrap();
    tsdb.close().unwrap(); // idempotent
    assert_eq!(tsdb.stats().unwrap().state, RepoState::Closed);

    assert!(matches!(
        tsdb.insert(&submit_keys(1, 0, &[1])),
        Err(TsdbError::RepoClosed)
    ));
    assert!(matches!(tsdb.trigger_commit(), Err(TsdbError::RepoClosed)));
}

#[test]
fn create_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let cfg = TsdbConfig {
        max_tables: 1,
        ..test_config()
    };
    assert!(matches!(
        Tsdb::create(dir.path(), &cfg),
        Err(TsdbError::Config(_))
    ));
    // No side effects.
    assert!(!dir.path().join(crate::config::CONFIG_FILENAME).exists());
}

#[test]
fn insert_and_commit_round_trip() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);

    let inserted = tsdb.insert(&submit_keys(42, 0, &[1, 2, 3])).unwrap();
    assert_eq!(inserted, 3);

    tsdb.trigger_commit().unwrap();
    tsdb.wait_commit_idle().unwrap();

    let stats = tsdb.stats().unwrap();
    assert!(!stats.commit_in_flight);
    assert_eq!(stats.file_groups, 1);
    assert!(dir.path().join("data/f0.head").exists());
    assert!(dir.path().join("data/f0.data").exists());
    assert!(dir.path().join("data/f0.last").exists());
}

#[test]
fn insert_validation_errors() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);

    // Unknown table.
    assert!(matches!(
        tsdb.insert(&submit_keys(42, 1, &[1])),
        Err(TsdbError::Meta(MetaError::Unknown(1)))
    ));

    // Uid mismatch.
    assert!(matches!(
        tsdb.insert(&submit_keys(7, 0, &[1])),
        Err(TsdbError::Meta(MetaError::UidMismatch { .. }))
    ));

    // Out-of-bounds tid.
    assert!(matches!(
        tsdb.insert(&submit_keys(42, 100_000, &[1])),
        Err(TsdbError::Meta(MetaError::OutOfBounds { .. }))
    ));

    // Garbage message.
    assert!(matches!(
        tsdb.insert(&[0u8; 3]),
        Err(TsdbError::BadSubmitMsg(_))
    ));
}

#[test]
fn stale_schema_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);
    tsdb.alter_table(0, 42, test_schema(2)).unwrap();

    // Message still built against version 1.
    assert!(matches!(
        tsdb.insert(&submit_keys(42, 0, &[1])),
        Err(TsdbError::BadSubmitMsg(_))
    ));
}

#[test]
fn commit_in_progress_is_rejected() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);
    tsdb.insert(&submit_keys(42, 0, &[1, 2])).unwrap();

    // Pin the flag to make the race deterministic.
    tsdb.inner.lock().unwrap().commit_in_flight = true;
    assert!(matches!(
        tsdb.trigger_commit(),
        Err(TsdbError::CommitInProgress)
    ));
    assert!(matches!(tsdb.retain(i64::MAX), Err(TsdbError::CommitInProgress)));
    tsdb.inner.lock().unwrap().commit_in_flight = false;

    tsdb.trigger_commit().unwrap();
    tsdb.wait_commit_idle().unwrap();
}

#[test]
fn cache_exhaustion_recovers_after_commit() {
    let dir = TempDir::new().unwrap();
    let cfg = TsdbConfig {
        max_cache_size: 4 * 1024 * 1024,
        ..test_config()
    };
    Tsdb::create(dir.path(), &cfg).unwrap();
    let tsdb = Tsdb::open(dir.path()).unwrap();
    tsdb.create_table(TableConfig {
        uid: 42,
        tid: 0,
        kind: TableKind::Normal,
        schema: test_schema(1),
    })
    .unwrap();

    // Stream rows until the arena refuses.
    let mut ts = 0i64;
    let full = loop {
        let keys: Vec<i64> = (ts..ts + 1000).collect();
        ts += 1000;
        match tsdb.insert(&submit_keys(42, 0, &keys)) {
            Ok(_) => {}
            Err(TsdbError::Memtable(MemtableError::Cache(CacheError::CacheFull))) => break true,
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(ts < 10_000_000, "cache never filled");
    };
    assert!(full);

    // Repository stays usable: a commit drains the frozen generation
    // and inserts resume.
    assert_eq!(tsdb.stats().unwrap().state, RepoState::Active);
    tsdb.trigger_commit().unwrap();
    tsdb.wait_commit_idle().unwrap();

    tsdb.insert(&submit_keys(42, 0, &[ts, ts + 1])).unwrap();
}

#[test]
fn reopen_restores_tables_and_config() {
    let dir = TempDir::new().unwrap();
    {
        let mut tsdb = open_with_table(&dir);
        tsdb.insert(&submit_keys(42, 0, &[1, 2, 3])).unwrap();
        tsdb.close().unwrap();
    }

    let tsdb = Tsdb::open(dir.path()).unwrap();
    let stats = tsdb.stats().unwrap();
    assert_eq!(stats.num_tables, 1);
    // Close committed the pending rows.
    assert_eq!(stats.file_groups, 1);

    // The restored registry still validates identity.
    tsdb.insert(&submit_keys(42, 0, &[4])).unwrap();
    assert!(matches!(
        tsdb.insert(&submit_keys(9, 0, &[5])),
        Err(TsdbError::Meta(MetaError::UidMismatch { .. }))
    ));
}

#[test]
fn configure_updates_only_mutable_fields() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);

    let updated = TsdbConfig {
        keep: 30,
        max_cache_size: 32 * 1024 * 1024,
        ..test_config()
    };
    tsdb.configure(&updated).unwrap();
    assert_eq!(crate::config::read_config(dir.path()).unwrap().keep, 30);

    let bad = TsdbConfig {
        days_per_file: 2,
        ..test_config()
    };
    assert!(matches!(tsdb.configure(&bad), Err(TsdbError::Config(_))));
}

#[test]
fn retention_sweep_drops_expired_partitions() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);

    tsdb.insert(&submit_keys(42, 0, &[1, 2])).unwrap();
    tsdb.trigger_commit().unwrap();
    tsdb.wait_commit_idle().unwrap();
    assert_eq!(tsdb.stats().unwrap().file_groups, 1);

    // Partition 0 covers day 0; keep = 3650 days. A "now" far enough
    // in the future expires it.
    let day = crate::config::Precision::Milli.units_per_day();
    let removed = tsdb.retain(4000 * day).unwrap();
    assert_eq!(removed, vec![0]);
    assert_eq!(tsdb.stats().unwrap().file_groups, 0);
    assert!(!dir.path().join("data/f0.head").exists());
}

#[test]
fn destroy_removes_the_repository() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);
    tsdb.insert(&submit_keys(42, 0, &[1])).unwrap();

    tsdb.destroy().unwrap();
    assert!(!dir.path().exists());
}

#[test]
fn get_table_returns_the_definition() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);

    let def = tsdb.get_table(0).unwrap().unwrap();
    assert_eq!(def.uid, 42);
    assert_eq!(def.kind, TableKind::Normal);
    assert_eq!(def.schema.version(), 1);

    assert!(tsdb.get_table(1).unwrap().is_none());
}

#[test]
fn multi_block_message_applies_in_order() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);
    tsdb.create_table(TableConfig {
        uid: 7,
        tid: 1,
        kind: TableKind::Child {
            super_uid: 42,
            tags: vec![1],
        },
        schema: test_schema(1),
    })
    .unwrap();

    let schema = test_schema(1);
    let rows_a: Vec<Vec<u8>> = [1i64, 2]
        .iter()
        .map(|ts| schema.build_row(*ts, &ts.to_le_bytes()).unwrap())
        .collect();
    let rows_b: Vec<Vec<u8>> = [5i64]
        .iter()
        .map(|ts| schema.build_row(*ts, &ts.to_le_bytes()).unwrap())
        .collect();

    let mut builder = SubmitBuilder::new();
    builder.add_block(42, 0, 1, &rows_a);
    builder.add_block(7, 1, 1, &rows_b);
    let inserted = tsdb.insert(&builder.finish()).unwrap();
    assert_eq!(inserted, 3);
}

#[test]
fn failing_block_keeps_earlier_rows() {
    let dir = TempDir::new().unwrap();
    let tsdb = open_with_table(&dir);

    let schema = test_schema(1);
    let good: Vec<Vec<u8>> = vec![schema.build_row(1, &1i64.to_le_bytes()).unwrap()];

    let mut builder = SubmitBuilder::new();
    builder.add_block(42, 0, 1, &good);
    builder.add_block(9, 0, 1, &good); // uid mismatch fails this block
    let err = tsdb.insert(&builder.finish()).unwrap_err();
    assert!(matches!(err, TsdbError::Meta(MetaError::UidMismatch { .. })));

    // The first block's row survived and commits.
    tsdb.trigger_commit().unwrap();
    tsdb.wait_commit_idle().unwrap();
    assert_eq!(tsdb.stats().unwrap().file_groups, 1);
}
