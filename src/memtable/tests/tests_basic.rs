use crate::cache::Cache;
use crate::memtable::{Memtable, MemtableError};
use crate::schema::{row_ts, ColType, ColumnDef, Schema};

fn schema() -> Schema {
    Schema::new(
        1,
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

fn row(schema: &Schema, ts: i64, value: i64) -> Vec<u8> {
    schema.build_row(ts, &value.to_le_bytes()).unwrap()
}

fn value_of(row: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&row[10..18]);
    i64::from_le_bytes(bytes)
}

#[test]
fn insert_keeps_timestamp_order() {
    let schema = schema();
    let mut cache = Cache::new(4 * 1024 * 1024);
    let mut memtable = Memtable::new(1);

    for ts in [50i64, 10, 40, 20, 30] {
        memtable.insert(&mut cache, &row(&schema, ts, ts * 2)).unwrap();
    }

    let keys: Vec<i64> = memtable.iter(cache.mem()).map(row_ts).collect();
    assert_eq!(keys, vec![10, 20, 30, 40, 50]);

    assert_eq!(memtable.key_first(), 10);
    assert_eq!(memtable.key_last(), 50);
    assert_eq!(memtable.num_points(), 5);
}

#[test]
fn duplicate_timestamp_is_an_update() {
    let schema = schema();
    let mut cache = Cache::new(4 * 1024 * 1024);
    let mut memtable = Memtable::new(2);

    memtable.insert(&mut cache, &row(&schema, 100, 1)).unwrap();
    memtable.insert(&mut cache, &row(&schema, 100, 2)).unwrap();

    assert_eq!(memtable.num_points(), 1);
    let rows: Vec<&[u8]> = memtable.iter(cache.mem()).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(value_of(rows[0]), 2);
}

#[test]
fn many_rows_stay_sorted() {
    let schema = schema();
    let mut cache = Cache::new(16 * 1024 * 1024);
    let mut memtable = Memtable::new(3);

    // Insert in a scrambled but deterministic order.
    let mut keys: Vec<i64> = (0..2000).collect();
    for i in 0..keys.len() {
        let j = (i * 7919) % keys.len();
        keys.swap(i, j);
    }
    for ts in &keys {
        memtable.insert(&mut cache, &row(&schema, *ts, *ts)).unwrap();
    }

    let got: Vec<i64> = memtable.iter(cache.mem()).map(row_ts).collect();
    let want: Vec<i64> = (0..2000).collect();
    assert_eq!(got, want);
    assert_eq!(memtable.num_points(), 2000);
}

#[test]
fn malformed_row_is_rejected() {
    let mut cache = Cache::new(4 * 1024 * 1024);
    let mut memtable = Memtable::new(4);

    // Self-described length disagrees with the buffer.
    let mut bad = vec![0u8; 18];
    bad[0..2].copy_from_slice(&99u16.to_le_bytes());

    let err = memtable.insert(&mut cache, &bad).unwrap_err();
    assert!(matches!(err, MemtableError::BadRow(_)));
    assert!(memtable.is_empty());
}

#[test]
fn cursor_peek_and_advance() {
    let schema = schema();
    let mut cache = Cache::new(4 * 1024 * 1024);
    let mut memtable = Memtable::new(5);

    for ts in [1i64, 2, 3] {
        memtable.insert(&mut cache, &row(&schema, ts, 0)).unwrap();
    }

    let mut iter = memtable.iter(cache.mem());
    assert_eq!(iter.peek_ts(), Some(1));
    assert!(iter.advance());
    assert_eq!(iter.peek_ts(), Some(2));
    assert!(iter.advance());
    assert_eq!(iter.peek_ts(), Some(3));
    assert!(!iter.advance());
    assert_eq!(iter.get(), None);
}

#[test]
fn negative_timestamps_sort_before_zero() {
    let schema = schema();
    let mut cache = Cache::new(4 * 1024 * 1024);
    let mut memtable = Memtable::new(6);

    for ts in [0i64, -5, 5] {
        memtable.insert(&mut cache, &row(&schema, ts, 0)).unwrap();
    }

    let keys: Vec<i64> = memtable.iter(cache.mem()).map(row_ts).collect();
    assert_eq!(keys, vec![-5, 0, 5]);
    assert_eq!(memtable.key_first(), -5);
}
