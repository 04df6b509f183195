use crate::cache::Cache;
use crate::memtable::Memtable;
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
                ty: ColType::Int,
            },
        ],
    )
    .unwrap()
}

#[test]
fn frozen_memtable_is_readable_after_swap() {
    let schema = schema();
    let mut cache = Cache::new(4 * 1024 * 1024);
    let mut memtable = Memtable::new(1);

    for ts in [3i64, 1, 2] {
        let row = schema.build_row(ts, &(ts as i32).to_le_bytes()).unwrap();
        memtable.insert(&mut cache, &row).unwrap();
    }

    let pool = cache.freeze().unwrap();
    let frozen = memtable.freeze(pool);

    assert_eq!(frozen.num_points(), 3);
    assert_eq!(frozen.key_first(), 1);
    assert_eq!(frozen.key_last(), 3);

    let keys: Vec<i64> = frozen.iter().map(row_ts).collect();
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn writes_after_freeze_land_in_new_generation() {
    let schema = schema();
    let mut cache = Cache::new(8 * 1024 * 1024);
    let mut memtable = Memtable::new(2);

    let row = schema.build_row(10, &1i32.to_le_bytes()).unwrap();
    memtable.insert(&mut cache, &row).unwrap();

    let pool = cache.freeze().unwrap();
    let frozen = memtable.freeze(pool);

    // A fresh memtable for the table, fed from the new generation.
    let mut fresh = Memtable::new(2);
    let row = schema.build_row(20, &2i32.to_le_bytes()).unwrap();
    fresh.insert(&mut cache, &row).unwrap();

    let frozen_keys: Vec<i64> = frozen.iter().map(row_ts).collect();
    let fresh_keys: Vec<i64> = fresh.iter(cache.mem()).map(row_ts).collect();
    assert_eq!(frozen_keys, vec![10]);
    assert_eq!(fresh_keys, vec![20]);
}
