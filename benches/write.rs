//! Micro-benchmarks for the write path.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench write            # run all benchmarks
//! cargo bench --bench write -- insert  # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tempfile::TempDir;
use tempusdb::{
    ColType, ColumnDef, Schema, SubmitBuilder, TableConfig, TableKind, Tsdb, TsdbConfig,
};

fn bench_schema() -> Schema {
    Schema::new(
        1,
        vec![
            ColumnDef {
                id: 0,
                ty: ColType::Timestamp,
            },
            ColumnDef {
                id: 1,
                ty: ColType::Double,
            },
        ],
    )
    .unwrap()
}

fn open_repo(dir: &TempDir) -> Tsdb {
    let cfg = TsdbConfig {
        days_per_file: 1,
        max_cache_size: 256 * 1024 * 1024,
        ..TsdbConfig::default()
    };
    Tsdb::create(dir.path(), &cfg).expect("create");
    let tsdb = Tsdb::open(dir.path()).expect("open");
    tsdb.create_table(TableConfig {
        uid: 1,
        tid: 0,
        kind: TableKind::Normal,
        schema: bench_schema(),
    })
    .expect("create table");
    tsdb
}

/// Builds one submit message with `n` consecutive rows starting at `ts`.
fn build_msg(schema: &Schema, ts: i64, n: usize) -> Vec<u8> {
    let rows: Vec<Vec<u8>> = (0..n as i64)
        .map(|i| {
            schema
                .build_row(ts + i, &(i as f64).to_le_bytes())
                .expect("row")
        })
        .collect();
    let mut msg = SubmitBuilder::new();
    msg.add_block(1, 0, 1, &rows);
    msg.finish()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(100));

    group.bench_function("100_rows_per_message", |b| {
        let dir = TempDir::new().unwrap();
        let tsdb = open_repo(&dir);
        let schema = bench_schema();
        let mut ts = 0i64;
        b.iter(|| {
            let msg = build_msg(&schema, ts, 100);
            ts += 100;
            black_box(tsdb.insert(&msg).expect("insert"));
        });
    });

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    group.sample_size(10);
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("10k_rows", |b| {
        let schema = bench_schema();
        let mut epoch = 0i64;
        b.iter(|| {
            let dir = TempDir::new().unwrap();
            let tsdb = open_repo(&dir);
            for batch in 0..10 {
                let msg = build_msg(&schema, epoch + batch * 1000, 1000);
                tsdb.insert(&msg).expect("insert");
            }
            epoch += 10_000;
            tsdb.trigger_commit().expect("trigger");
            tsdb.wait_commit_idle().expect("wait");
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_commit);
criterion_main!(benches);
