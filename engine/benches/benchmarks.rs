//! Performance benchmarks for rowset-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rowset_engine::{
    merge_table, primary_key_identity, ColumnDef, Dataset, DatasetSnapshot, FieldType, MergeMode,
    MergeOptions, Row, Table,
};

fn create_test_table() -> Table {
    Table::new("Users")
        .with_column(ColumnDef::key("Id", FieldType::Int))
        .with_column(ColumnDef::new("Name", FieldType::String))
        .with_column(ColumnDef::new("Email", FieldType::String))
        .with_column(ColumnDef::new("Age", FieldType::Int))
}

fn populated(count: i64, suffix: &str) -> Table {
    let mut table = create_test_table();
    for i in 0..count {
        let _ = table.load_row(
            Row::sparse()
                .with("Id", i)
                .with("Name", format!("User {} {}", i, suffix))
                .with("Email", format!("user{}@example.com", i))
                .with("Age", i % 90),
        );
    }
    table
}

fn bench_table_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_operations");

    group.bench_function("load_row", |b| {
        let mut table = create_test_table();
        let mut id = 0i64;

        b.iter(|| {
            id += 1;
            table.load_row(black_box(
                Row::sparse().with("Id", id).with("Name", "Test User"),
            ))
        })
    });

    group.bench_function("set_value", |b| {
        let mut table = populated(1000, "a");
        let mut n = 0i64;

        b.iter(|| {
            n += 1;
            table.set_value(black_box(500), black_box("Age"), n)
        })
    });

    group.bench_function("find_by_key", |b| {
        let table = populated(1000, "a");
        let key = [rowset_engine::Value::Int(500)];

        b.iter(|| table.find(black_box(&key)))
    });

    group.bench_function("query_filtered", |b| {
        let table = populated(1000, "a");

        b.iter(|| {
            table
                .query()
                .filter(|r| r.get("Age").and_then(|v| v.as_i64()).is_some_and(|a| a > 40))
                .count()
        })
    });

    group.bench_function("primary_key_identity", |b| {
        let row = Row::sparse().with("A", 7).with("B", "AB");

        b.iter(|| primary_key_identity(black_box(&["A", "B"]), black_box(&row)))
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for size in [100i64, 1000, 5000] {
        let current = populated(size, "a");
        let refreshed = populated(size, "b");
        let options = MergeOptions::new();

        for mode in [
            MergeMode::Replace,
            MergeMode::RefreshIfNoChangesExist,
            MergeMode::RefreshPreservingLocalChanges,
        ] {
            group.bench_with_input(
                BenchmarkId::new(mode.to_string(), size),
                &size,
                |b, _| {
                    b.iter_batched(
                        || current.clone(),
                        |mut table| merge_table(&mut table, black_box(&refreshed), mode, &options),
                        criterion::BatchSize::LargeInput,
                    )
                },
            );
        }

        group.bench_with_input(BenchmarkId::new("PostSave", size), &size, |b, _| {
            let mut edited = current.clone();
            for i in (0..edited.len()).step_by(10) {
                let _ = edited.set_value(i, "Name", "edited");
            }
            let echoed = edited.clone();

            b.iter_batched(
                || edited.clone(),
                |mut table| merge_table(&mut table, black_box(&echoed), MergeMode::PostSave, &options),
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100i64, 1000, 10000] {
        let ds = Dataset::new("bench").with_table(populated(size, "a"));

        group.bench_with_input(BenchmarkId::new("export", size), &size, |b, _| {
            b.iter(|| ds.export_snapshot().to_json())
        });

        let json = ds.export_snapshot().to_json().unwrap_or_default();
        group.bench_with_input(BenchmarkId::new("import", size), &size, |b, _| {
            b.iter(|| {
                DatasetSnapshot::from_json(black_box(&json)).and_then(Dataset::import_snapshot)
            })
        });
    }

    group.finish();
}

fn bench_changeset(c: &mut Criterion) {
    let mut group = c.benchmark_group("changeset");

    group.bench_function("changeset_10pct_dirty", |b| {
        let mut table = populated(1000, "a");
        for i in (0..table.len()).step_by(10) {
            let _ = table.set_value(i, "Email", "changed@example.com");
        }
        let ds = Dataset::new("bench").with_table(table);

        b.iter(|| black_box(&ds).changeset())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_table_operations,
    bench_merge,
    bench_snapshot,
    bench_changeset,
);
criterion_main!(benches);
