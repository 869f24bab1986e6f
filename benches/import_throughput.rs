use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use tabular_import::importer::{ImportSettings, Importer};
use tabular_import::loader::{self, LoadOptions};
use tabular_import::memory::MemoryStore;
use tabular_import::row::{RawData, RawRow};
use tabular_import::schema::{Field, FieldType, ReferenceTarget, Schema};
use tabular_import::store::ImportTarget;
use tabular_import::value::Cell;
use tempfile::TempDir;

const SAMPLES: usize = 25;

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("Subject", FieldType::String).required(),
        Field::new("Value", FieldType::Double).required().mv_enabled(),
        Field::new("Sample", FieldType::String).with_lookup(ReferenceTarget::collection("Samples")),
    ])
}

fn store_with_samples() -> MemoryStore {
    let mut store = MemoryStore::new();
    for i in 0..SAMPLES {
        store.add_entity("Samples", &format!("S{i}"), true);
    }
    store
}

fn generate_rows(rows: usize) -> RawData {
    let rows = (0..rows)
        .map(|i| {
            RawRow::new()
                .with("subject", Cell::text(format!("P{i}")))
                .with("value", Cell::double(i as f64 * 0.5))
                .with("Sample", Cell::text(format!("S{}", i % SAMPLES)))
        })
        .collect();
    RawData::from_rows(rows)
}

fn generate_file(rows: usize) -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let path = temp_dir.path().join("plate.tsv");
    let mut file = File::create(&path).expect("create tsv");
    writeln!(file, "Subject\tValue\tSample").expect("header");
    for i in 0..rows {
        writeln!(file, "P{i}\t{}\tS{}", i as f64 * 0.5, i % SAMPLES).expect("row");
    }
    (temp_dir, path)
}

fn bench_import(c: &mut Criterion) {
    let schema = schema();
    let target = ImportTarget::new("bench", "bench", "results");
    let (temp_dir, path) = generate_file(20_000);

    let mut group = c.benchmark_group("import");

    group.bench_function("validate_and_persist_20k", |b| {
        b.iter_batched(
            || (generate_rows(20_000), store_with_samples()),
            |(data, mut store)| {
                Importer::new(&mut store, ImportSettings::default())
                    .run(&schema, data, &target)
                    .expect("import");
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("load_tsv_20k", |b| {
        b.iter(|| loader::load_path(&path, &schema, &LoadOptions::default()).expect("load"));
    });

    drop(temp_dir);
    group.finish();
}

criterion_group!(benches, bench_import);
criterion_main!(benches);
