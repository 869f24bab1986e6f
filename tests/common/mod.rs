#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tabular_import::{
    row::{RawData, RawRow},
    schema::{Field, FieldType, ReferenceTarget, Schema},
    store::ImportTarget,
    value::Cell,
};
use tempfile::{TempDir, tempdir};

pub const RESULTS_SCHEMA: &str = r#"
fields:
  - name: Subject
    datatype: string
    aliases: [ptid]
    required: true
  - name: Value
    datatype: double
    required: true
    mv_enabled: true
  - name: Sample
    datatype: string
    lookup:
      collection: Samples
"#;

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }
}

pub fn target() -> ImportTarget {
    ImportTarget::new("lab", "tester", "results")
}

/// Subject (required), Value (required, MV-enabled double), Sample (lookup by name).
pub fn results_schema() -> Schema {
    Schema::new(vec![
        Field::new("Subject", FieldType::String)
            .required()
            .with_aliases(["ptid"]),
        Field::new("Value", FieldType::Double).required().mv_enabled(),
        Field::new("Sample", FieldType::String).with_lookup(ReferenceTarget::collection("Samples")),
    ])
}

pub fn result_row(subject: &str, value: Cell, sample: Option<&str>) -> RawRow {
    let row = RawRow::new()
        .with("Subject", Cell::text(subject))
        .with("Value", value);
    match sample {
        Some(sample) => row.with("Sample", Cell::text(sample)),
        None => row.with("Sample", Cell::Missing),
    }
}

pub fn batch(rows: Vec<RawRow>) -> RawData {
    RawData::from_rows(rows)
}
