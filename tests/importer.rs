mod common;

use std::cell::Cell as Counter;

use anyhow::Result;
use common::{batch, result_row, results_schema, target};
use tabular_import::{
    dimension::{DimensionKey, DimensionResolver, ResolvedContext, StaticDimensionResolver},
    error::ImportError,
    files::{FileHandle, FileResolver},
    importer::{ImportSettings, ImportState, Importer},
    lookup::Entity,
    memory::MemoryStore,
    row::{RawData, RawRow},
    schema::{Field, FieldType, ReferenceTarget, Schema},
    store::StorageError,
    value::Cell,
};

#[derive(Default)]
struct CountingFiles {
    calls: Counter<usize>,
}

impl FileResolver for CountingFiles {
    fn resolve(&self, raw: &str, _container: &str, _field: &Field) -> Result<Option<FileHandle>> {
        self.calls.set(self.calls.get() + 1);
        Ok(Some(FileHandle::new(format!("/files/{raw}"))))
    }
}

/// Derives participant and visit from the specimen id (`<participant>-<visit>`).
struct SpecimenResolver {
    linked: Entity,
}

impl DimensionResolver for SpecimenResolver {
    fn find_target_contexts(&self, reference: &str) -> Result<Vec<String>> {
        Ok(match reference {
            "Study A" => vec!["ctx-a".to_string()],
            "Study B" => vec!["ctx-b1".to_string(), "ctx-b2".to_string()],
            _ => Vec::new(),
        })
    }

    fn resolve(&self, key: &DimensionKey) -> Result<ResolvedContext> {
        let (participant, visit) = key
            .specimen
            .as_deref()
            .and_then(|specimen| specimen.split_once('-'))
            .map(|(participant, visit)| (participant.to_string(), visit.parse::<f64>().ok()))
            .unzip();
        Ok(ResolvedContext {
            participant,
            visit: visit.flatten(),
            date: key.date,
            target_context: key.target_context.clone(),
            linked_entity: key.specimen.as_ref().map(|_| self.linked.clone()),
        })
    }
}

fn sample_store() -> (MemoryStore, Entity) {
    let mut store = MemoryStore::new();
    let sample = store.add_entity("Samples", "S1", true);
    store.add_entity("Samples", "S2", true);
    (store, sample)
}

#[test]
fn case_mismatched_columns_import_cleanly() {
    let schema = Schema::new(vec![
        Field::new("Subject", FieldType::String).required(),
        Field::new("Value", FieldType::Double).required(),
    ]);
    let data = batch(vec![
        RawRow::new()
            .with("subject", Cell::text("P1"))
            .with("value", Cell::double(1.25)),
    ]);
    let mut store = MemoryStore::new();
    let outcome = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, data, &target())
        .expect("import succeeds");

    assert_eq!(outcome.rows.len(), 1);
    assert!(outcome.dropped_columns.is_empty());
    assert_eq!(store.rows()[0].data["Subject"], serde_json::json!("P1"));
    assert_eq!(store.rows()[0].data["Value"], serde_json::json!(1.25));
}

#[test]
fn empty_batch_is_legal_only_when_allowed() {
    let schema = Schema::new(vec![Field::new("Subject", FieldType::String).required()]);
    let mut store = MemoryStore::new();

    let settings = ImportSettings {
        allow_empty_data: true,
        ..ImportSettings::default()
    };
    let outcome = Importer::new(&mut store, settings)
        .run(&schema, RawData::default(), &target())
        .expect("empty batch allowed");
    assert!(outcome.rows.is_empty());
    assert_eq!(outcome.edges, 0);

    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, RawData::default(), &target())
        .unwrap_err();
    assert!(matches!(err, ImportError::EmptyData));
    assert_eq!(err.to_string(), "Data file contained zero data rows");
    assert!(!store.in_transaction());

    let no_fields = Schema::new(Vec::new());
    Importer::new(&mut store, ImportSettings::default())
        .run(&no_fields, RawData::default(), &target())
        .expect("empty catalog accepts empty batch");
}

#[test]
fn sentinel_on_row_three_aborts_whole_batch() {
    let schema = results_schema();
    let rows = (1..=10)
        .map(|n| {
            let value = if n == 3 {
                Cell::Error("abc".to_string())
            } else {
                Cell::double(n as f64)
            };
            result_row(&format!("P{n}"), value, None)
        })
        .collect();
    let mut store = MemoryStore::new();
    let mut importer = Importer::new(&mut store, ImportSettings::default());
    let err = importer.run(&schema, batch(rows), &target()).unwrap_err();
    assert_eq!(importer.state(), ImportState::Aborted);

    let failure = err.row_failure().expect("row failure");
    assert_eq!(failure.row_number, 3);
    assert_eq!(failure.fields(), vec!["Value"]);
    assert_eq!(
        failure.errors[0].message,
        "Value must be of type Number (Double)."
    );
    assert!(store.rows().is_empty());
    assert!(store.edges().is_empty());
}

#[test]
fn first_failing_row_stops_processing() {
    let schema = results_schema();
    let rows = vec![
        result_row("P1", Cell::double(1.0), Some("S1")),
        result_row("  ", Cell::double(2.0), Some("missing-sample")),
        result_row("", Cell::Missing, None),
    ];
    let (mut store, _) = sample_store();
    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(rows), &target())
        .unwrap_err();

    let failure = err.row_failure().expect("row failure");
    assert_eq!(failure.row_number, 2);
    let messages = failure
        .errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        messages,
        vec![
            "Missing value for required property: Subject",
            "Failed to convert 'Sample': missing-sample",
        ]
    );
    assert!(store.rows().is_empty());
}

#[test]
fn repeated_reference_hits_backend_once() {
    let schema = results_schema();
    let rows = vec![
        result_row("P1", Cell::double(1.0), Some("S1")),
        result_row("P2", Cell::double(2.0), Some("s1")),
    ];
    let (mut store, sample) = sample_store();
    let outcome = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(rows), &target())
        .expect("import succeeds");

    assert_eq!(store.name_lookups(), 1);
    assert_eq!((outcome.lookup_hits, outcome.lookup_misses), (1, 1));
    assert_eq!(outcome.edges, 2);
    let edges = store.edges();
    assert_eq!(edges.len(), 2);
    assert!(
        edges
            .iter()
            .all(|stored| stored.edge.input.as_deref() == Some(sample.lsid.as_str()))
    );
    assert_ne!(edges[0].edge.output, edges[1].edge.output);
}

#[test]
fn every_persisted_row_gets_a_provenance_record() {
    let schema = results_schema();
    let rows = vec![
        result_row("P1", Cell::double(1.0), Some("S1")),
        result_row("P2", Cell::double(2.0), None),
        result_row("P3", Cell::double(3.0), None),
    ];
    let (mut store, _) = sample_store();
    let outcome = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(rows), &target())
        .expect("import succeeds");

    for row in &outcome.rows {
        let edges = store
            .edges()
            .iter()
            .filter(|stored| stored.edge.output == row.lsid)
            .collect::<Vec<_>>();
        assert_eq!(edges.len(), 1, "row {}", row.row_id);
    }
    let null_edges = store
        .edges()
        .iter()
        .filter(|stored| stored.edge.input.is_none())
        .count();
    assert_eq!(null_edges, 2);
    assert!(store.edges()[0].output_scope.starts_with("urn:run:"));
}

#[test]
fn empty_file_value_is_stored_as_null_without_resolving() {
    let schema = Schema::new(vec![
        Field::new("Name", FieldType::String),
        Field::new("Image", FieldType::FileLink),
    ]);
    let data = batch(vec![
        RawRow::new()
            .with("Name", Cell::text("a"))
            .with("Image", Cell::text("")),
        RawRow::new()
            .with("Name", Cell::text("b"))
            .with("Image", Cell::text("plate.png")),
    ]);
    let files = CountingFiles::default();
    let mut store = MemoryStore::new();
    Importer::new(&mut store, ImportSettings::default())
        .with_file_resolver(&files)
        .run(&schema, data, &target())
        .expect("import succeeds");

    assert_eq!(files.calls.get(), 1);
    assert_eq!(store.rows()[0].data["Image"], serde_json::Value::Null);
    assert_eq!(store.rows()[1].data["Image"], serde_json::json!("/files/plate.png"));
}

#[test]
fn duplicate_natural_key_is_a_storage_failure() {
    let schema = Schema::new(vec![
        Field::new("Well", FieldType::String).key(),
        Field::new("Value", FieldType::Double),
    ]);
    let data = batch(vec![
        RawRow::new()
            .with("Well", Cell::text("A1"))
            .with("Value", Cell::double(1.0)),
        RawRow::new()
            .with("Well", Cell::text("A1"))
            .with("Value", Cell::double(2.0)),
    ]);
    let mut store = MemoryStore::new();
    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, data, &target())
        .unwrap_err();

    assert!(!err.is_data_error());
    assert!(matches!(
        err,
        ImportError::Storage(StorageError::Constraint(_))
    ));
    assert!(store.rows().is_empty());
    assert!(store.edges().is_empty());
}

#[test]
fn backend_failure_rolls_back() {
    let schema = results_schema();
    let mut store = MemoryStore::new();
    store.fail_inserts_with("disk full");
    let mut importer = Importer::new(&mut store, ImportSettings::default());
    let err = importer
        .run(
            &schema,
            batch(vec![result_row("P1", Cell::double(1.0), None)]),
            &target(),
        )
        .unwrap_err();
    assert_eq!(importer.state(), ImportState::Aborted);
    assert_eq!(err.to_string(), "Storage failure: disk full");
    assert!(!store.in_transaction());
}

#[test]
fn dry_run_reports_rows_but_writes_nothing() {
    let schema = results_schema();
    let settings = ImportSettings {
        dry_run: true,
        ..ImportSettings::default()
    };
    let (mut store, _) = sample_store();
    let outcome = Importer::new(&mut store, settings)
        .run(
            &schema,
            batch(vec![
                result_row("P1", Cell::double(1.0), Some("S2")),
                result_row("P2", Cell::double(2.0), None),
            ]),
            &target(),
        )
        .expect("dry run succeeds");

    assert!(outcome.dry_run);
    assert_eq!(outcome.rows.len(), 2);
    assert_eq!(outcome.edges, 2);
    assert!(store.rows().is_empty());
    assert!(store.edges().is_empty());
}

#[test]
fn explicit_inputs_without_sink_are_a_configuration_error() {
    let schema = results_schema();
    let row = result_row("P1", Cell::double(1.0), None).with(
        "prov:objectInputs",
        Cell::Inputs(vec!["urn:lsid:other:Run:7".to_string()]),
    );
    let mut store = MemoryStore::without_provenance();
    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(vec![row]), &target())
        .unwrap_err();
    assert!(matches!(err, ImportError::Configuration(_)));
    assert!(err.to_string().contains("Provenance service not available"));
    assert!(store.rows().is_empty());

    let outcome = Importer::new(&mut store, ImportSettings::default())
        .run(
            &schema,
            batch(vec![result_row("P1", Cell::double(1.0), None)]),
            &target(),
        )
        .expect("no inputs, no sink needed");
    assert_eq!(outcome.edges, 1);
    assert_eq!(outcome.edges_written, 0);
}

#[test]
fn explicit_inputs_become_edges() {
    let schema = results_schema();
    let row = result_row("P1", Cell::double(1.0), Some("S1"))
        .with("prov:objectInputs", Cell::text("urn:x, urn:y"));
    let (mut store, sample) = sample_store();
    Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(vec![row]), &target())
        .expect("import succeeds");
    let mut inputs = store
        .edges()
        .iter()
        .filter_map(|stored| stored.edge.input.clone())
        .collect::<Vec<_>>();
    inputs.sort();
    assert_eq!(inputs, vec![sample.lsid, "urn:x".to_string(), "urn:y".to_string()]);
}

#[test]
fn lenient_mode_drops_unknown_columns_and_strict_mode_rejects_them() {
    let schema = results_schema();
    let row = || result_row("P1", Cell::double(1.0), None).with("Operator", Cell::text("jd"));

    let mut store = MemoryStore::new();
    let outcome = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(vec![row()]), &target())
        .expect("lenient import succeeds");
    assert_eq!(outcome.dropped_columns, vec!["Operator"]);
    assert!(store.rows()[0].data.get("Operator").is_none());

    let strict = ImportSettings {
        strict: true,
        ..ImportSettings::default()
    };
    let err = Importer::new(&mut store, strict)
        .run(&schema, batch(vec![row()]), &target())
        .unwrap_err();
    let ImportError::SchemaMismatch(reconciliation) = &err else {
        panic!("expected schema mismatch, got {err}");
    };
    assert_eq!(reconciliation.unexpected, vec!["Operator"]);
    assert!(err.to_string().contains("Unexpected columns were found: Operator"));
}

#[test]
fn missing_required_column_fails_before_rows() {
    let schema = results_schema();
    let data = batch(vec![RawRow::new().with("ptid", Cell::text("P1"))]);
    let mut store = MemoryStore::new();
    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, data, &target())
        .unwrap_err();
    assert!(err.is_data_error());
    assert_eq!(err.to_string(), "Expected columns were not found: Value.");
}

#[test]
fn missing_value_indicators() {
    let schema = results_schema();
    let flagged = result_row("P1", Cell::Missing, None).with("ValueMVIndicator", Cell::text("Q"));
    let mut store = MemoryStore::new();
    Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(vec![flagged]), &target())
        .expect("valid indicator satisfies required");
    assert_eq!(
        store.rows()[0].data["Value"],
        serde_json::json!({ "value": null, "mv_indicator": "Q" })
    );

    let bogus = result_row("P2", Cell::double(4.0), None).with("ValueMVIndicator", Cell::text("ZZ"));
    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(vec![bogus]), &target())
        .unwrap_err();
    let failure = err.row_failure().expect("row failure");
    assert_eq!(failure.fields(), vec!["ValueMVIndicator"]);
}

#[test]
fn alternate_keys_remap_text_to_entity_id() {
    let schema = Schema::new(vec![
        Field::new("SampleId", FieldType::Integer)
            .with_lookup(ReferenceTarget::collection("Samples")),
    ]);
    let (mut store, sample) = sample_store();
    let settings = ImportSettings {
        allow_lookup_by_alternate_key: true,
        ..ImportSettings::default()
    };
    Importer::new(&mut store, settings.clone())
        .run(
            &schema,
            batch(vec![RawRow::new().with("SampleId", Cell::text("S1"))]),
            &target(),
        )
        .expect("remapped");
    assert_eq!(store.rows()[0].data["SampleId"], serde_json::json!(sample.row_id));
    assert_eq!(store.edges()[0].edge.input.as_deref(), Some(sample.lsid.as_str()));

    let err = Importer::new(&mut store, settings)
        .run(
            &schema,
            batch(vec![RawRow::new().with("SampleId", Cell::text("S404"))]),
            &target(),
        )
        .unwrap_err();
    assert_eq!(
        err.row_failure().expect("row failure").errors[0].message,
        "Failed to convert 'SampleId': S404"
    );
}

#[test]
fn dimensions_backfill_and_link_entities() {
    let schema = Schema::new(vec![
        Field::new("SpecimenID", FieldType::String),
        Field::new("ParticipantID", FieldType::String),
        Field::new("VisitID", FieldType::Double),
        Field::new("TargetStudy", FieldType::String),
    ]);
    let (mut store, sample) = sample_store();
    let resolver = SpecimenResolver {
        linked: sample.clone(),
    };
    let row = |study: &str| {
        RawRow::new()
            .with("SpecimenID", Cell::text("P7-2"))
            .with("ParticipantID", Cell::Missing)
            .with("VisitID", Cell::Missing)
            .with("TargetStudy", Cell::text(study))
    };

    Importer::new(&mut store, ImportSettings::default())
        .with_dimension_resolver(&resolver)
        .run(&schema, batch(vec![row("Study A")]), &target())
        .expect("import succeeds");
    let data = &store.rows()[0].data;
    assert_eq!(data["ParticipantID"], serde_json::json!("P7"));
    assert_eq!(data["VisitID"], serde_json::json!(2.0));
    assert_eq!(data["TargetStudy"], serde_json::json!("ctx-a"));
    assert_eq!(store.edges()[0].edge.input.as_deref(), Some(sample.lsid.as_str()));

    let err = Importer::new(&mut store, ImportSettings::default())
        .with_dimension_resolver(&resolver)
        .run(&schema, batch(vec![row("Study B")]), &target())
        .unwrap_err();
    assert_eq!(
        err.row_failure().expect("row failure").errors[0].message,
        "Ambiguous TargetStudy 'Study B'."
    );

    let err = Importer::new(&mut store, ImportSettings::default())
        .with_dimension_resolver(&resolver)
        .run(&schema, batch(vec![row("Study Z")]), &target())
        .unwrap_err();
    assert_eq!(
        err.row_failure().expect("row failure").errors[0].message,
        "Couldn't resolve TargetStudy 'Study Z' to a target context."
    );
}

#[test]
fn static_resolver_passes_values_through() {
    let schema = Schema::new(vec![
        Field::new("ParticipantID", FieldType::String).required(),
        Field::new("TargetStudy", FieldType::String),
    ]);
    let resolver = StaticDimensionResolver::new().with_context("ctx-1", "Pilot");
    let mut store = MemoryStore::new();
    Importer::new(&mut store, ImportSettings::default())
        .with_dimension_resolver(&resolver)
        .run(
            &schema,
            batch(vec![
                RawRow::new()
                    .with("ParticipantID", Cell::text("P1"))
                    .with("TargetStudy", Cell::text("pilot")),
            ]),
            &target(),
        )
        .expect("import succeeds");
    assert_eq!(store.rows()[0].data["TargetStudy"], serde_json::json!("ctx-1"));
    assert_eq!(store.rows()[0].data["ParticipantID"], serde_json::json!("P1"));
}

#[test]
fn column_named_after_field_wins_over_alias_column() {
    let schema = results_schema();
    let row = RawRow::new()
        .with("ptid", Cell::text("X"))
        .with("Subject", Cell::text("Y"))
        .with("Value", Cell::double(1.0));
    let mut store = MemoryStore::new();
    Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(vec![row]), &target())
        .expect("import succeeds");
    assert_eq!(store.rows()[0].data["Subject"], serde_json::json!("Y"));
}

#[test]
fn two_columns_of_equal_rank_are_a_schema_mismatch() {
    let schema = results_schema();
    let row = RawRow::new()
        .with("Subject", Cell::text("X"))
        .with("SUBJECT", Cell::text("Y"))
        .with("Value", Cell::double(1.0));
    let mut store = MemoryStore::new();
    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&schema, batch(vec![row]), &target())
        .unwrap_err();
    let ImportError::SchemaMismatch(reconciliation) = &err else {
        panic!("expected schema mismatch, got {err}");
    };
    assert_eq!(reconciliation.conflicts, vec!["Subject"]);
    assert_eq!(err.to_string(), "Two columns mapped to target column: Subject.");
    assert!(store.rows().is_empty());
}

#[test]
fn invalid_catalog_is_rejected_before_any_row() {
    let schema = Schema::new(vec![
        Field::new("Score", FieldType::Double).with_lookup(ReferenceTarget::collection("Samples")),
        Field::new("score", FieldType::String),
    ]);
    let data = batch(vec![RawRow::new().with("Score", Cell::double(1.0))]);
    let (mut store, _) = sample_store();
    let mut importer = Importer::new(&mut store, ImportSettings::default());
    let err = importer.run(&schema, data, &target()).unwrap_err();
    assert_eq!(importer.state(), ImportState::Aborted);
    assert!(matches!(err, ImportError::Configuration(_)));
    assert!(err.to_string().contains("lookups must be String or Integer"));

    let duplicated = Schema::new(vec![
        Field::new("Subject", FieldType::String),
        Field::new("subject", FieldType::String),
    ]);
    let err = Importer::new(&mut store, ImportSettings::default())
        .run(&duplicated, RawData::default(), &target())
        .unwrap_err();
    assert!(err.to_string().contains("appears more than once"));
    assert!(store.rows().is_empty());
    assert!(!store.in_transaction());
}

#[test]
fn run_inputs_record_lookup_role_and_linked_entities() {
    let schema = Schema::new(vec![
        Field::new("SpecimenID", FieldType::String),
        Field::new("Sample", FieldType::String).with_lookup(ReferenceTarget::collection("Samples")),
    ]);
    let mut store = MemoryStore::new();
    let s1 = store.add_entity("Samples", "S1", true);
    let s2 = store.add_entity("Samples", "S2", true);
    let row = |sample: &str| {
        RawRow::new()
            .with("SpecimenID", Cell::text("P1-1"))
            .with("Sample", Cell::text(sample))
    };

    let linked_elsewhere = SpecimenResolver { linked: s2.clone() };
    let outcome = Importer::new(&mut store, ImportSettings::default())
        .with_dimension_resolver(&linked_elsewhere)
        .run(&schema, batch(vec![row("S1"), row("s1")]), &target())
        .expect("import succeeds");
    let recorded = outcome
        .run_inputs
        .as_slice()
        .iter()
        .map(|input| (input.lsid.as_str(), input.role.as_deref()))
        .collect::<Vec<_>>();
    assert_eq!(
        recorded,
        vec![(s1.lsid.as_str(), Some("Sample")), (s2.lsid.as_str(), None)]
    );
    let stored = store.run_inputs();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|entry| entry.output_scope == format!("urn:run:{}", outcome.run_id)));

    let linked_same = SpecimenResolver { linked: s1.clone() };
    let outcome = Importer::new(&mut store, ImportSettings::default())
        .with_dimension_resolver(&linked_same)
        .run(&schema, batch(vec![row("S1")]), &target())
        .expect("import succeeds");
    assert_eq!(outcome.run_inputs.len(), 1);
    assert_eq!(outcome.run_inputs.role(&s1.lsid), Some(Some("Sample")));
}

#[test]
fn dry_run_discards_run_inputs() {
    let schema = results_schema();
    let settings = ImportSettings {
        dry_run: true,
        ..ImportSettings::default()
    };
    let (mut store, sample) = sample_store();
    let outcome = Importer::new(&mut store, settings)
        .run(
            &schema,
            batch(vec![result_row("P1", Cell::double(1.0), Some("S1"))]),
            &target(),
        )
        .expect("dry run succeeds");
    assert_eq!(outcome.run_inputs.role(&sample.lsid), Some(Some("Sample")));
    assert!(store.run_inputs().is_empty());
}
