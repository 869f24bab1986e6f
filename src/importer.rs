//! Import orchestration.
//!
//! A run moves through `Reconciling`, one `ValidatingRow` per row,
//! `Persisting`, `EmittingProvenance` and finally `Committed`. Any failure
//! moves it to `Aborted` and rolls back everything the run wrote. The first
//! row with errors stops the batch; no later rows are looked at.

use std::fmt;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dimension::{DimensionFields, DimensionKey, DimensionResolver},
    error::{ImportError, RowFailure, ValidationError},
    files::FileResolver,
    lookup::{ReferenceBackend, ResolutionCache},
    provenance::{ProvenanceCollector, RunInputs},
    reconcile::{Reconciler, split_inputs},
    row::{RawData, ReconciledRow},
    schema::{LookupMode, Schema},
    store::{ImportStore, ImportTarget, InsertedRow},
    validate::{FieldValidatorSet, ValidatorContext},
    value::{Cell, Value},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSettings {
    /// Report unexpected columns and treat every field as required.
    pub strict: bool,
    /// Accept a batch with zero data rows.
    pub allow_empty_data: bool,
    /// Resolve text supplied for integer lookup fields by display name.
    pub allow_lookup_by_alternate_key: bool,
    /// Keep unparseable text instead of the coercion sentinel. Applied by the
    /// loader; recorded here so a run describes how its data was read.
    pub best_effort_conversion: bool,
    /// Run every stage, then roll back instead of committing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    Reconciling,
    ValidatingRow(usize),
    Persisting,
    EmittingProvenance,
    Committed,
    Aborted,
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportState::Idle => f.write_str("idle"),
            ImportState::Reconciling => f.write_str("reconciling"),
            ImportState::ValidatingRow(row) => write!(f, "validating row {row}"),
            ImportState::Persisting => f.write_str("persisting"),
            ImportState::EmittingProvenance => f.write_str("emitting provenance"),
            ImportState::Committed => f.write_str("committed"),
            ImportState::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub run_id: Uuid,
    pub rows: Vec<InsertedRow>,
    /// Edges collected for the batch.
    pub edges: usize,
    /// Edges handed to the provenance sink.
    pub edges_written: usize,
    pub dropped_columns: Vec<String>,
    /// Entities the run consumed as a whole, with the field that found them.
    pub run_inputs: RunInputs,
    pub lookup_hits: usize,
    pub lookup_misses: usize,
    pub dry_run: bool,
}

impl ImportOutcome {
    fn empty(run_id: Uuid, dry_run: bool) -> Self {
        Self {
            run_id,
            rows: Vec::new(),
            edges: 0,
            edges_written: 0,
            dropped_columns: Vec::new(),
            run_inputs: RunInputs::new(),
            lookup_hits: 0,
            lookup_misses: 0,
            dry_run,
        }
    }

    pub fn row_ids(&self) -> Vec<i64> {
        self.rows.iter().map(|row| row.row_id).collect()
    }
}

pub struct Importer<'a> {
    store: &'a mut dyn ImportStore,
    references: Option<&'a dyn ReferenceBackend>,
    files: Option<&'a dyn FileResolver>,
    dimensions: Option<&'a dyn DimensionResolver>,
    settings: ImportSettings,
    state: ImportState,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a mut dyn ImportStore, settings: ImportSettings) -> Self {
        Self {
            store,
            references: None,
            files: None,
            dimensions: None,
            settings,
            state: ImportState::Idle,
        }
    }

    /// Resolves lookups against `backend` instead of the store's own entities.
    pub fn with_references(mut self, backend: &'a dyn ReferenceBackend) -> Self {
        self.references = Some(backend);
        self
    }

    pub fn with_file_resolver(mut self, files: &'a dyn FileResolver) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_dimension_resolver(mut self, dimensions: &'a dyn DimensionResolver) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    pub fn state(&self) -> ImportState {
        self.state
    }

    fn transition(&mut self, next: ImportState) {
        debug!("Import state {} -> {}", self.state, next);
        self.state = next;
    }

    /// Imports one batch as a single transaction.
    pub fn run(
        &mut self,
        schema: &Schema,
        data: RawData,
        target: &ImportTarget,
    ) -> Result<ImportOutcome, ImportError> {
        let run_id = Uuid::new_v4();
        info!(
            "Import {run_id}: {} row(s) into {}/{}{}",
            data.len(),
            target.container,
            target.destination,
            if self.settings.dry_run { " (dry run)" } else { "" }
        );

        if let Err(err) = self.store.begin() {
            self.transition(ImportState::Aborted);
            return Err(err.into());
        }

        let result = self.execute(run_id, schema, data, target).and_then(|outcome| {
            if outcome.dry_run {
                self.store.rollback()?;
            } else {
                self.store.commit()?;
            }
            Ok(outcome)
        });

        match result {
            Ok(outcome) => {
                self.transition(ImportState::Committed);
                info!(
                    "Import {run_id}: {} {} row(s), {} provenance edge(s)",
                    if outcome.dry_run { "validated" } else { "committed" },
                    outcome.rows.len(),
                    outcome.edges
                );
                Ok(outcome)
            }
            Err(err) => {
                let failed_in = self.state;
                self.transition(ImportState::Aborted);
                if let Err(rollback) = self.store.rollback() {
                    warn!("Import {run_id}: rollback failed: {rollback}");
                }
                warn!("Import {run_id} aborted while {failed_in}: {err}");
                Err(err)
            }
        }
    }

    fn execute(
        &mut self,
        run_id: Uuid,
        schema: &Schema,
        data: RawData,
        target: &ImportTarget,
    ) -> Result<ImportOutcome, ImportError> {
        let dry_run = self.settings.dry_run;
        self.transition(ImportState::Reconciling);
        schema
            .validate()
            .map_err(|err| ImportError::Configuration(format!("{err:#}")))?;
        if data.is_empty() {
            if self.settings.allow_empty_data || schema.allow_empty_data || schema.fields.is_empty()
            {
                debug!("Import {run_id}: empty batch accepted");
                return Ok(ImportOutcome::empty(run_id, dry_run));
            }
            return Err(ImportError::EmptyData);
        }

        let reconciler = Reconciler::new(schema);
        let reconciliation = reconciler.reconcile(&data.columns, self.settings.strict);
        if !reconciliation.is_clean() {
            return Err(ImportError::SchemaMismatch(reconciliation));
        }

        let validators = FieldValidatorSet::for_schema(schema)
            .map_err(|err| ImportError::Configuration(format!("{err:#}")))?;
        let has_sink = self.store.provenance_sink().is_some();
        let backend = match self.references {
            Some(backend) => Some(backend),
            None => self.store.references(),
        };
        let mut processor = RowProcessor {
            schema,
            settings: &self.settings,
            target,
            context: ValidatorContext {
                container: target.container.clone(),
                user: target.user.clone(),
            },
            validators,
            dimension_fields: DimensionFields::detect(schema),
            cache: backend.map(ResolutionCache::new),
            files: self.files,
            dimensions: self.dimensions,
            has_sink,
            run_inputs: RunInputs::new(),
        };

        let mut rows = Vec::with_capacity(data.len());
        for (idx, raw) in data.rows.into_iter().enumerate() {
            let row_number = idx + 1;
            debug!("Import state -> validating row {row_number}");
            self.state = ImportState::ValidatingRow(row_number);
            let mut row = reconciler.project(raw, row_number);
            processor.process(&mut row)?;
            rows.push(row);
        }
        let (lookup_hits, lookup_misses) = processor
            .cache
            .as_ref()
            .map_or((0, 0), |cache| (cache.hits(), cache.misses()));
        let run_inputs = processor.run_inputs;

        self.transition(ImportState::Persisting);
        let inserted = self.store.insert_rows(target, schema, &rows)?;
        if inserted.len() != rows.len() {
            return Err(ImportError::Configuration(format!(
                "Store returned {} id(s) for {} row(s)",
                inserted.len(),
                rows.len()
            )));
        }

        self.transition(ImportState::EmittingProvenance);
        let mut collector = ProvenanceCollector::new();
        for (row, persisted) in rows.iter().zip(&inserted) {
            collector.add_row(&persisted.lsid, row.inputs.iter().cloned());
        }
        let edges = collector.len();
        let output_scope = format!("urn:run:{run_id}");
        let edges_written =
            collector.flush(self.store.provenance_sink(), &target.container, &output_scope)?;
        if !run_inputs.is_empty()
            && let Some(sink) = self.store.provenance_sink()
        {
            sink.add_run_inputs(&target.container, &output_scope, run_inputs.as_slice())?;
        }

        Ok(ImportOutcome {
            run_id,
            rows: inserted,
            edges,
            edges_written,
            dropped_columns: reconciliation.dropped,
            run_inputs,
            lookup_hits,
            lookup_misses,
            dry_run,
        })
    }
}

/// Per-batch state for validating, coercing and resolving rows.
struct RowProcessor<'r> {
    schema: &'r Schema,
    settings: &'r ImportSettings,
    target: &'r ImportTarget,
    context: ValidatorContext,
    validators: FieldValidatorSet,
    dimension_fields: DimensionFields,
    cache: Option<ResolutionCache<'r>>,
    files: Option<&'r dyn FileResolver>,
    dimensions: Option<&'r dyn DimensionResolver>,
    has_sink: bool,
    run_inputs: RunInputs,
}

impl<'r> RowProcessor<'r> {
    fn process(&mut self, row: &mut ReconciledRow) -> Result<(), ImportError> {
        let schema = self.schema;
        let container = self.target.container.as_str();
        let row_number = row.row_number;
        let mut errors = Vec::new();
        let mut key = DimensionKey::default();

        for (idx, field) in schema.fields.iter().enumerate() {
            row.cell_mut(idx).trim_text();

            self.validators.validate_field(
                schema,
                idx,
                row_number,
                row.cell(idx),
                &self.context,
                &mut errors,
            );

            self.dimension_fields.capture(idx, row.cell(idx), &mut key);
            if self.dimension_fields.is_target_context(idx)
                && let Some(reference) = row.cell(idx).as_str()
            {
                match self.find_target_context(&field.name, reference, row_number)? {
                    Ok(id) => key.target_context = Some(id),
                    Err(error) => errors.push(error),
                }
            }

            let value_missing = self.validators.check_mv_indicator(
                schema,
                idx,
                row_number,
                row.cell(idx),
                &mut errors,
            );

            if field.datatype.is_file()
                && let Some(files) = self.files
                && let Some(raw) = row.cell(idx).as_str()
            {
                match files.resolve(raw, container, field) {
                    Ok(Some(handle)) => row.set(idx, Cell::Present(Value::File(handle.path))),
                    Ok(None) => {}
                    Err(err) => errors.push(ValidationError::new(
                        row_number,
                        &field.name,
                        err.to_string(),
                    )),
                }
            }

            let mut lookup_failed = false;
            if field.lookup_mode() == Some(LookupMode::ById)
                && self.settings.allow_lookup_by_alternate_key
                && let (Some(target), Some(name)) = (&field.lookup, row.cell(idx).as_str())
            {
                let name = name.to_string();
                match self
                    .cache(&field.name)?
                    .resolve_by_name(target, container, &name)?
                {
                    Some(entity) => row.set(idx, Cell::integer(entity.row_id)),
                    None => {
                        lookup_failed = true;
                        errors.push(conversion_error(row_number, &field.name, &name));
                    }
                }
            }

            if !value_missing {
                self.validators
                    .check_sentinel(schema, idx, row_number, row.cell(idx), &mut errors);
            }

            if !lookup_failed
                && let Some(target) = &field.lookup
                && let Some(value) = lookup_value(field.lookup_mode(), row.cell(idx))
            {
                match self.cache(&field.name)?.resolve(target, container, &value)? {
                    Some(entity) => {
                        if entity.input {
                            self.run_inputs.add(&entity.lsid, Some(field.name.as_str()));
                            row.inputs.insert(entity.lsid);
                        }
                    }
                    None => errors.push(conversion_error(
                        row_number,
                        &field.name,
                        &value.as_display(),
                    )),
                }
            }
        }

        if !errors.is_empty() {
            return Err(ImportError::Validation(RowFailure { row_number, errors }));
        }

        if let Some(dimensions) = self.dimensions {
            let context = dimensions.resolve(&key)?;
            self.dimension_fields.backfill(row, &context);
            if let Some(entity) = context.linked_entity
                && entity.input
            {
                self.run_inputs.add(&entity.lsid, None);
                row.inputs.insert(entity.lsid);
            }
        }

        if let Some(explicit) = row.provenance_inputs.take()
            && !explicit.is_missing()
        {
            if !self.has_sink {
                return Err(ImportError::Configuration(
                    "Provenance service not available".to_string(),
                ));
            }
            row.inputs.extend(split_inputs(&explicit));
        }
        Ok(())
    }

    fn cache(&mut self, field: &str) -> Result<&mut ResolutionCache<'r>, ImportError> {
        match self.cache.as_mut() {
            Some(cache) => Ok(cache),
            None => Err(ImportError::Configuration(format!(
                "No reference backend configured for lookup field '{field}'"
            ))),
        }
    }

    /// Outer error is a collaborator failure; inner error is a row error.
    fn find_target_context(
        &self,
        field: &str,
        reference: &str,
        row_number: usize,
    ) -> Result<Result<String, ValidationError>, ImportError> {
        let Some(dimensions) = self.dimensions else {
            return Ok(Ok(reference.to_string()));
        };
        let mut found = dimensions.find_target_contexts(reference)?;
        Ok(match found.len() {
            0 => Err(ValidationError::new(
                row_number,
                field,
                format!("Couldn't resolve {field} '{reference}' to a target context."),
            )),
            1 => Ok(found.remove(0)),
            _ => Err(ValidationError::new(
                row_number,
                field,
                format!("Ambiguous {field} '{reference}'."),
            )),
        })
    }
}

/// The value a lookup field addresses its entity with: text for by-name
/// lookups, an integer for by-id lookups.
fn lookup_value(mode: Option<LookupMode>, cell: &Cell) -> Option<Value> {
    match (mode?, cell.value()?) {
        (LookupMode::ByName, value @ Value::String(_)) => Some(value.clone()),
        (LookupMode::ById, value @ Value::Integer(_)) => Some(value.clone()),
        _ => None,
    }
}

fn conversion_error(row_number: usize, field: &str, value: &str) -> ValidationError {
    ValidationError::new(
        row_number,
        field,
        format!("Failed to convert '{field}': {value}"),
    )
}
