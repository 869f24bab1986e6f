//! Contextual dimensions: participant, specimen, visit, date, target context.
//!
//! The importer only knows the call contract of a [`DimensionResolver`]. How a
//! participant/visit/date tuple maps to a canonical identity is the resolver's
//! business. [`StaticDimensionResolver`] is a passthrough with a fixed list of
//! target contexts, used by the CLI and tests.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDateTime;

use crate::{
    lookup::Entity,
    reconcile::normalize_key,
    row::ReconciledRow,
    schema::{
        DATE_FIELD, FieldType, PARTICIPANT_FIELD, SPECIMEN_FIELD, Schema, TARGET_CONTEXT_FIELD,
        VISIT_FIELD,
    },
    value::{Cell, Value},
};

/// Raw dimension values captured from one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DimensionKey {
    pub specimen: Option<String>,
    pub participant: Option<String>,
    pub visit: Option<f64>,
    pub date: Option<NaiveDateTime>,
    /// Canonical id of the target context, once resolved from its label.
    pub target_context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedContext {
    pub participant: Option<String>,
    pub visit: Option<f64>,
    pub date: Option<NaiveDateTime>,
    pub target_context: Option<String>,
    pub linked_entity: Option<Entity>,
}

pub trait DimensionResolver {
    /// Canonical ids of every target context matching an id or label.
    fn find_target_contexts(&self, reference: &str) -> Result<Vec<String>>;

    fn resolve(&self, key: &DimensionKey) -> Result<ResolvedContext>;
}

/// Positions of the distinguished fields within a schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionFields {
    pub participant: Option<usize>,
    pub specimen: Option<usize>,
    pub visit: Option<usize>,
    pub date: Option<usize>,
    pub target_context: Option<usize>,
}

impl DimensionFields {
    pub fn detect(schema: &Schema) -> Self {
        Self {
            participant: schema.distinguished_field(PARTICIPANT_FIELD, FieldType::String),
            specimen: schema.distinguished_field(SPECIMEN_FIELD, FieldType::String),
            visit: schema.distinguished_field(VISIT_FIELD, FieldType::Double),
            date: schema.distinguished_field(DATE_FIELD, FieldType::DateTime),
            target_context: schema.distinguished_field(TARGET_CONTEXT_FIELD, FieldType::String),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn is_target_context(&self, idx: usize) -> bool {
        self.target_context == Some(idx)
    }

    /// Records the value of field `idx` when it is a participant, specimen,
    /// visit or date field. Values of the wrong shape are ignored.
    pub fn capture(&self, idx: usize, cell: &Cell, key: &mut DimensionKey) {
        let value = cell.value();
        if self.participant == Some(idx) {
            key.participant = value.and_then(Value::as_str).map(str::to_string);
        } else if self.specimen == Some(idx) {
            key.specimen = value.and_then(Value::as_str).map(str::to_string);
        } else if self.visit == Some(idx) {
            key.visit = match value {
                Some(Value::Double(visit)) => Some(*visit),
                Some(Value::Integer(visit)) => Some(*visit as f64),
                _ => None,
            };
        } else if self.date == Some(idx) {
            key.date = match value {
                Some(Value::DateTime(date)) => Some(*date),
                _ => None,
            };
        }
    }

    /// Fills empty participant, visit and date cells from the resolved
    /// context and always rewrites the target context to its canonical id.
    pub fn backfill(&self, row: &mut ReconciledRow, context: &ResolvedContext) {
        if let (Some(idx), Some(participant)) = (self.participant, &context.participant)
            && row.cell(idx).is_missing()
        {
            row.set(idx, Cell::text(participant.clone()));
        }
        if let (Some(idx), Some(visit)) = (self.visit, context.visit)
            && row.cell(idx).is_missing()
        {
            row.set(idx, Cell::double(visit));
        }
        if let (Some(idx), Some(date)) = (self.date, context.date)
            && row.cell(idx).is_missing()
        {
            row.set(idx, Cell::Present(Value::DateTime(date)));
        }
        if let (Some(idx), Some(target)) = (self.target_context, &context.target_context) {
            row.set(idx, Cell::text(target.clone()));
        }
    }
}

/// Passes captured values straight through and resolves target contexts from
/// a fixed `(id, label)` list.
#[derive(Debug, Clone, Default)]
pub struct StaticDimensionResolver {
    contexts: Vec<(String, String)>,
    specimens: HashMap<String, Entity>,
}

impl StaticDimensionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.contexts.push((id.into(), label.into()));
        self
    }

    /// Links rows carrying `specimen` to an existing entity.
    pub fn with_specimen(mut self, specimen: &str, entity: Entity) -> Self {
        self.specimens.insert(normalize_key(specimen), entity);
        self
    }
}

impl DimensionResolver for StaticDimensionResolver {
    fn find_target_contexts(&self, reference: &str) -> Result<Vec<String>> {
        let wanted = normalize_key(reference);
        Ok(self
            .contexts
            .iter()
            .filter(|(id, label)| normalize_key(id) == wanted || normalize_key(label) == wanted)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn resolve(&self, key: &DimensionKey) -> Result<ResolvedContext> {
        Ok(ResolvedContext {
            participant: key.participant.clone(),
            visit: key.visit,
            date: key.date,
            target_context: key.target_context.clone(),
            linked_entity: key
                .specimen
                .as_deref()
                .and_then(|specimen| self.specimens.get(&normalize_key(specimen)))
                .cloned(),
        })
    }
}
