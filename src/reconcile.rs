//! Column reconciliation: maps source column names onto catalog fields.
//!
//! Every lookup goes through [`normalize_key`], so a column matches a field
//! when it equals the field's name, label, or any import alias ignoring case
//! and surrounding whitespace. `<name>MVIndicator` columns of MV-enabled
//! fields and the provenance passthrough column are legal but do not supply a
//! field on their own.
//!
//! A field's own name outranks its label and import aliases, both when the
//! index is built and when two source columns supply the same field. Two
//! columns supplying one field at the same rank are a schema mismatch.
//!
//! In lenient mode unexpected columns are not reported: they are listed in
//! [`Reconciliation::dropped`] and silently removed from every projected row.
//! Callers that cannot tolerate data loss should import with `strict` set.

use std::collections::HashMap;

use itertools::Itertools;
use log::{debug, warn};

use crate::{
    provenance::PROVENANCE_INPUT_KEY,
    row::{RawRow, ReconciledRow},
    schema::Schema,
    value::{Cell, Value},
};

pub fn normalize_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// How a column matched its field. Later variants take priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Alias,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnBinding {
    Field(usize, MatchKind),
    MvIndicator(usize),
    ProvenanceInputs,
    Unexpected,
}

/// Case-insensitive alias index, built once per batch.
#[derive(Debug, Clone)]
pub struct AliasIndex {
    fields: HashMap<String, (usize, MatchKind)>,
    mv_indicators: HashMap<String, usize>,
}

impl AliasIndex {
    pub fn build(schema: &Schema) -> Self {
        let mut fields = HashMap::new();
        let mut mv_indicators = HashMap::new();
        for (idx, field) in schema.fields.iter().enumerate() {
            fields.insert(normalize_key(&field.name), (idx, MatchKind::Name));
        }
        for (idx, field) in schema.fields.iter().enumerate() {
            for alias in field.aliases() {
                fields
                    .entry(normalize_key(alias))
                    .or_insert((idx, MatchKind::Alias));
            }
            if field.mv_enabled {
                mv_indicators
                    .entry(normalize_key(&field.mv_indicator_column()))
                    .or_insert(idx);
            }
        }
        Self {
            fields,
            mv_indicators,
        }
    }

    pub fn binding(&self, column: &str) -> ColumnBinding {
        let key = normalize_key(column);
        if let Some((idx, kind)) = self.fields.get(&key) {
            ColumnBinding::Field(*idx, *kind)
        } else if let Some(idx) = self.mv_indicators.get(&key) {
            ColumnBinding::MvIndicator(*idx)
        } else if key == normalize_key(PROVENANCE_INPUT_KEY) {
            ColumnBinding::ProvenanceInputs
        } else {
            ColumnBinding::Unexpected
        }
    }

    pub fn field_for(&self, column: &str) -> Option<usize> {
        match self.binding(column) {
            ColumnBinding::Field(idx, _) => Some(idx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// `(source column, canonical field name)` for every column that supplies a field.
    pub mapped: Vec<(String, String)>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    /// Unexpected columns tolerated in lenient mode.
    pub dropped: Vec<String>,
    /// Alias columns ignored because another column carries the field's name.
    pub shadowed: Vec<String>,
    /// Fields supplied by two columns of the same rank.
    pub conflicts: Vec<String>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.conflicts.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut message = String::new();
        if !self.missing.is_empty() {
            message.push_str(&format!(
                "Expected columns were not found: {}.",
                self.missing.iter().join(", ")
            ));
        }
        if !self.unexpected.is_empty() {
            if !message.is_empty() {
                message.push_str("  ");
            }
            message.push_str(&format!(
                "Unexpected columns were found: {}",
                self.unexpected.iter().join(", ")
            ));
        }
        for field in &self.conflicts {
            if !message.is_empty() {
                message.push_str("  ");
            }
            message.push_str(&format!("Two columns mapped to target column: {field}."));
        }
        message
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler<'a> {
    schema: &'a Schema,
    index: AliasIndex,
}

impl<'a> Reconciler<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            index: AliasIndex::build(schema),
        }
    }

    pub fn index(&self) -> &AliasIndex {
        &self.index
    }

    /// Classifies source columns against the catalog. Pure in its inputs.
    pub fn reconcile(&self, columns: &[String], strict: bool) -> Reconciliation {
        let mut result = Reconciliation::default();
        let mut chosen: Vec<Option<(MatchKind, usize)>> = vec![None; self.schema.fields.len()];

        for (position, column) in columns.iter().enumerate() {
            match self.index.binding(column) {
                ColumnBinding::Field(idx, kind) => {
                    let current = chosen[idx];
                    match current {
                        None => chosen[idx] = Some((kind, position)),
                        Some((best, previous)) if kind > best => {
                            result.shadowed.push(columns[previous].clone());
                            chosen[idx] = Some((kind, position));
                        }
                        Some((best, _)) if kind < best => result.shadowed.push(column.clone()),
                        Some(_) => {
                            let name = &self.schema.fields[idx].name;
                            if !result.conflicts.contains(name) {
                                result.conflicts.push(name.clone());
                            }
                        }
                    }
                }
                ColumnBinding::MvIndicator(_) | ColumnBinding::ProvenanceInputs => {}
                ColumnBinding::Unexpected => {
                    if strict {
                        result.unexpected.push(column.clone());
                    } else {
                        result.dropped.push(column.clone());
                    }
                }
            }
        }

        result.mapped = chosen
            .iter()
            .copied()
            .enumerate()
            .filter_map(|(idx, choice)| choice.map(|(_, position)| (position, idx)))
            .sorted()
            .map(|(position, idx)| {
                (
                    columns[position].clone(),
                    self.schema.fields[idx].name.clone(),
                )
            })
            .collect();
        result.missing = self
            .schema
            .fields
            .iter()
            .zip(&chosen)
            .filter(|(field, choice)| choice.is_none() && (field.required || strict))
            .map(|(field, _)| field.name.clone())
            .collect();

        if !result.shadowed.is_empty() {
            warn!(
                "Ignoring alias column(s) {} in favor of columns named after their field",
                result.shadowed.iter().join(", ")
            );
        }
        if !result.dropped.is_empty() {
            warn!(
                "Ignoring {} unrecognized column(s): {}",
                result.dropped.len(),
                result.dropped.iter().join(", ")
            );
        }
        debug!(
            "Reconciled {} column(s): {} mapped, {} missing, {} unexpected",
            columns.len(),
            result.mapped.len(),
            result.missing.len(),
            result.unexpected.len()
        );
        result
    }

    /// Rekeys a source row onto canonical field positions.
    ///
    /// Unrecognized columns are dropped. A column named after its field
    /// replaces one matched by alias. Indicator columns are folded into their
    /// value cell as [`Cell::Mv`].
    pub fn project(&self, raw: RawRow, row_number: usize) -> ReconciledRow {
        let mut row = ReconciledRow::new(row_number, self.schema.fields.len());
        let mut kinds: Vec<Option<MatchKind>> = vec![None; self.schema.fields.len()];
        let mut indicators: Vec<(usize, Cell)> = Vec::new();

        for (column, cell) in raw.into_columns() {
            match self.index.binding(&column) {
                ColumnBinding::Field(idx, kind) => {
                    let replace = match kinds[idx] {
                        None => true,
                        Some(best) => kind > best || (kind == best && row.cell(idx).is_missing()),
                    };
                    if replace {
                        kinds[idx] = Some(kind);
                        row.set(idx, cell);
                    }
                }
                ColumnBinding::MvIndicator(idx) => indicators.push((idx, cell)),
                ColumnBinding::ProvenanceInputs => row.provenance_inputs = Some(cell),
                ColumnBinding::Unexpected => {}
            }
        }

        for (idx, indicator) in indicators {
            let code = indicator.as_display().trim().to_string();
            if code.is_empty() {
                continue;
            }
            let merged = match std::mem::take(row.cell_mut(idx)) {
                Cell::Missing => Cell::Mv {
                    value: None,
                    indicator: Some(code),
                },
                Cell::Present(value) => Cell::Mv {
                    value: Some(value),
                    indicator: Some(code),
                },
                Cell::Mv { value, .. } => Cell::Mv {
                    value,
                    indicator: Some(code),
                },
                other @ (Cell::Error(_) | Cell::Inputs(_)) => other,
            };
            row.set(idx, merged);
        }
        row
    }
}

/// Splits a comma-separated provenance list into trimmed ids.
pub fn split_inputs(cell: &Cell) -> Vec<String> {
    match cell {
        Cell::Inputs(ids) => ids.clone(),
        Cell::Present(Value::String(text)) => text
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        Cell::Present(other) => vec![other.as_display()],
        _ => Vec::new(),
    }
}
