//! Row containers that flow between the loader, the reconciler, and the
//! orchestrator.
//!
//! [`RawRow`] keeps columns under the names they had in the source file.
//! [`ReconciledRow`] is keyed by catalog position and is owned by exactly one
//! pipeline stage at a time; stages rewrite its cells in place.

use std::collections::BTreeSet;

use crate::{schema::Schema, value::Cell};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    columns: Vec<(String, Cell)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, cell: Cell) -> Self {
        self.insert(column, cell);
        self
    }

    /// Sets a column, replacing an existing entry with the same exact name.
    pub fn insert(&mut self, column: impl Into<String>, cell: Cell) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = cell,
            None => self.columns.push((column, cell)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, cell)| cell)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.columns.iter().map(|(name, cell)| (name.as_str(), cell))
    }

    pub fn into_columns(self) -> Vec<(String, Cell)> {
        self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A parsed batch: the header as it appeared in the source, then the rows.
#[derive(Debug, Clone, Default)]
pub struct RawData {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawData {
    pub fn new(columns: Vec<String>, rows: Vec<RawRow>) -> Self {
        Self { columns, rows }
    }

    /// Builds a batch whose header is taken from the first row.
    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        let columns = rows
            .first()
            .map(|row| row.column_names().map(str::to_string).collect())
            .unwrap_or_default();
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledRow {
    pub row_number: usize,
    cells: Vec<Cell>,
    pub provenance_inputs: Option<Cell>,
    pub inputs: BTreeSet<String>,
}

impl ReconciledRow {
    pub fn new(row_number: usize, field_count: usize) -> Self {
        Self {
            row_number,
            cells: vec![Cell::Missing; field_count],
            provenance_inputs: None,
            inputs: BTreeSet::new(),
        }
    }

    pub fn cell(&self, idx: usize) -> &Cell {
        &self.cells[idx]
    }

    pub fn cell_mut(&mut self, idx: usize) -> &mut Cell {
        &mut self.cells[idx]
    }

    pub fn set(&mut self, idx: usize, cell: Cell) {
        self.cells[idx] = cell;
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn get<'a>(&'a self, schema: &Schema, name: &str) -> Option<&'a Cell> {
        schema.field_index(name).map(|idx| &self.cells[idx])
    }

    /// Renders the row as a JSON object keyed by canonical field name.
    pub fn to_json(&self, schema: &Schema) -> serde_json::Value {
        let map = schema
            .fields
            .iter()
            .zip(&self.cells)
            .map(|(field, cell)| (field.name.clone(), cell.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// Joins the display form of the key fields, or `None` when the schema has
    /// no key or every key cell is empty.
    pub fn natural_key(&self, schema: &Schema) -> Option<String> {
        if !schema.has_key_fields() {
            return None;
        }
        let parts = schema
            .fields
            .iter()
            .zip(&self.cells)
            .filter(|(field, _)| field.key)
            .map(|(_, cell)| cell.as_display())
            .collect::<Vec<_>>();
        if parts.iter().all(String::is_empty) {
            None
        } else {
            Some(parts.join("\u{1f}"))
        }
    }
}
