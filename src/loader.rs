//! Reads a delimited file into [`RawData`] typed against a schema.
//!
//! Column names are kept exactly as they appear in the header; the importer
//! reconciles them later. Cells of recognized fields are converted to the
//! field's type here, with unconvertible text replaced by the coercion
//! sentinel unless best-effort conversion is on.

use std::{io::Read, path::Path};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::debug;

use crate::{
    io_utils,
    reconcile::{AliasIndex, ColumnBinding, split_inputs},
    row::{RawData, RawRow},
    schema::{Field, LookupMode, Schema},
    value::{Cell, coerce_cell},
};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
    pub best_effort: bool,
    /// Keep non-numeric text on integer lookup fields for alternate-key remapping.
    pub alternate_keys: bool,
}

pub fn load_path(path: &Path, schema: &Schema, options: &LoadOptions) -> Result<RawData> {
    let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())?;
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter, true)?;
    let data = load_reader(&mut reader, encoding, schema, options)
        .with_context(|| format!("Reading {path:?}"))?;
    debug!(
        "Loaded {} row(s) with {} column(s) from {path:?}",
        data.len(),
        data.columns.len()
    );
    Ok(data)
}

pub fn load_reader<R: Read>(
    reader: &mut csv::Reader<R>,
    encoding: &'static Encoding,
    schema: &Schema,
    options: &LoadOptions,
) -> Result<RawData> {
    let columns = io_utils::reader_headers(reader, encoding)?;
    let index = AliasIndex::build(schema);
    let bindings = columns
        .iter()
        .map(|column| index.binding(column))
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for (idx, record) in reader.byte_records().enumerate() {
        let record = record.with_context(|| format!("Reading data row {}", idx + 1))?;
        let values = io_utils::decode_record(&record, encoding)
            .with_context(|| format!("Decoding data row {}", idx + 1))?;
        let mut row = RawRow::new();
        for ((column, binding), raw) in columns.iter().zip(&bindings).zip(values) {
            let cell = match binding {
                ColumnBinding::Field(field_idx, _) => {
                    typed_cell(schema, &schema.fields[*field_idx], &raw, options)
                }
                ColumnBinding::ProvenanceInputs => {
                    Cell::Inputs(split_inputs(&Cell::text(raw)))
                }
                ColumnBinding::MvIndicator(_) | ColumnBinding::Unexpected => Cell::text(raw),
            };
            row.insert(column.clone(), cell);
        }
        rows.push(row);
    }
    Ok(RawData::new(columns, rows))
}

fn typed_cell(schema: &Schema, field: &Field, raw: &str, options: &LoadOptions) -> Cell {
    let trimmed = raw.trim();
    if field.mv_enabled && !trimmed.is_empty() && schema.is_valid_mv_indicator(trimmed) {
        return Cell::Mv {
            value: None,
            indicator: Some(trimmed.to_string()),
        };
    }
    if options.alternate_keys
        && field.lookup_mode() == Some(LookupMode::ById)
        && !trimmed.is_empty()
        && trimmed.parse::<i64>().is_err()
    {
        return Cell::text(trimmed);
    }
    coerce_cell(raw, field.datatype, options.best_effort)
}
