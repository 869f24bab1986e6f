use std::{fmt, path::PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::schema::FieldType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    DateTime(NaiveDateTime),
    File(PathBuf),
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Double(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::File(path) => path.display().to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Double(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::DateTime(dt) => {
                serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
            Value::File(path) => serde_json::Value::String(path.display().to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// A single cell as it moves through the pipeline.
///
/// `Error` is the coercion sentinel: the loader could not convert the text to
/// the field's type. It never compares equal to a real value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Missing,
    Error(String),
    Present(Value),
    Mv {
        value: Option<Value>,
        indicator: Option<String>,
    },
    Inputs(Vec<String>),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Present(Value::String(value.into()))
    }

    pub fn integer(value: i64) -> Self {
        Cell::Present(Value::Integer(value))
    }

    pub fn double(value: f64) -> Self {
        Cell::Present(Value::Double(value))
    }

    pub fn is_missing(&self) -> bool {
        match self {
            Cell::Missing => true,
            Cell::Mv { value, indicator } => value.is_none() && indicator.is_none(),
            Cell::Inputs(ids) => ids.is_empty(),
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Cell::Error(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Cell::Present(value) => Some(value),
            Cell::Mv { value, .. } => value.as_ref(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Present(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Trims text values in place; blank text becomes `Missing`.
    pub fn trim_text(&mut self) {
        if let Cell::Present(Value::String(s)) = self {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                *self = Cell::Missing;
            } else if trimmed.len() != s.len() {
                *s = trimmed.to_string();
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Missing | Cell::Error(_) => serde_json::Value::Null,
            Cell::Present(value) => value.to_json(),
            Cell::Mv { value, indicator } => serde_json::json!({
                "value": value.as_ref().map(Value::to_json),
                "mv_indicator": indicator,
            }),
            Cell::Inputs(ids) => serde_json::Value::from(ids.clone()),
        }
    }

    pub fn as_display(&self) -> String {
        match self {
            Cell::Missing => String::new(),
            Cell::Error(raw) => raw.clone(),
            Cell::Present(value) => value.as_display(),
            Cell::Mv { value, indicator } => match (value, indicator) {
                (Some(value), _) => value.as_display(),
                (None, Some(indicator)) => indicator.clone(),
                (None, None) => String::new(),
            },
            Cell::Inputs(ids) => ids.join(","),
        }
    }
}

impl From<Value> for Cell {
    fn from(value: Value) -> Self {
        Cell::Present(value)
    }
}

pub fn parse_naive_date(value: &str) -> Result<NaiveDate> {
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y", "%Y%m%d"];
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%m/%d/%Y %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = parse_naive_date(value) {
        return Ok(date.and_time(chrono::NaiveTime::MIN));
    }
    Err(anyhow!("Failed to parse '{value}' as datetime"))
}

pub fn parse_typed_value(value: &str, ty: FieldType) -> Result<Option<Value>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = match ty {
        FieldType::String => Value::String(value.to_string()),
        FieldType::FileLink | FieldType::Attachment => Value::String(value.to_string()),
        FieldType::Integer => {
            let parsed: i64 = value
                .parse()
                .with_context(|| format!("Failed to parse '{value}' as integer"))?;
            Value::Integer(parsed)
        }
        FieldType::Double => {
            let parsed: f64 = value
                .parse()
                .with_context(|| format!("Failed to parse '{value}' as double"))?;
            Value::Double(parsed)
        }
        FieldType::Boolean => {
            let lowered = value.to_ascii_lowercase();
            let parsed = match lowered.as_str() {
                "true" | "t" | "yes" | "y" | "1" | "on" => true,
                "false" | "f" | "no" | "n" | "0" | "off" => false,
                _ => bail!("Failed to parse '{value}' as boolean"),
            };
            Value::Boolean(parsed)
        }
        FieldType::DateTime => Value::DateTime(parse_naive_datetime(value)?),
    };
    Ok(Some(parsed))
}

/// Converts raw text to a cell of the given type.
///
/// Unconvertible text becomes [`Cell::Error`] unless `best_effort` is set, in
/// which case the original text is kept as a string value.
pub fn coerce_cell(raw: &str, ty: FieldType, best_effort: bool) -> Cell {
    match parse_typed_value(raw, ty) {
        Ok(Some(value)) => Cell::Present(value),
        Ok(None) => Cell::text(raw),
        Err(_) if best_effort => Cell::text(raw),
        Err(_) => Cell::Error(raw.to_string()),
    }
}
