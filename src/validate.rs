//! Per-field validation rules.
//!
//! Each catalog field gets a list of [`Validator`]s: an implicit required
//! check plus whatever [`ValidatorSpec`]s the catalog declares. Validators run
//! for every field on every row, including fields the row does not supply.
//!
//! The set also owns the two checks that are not business rules: the
//! missing-value-indicator check and detection of the coercion sentinel
//! ([`Cell::Error`]). Both report a field at most once per batch.

use std::collections::HashSet;

use anyhow::{Context, Result, ensure};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::ValidationError,
    schema::{Field, Schema},
    value::{Cell, Value},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatorSpec {
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Pattern {
        regex: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Length {
        max: usize,
    },
}

impl ValidatorSpec {
    pub fn ensure_valid(&self) -> Result<()> {
        match self {
            ValidatorSpec::Range { min, max } => {
                ensure!(
                    min.is_some() || max.is_some(),
                    "Range validator needs a min or a max"
                );
                if let (Some(min), Some(max)) = (min, max) {
                    ensure!(min <= max, "Range validator min {min} exceeds max {max}");
                }
            }
            ValidatorSpec::Pattern { regex, .. } => {
                Regex::new(regex).with_context(|| format!("Compiling pattern '{regex}'"))?;
            }
            ValidatorSpec::Length { max } => {
                ensure!(*max > 0, "Length validator max must be positive");
            }
        }
        Ok(())
    }

    fn build(&self, field: &Field) -> Result<Box<dyn Validator>> {
        self.ensure_valid()?;
        let name = field.name.clone();
        Ok(match self {
            ValidatorSpec::Range { min, max } => Box::new(RangeValidator {
                field: name,
                min: *min,
                max: *max,
            }),
            ValidatorSpec::Pattern { regex, message } => Box::new(PatternValidator {
                field: name,
                regex: Regex::new(regex)?,
                message: message.clone(),
            }),
            ValidatorSpec::Length { max } => Box::new(LengthValidator {
                field: name,
                max: *max,
            }),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorContext {
    pub container: String,
    pub user: String,
}

pub trait Validator: Send + Sync {
    /// Returns an error message when the cell violates the rule.
    fn validate(&self, row_number: usize, cell: &Cell, ctx: &ValidatorContext) -> Option<String>;
}

pub struct RequiredValidator {
    field: String,
}

impl Validator for RequiredValidator {
    fn validate(&self, _row_number: usize, cell: &Cell, _ctx: &ValidatorContext) -> Option<String> {
        cell.is_missing()
            .then(|| format!("Missing value for required property: {}", self.field))
    }
}

pub struct RangeValidator {
    field: String,
    min: Option<f64>,
    max: Option<f64>,
}

impl Validator for RangeValidator {
    fn validate(&self, _row_number: usize, cell: &Cell, _ctx: &ValidatorContext) -> Option<String> {
        let number = match cell.value()? {
            Value::Integer(i) => *i as f64,
            Value::Double(f) => *f,
            _ => return None,
        };
        let below = self.min.is_some_and(|min| number < min);
        let above = self.max.is_some_and(|max| number > max);
        if !(below || above) {
            return None;
        }
        let bound = |limit: Option<f64>| limit.map(|v| v.to_string()).unwrap_or_default();
        Some(format!(
            "Value '{}' for field '{}' is outside the allowed range [{}, {}].",
            cell.as_display(),
            self.field,
            bound(self.min),
            bound(self.max)
        ))
    }
}

pub struct PatternValidator {
    field: String,
    regex: Regex,
    message: Option<String>,
}

impl Validator for PatternValidator {
    fn validate(&self, _row_number: usize, cell: &Cell, _ctx: &ValidatorContext) -> Option<String> {
        let text = cell.value()?.as_display();
        if self.regex.is_match(&text) {
            return None;
        }
        Some(match &self.message {
            Some(message) => message.clone(),
            None => format!(
                "Value '{text}' for field '{}' does not match pattern {}.",
                self.field,
                self.regex.as_str()
            ),
        })
    }
}

pub struct LengthValidator {
    field: String,
    max: usize,
}

impl Validator for LengthValidator {
    fn validate(&self, _row_number: usize, cell: &Cell, _ctx: &ValidatorContext) -> Option<String> {
        let text = cell.value()?.as_str()?;
        let length = text.chars().count();
        (length > self.max).then(|| {
            format!(
                "Value for field '{}' is {length} characters long; the limit is {}.",
                self.field, self.max
            )
        })
    }
}

/// Validators for every field of one schema, plus batch-wide reporting state.
pub struct FieldValidatorSet {
    validators: Vec<Vec<Box<dyn Validator>>>,
    reported_types: HashSet<String>,
}

impl FieldValidatorSet {
    pub fn for_schema(schema: &Schema) -> Result<Self> {
        let validators = schema
            .fields
            .iter()
            .map(|field| {
                let mut list: Vec<Box<dyn Validator>> = Vec::new();
                if field.required {
                    list.push(Box::new(RequiredValidator {
                        field: field.name.clone(),
                    }));
                }
                for spec in &field.validators {
                    list.push(
                        spec.build(field)
                            .with_context(|| format!("Field '{}'", field.name))?,
                    );
                }
                Ok(list)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            validators,
            reported_types: HashSet::new(),
        })
    }

    pub fn validator_count(&self, idx: usize) -> usize {
        self.validators.get(idx).map_or(0, Vec::len)
    }

    /// Runs the declared rules for one field.
    pub fn validate_field(
        &self,
        schema: &Schema,
        idx: usize,
        row_number: usize,
        cell: &Cell,
        ctx: &ValidatorContext,
        errors: &mut Vec<ValidationError>,
    ) {
        let field = &schema.fields[idx];
        for validator in &self.validators[idx] {
            if let Some(message) = validator.validate(row_number, cell, ctx) {
                errors.push(ValidationError::new(row_number, &field.name, message));
            }
        }
    }

    /// Checks an MV-wrapped cell. Returns whether the cell counts as missing.
    pub fn check_mv_indicator(
        &mut self,
        schema: &Schema,
        idx: usize,
        row_number: usize,
        cell: &Cell,
        errors: &mut Vec<ValidationError>,
    ) -> bool {
        let Cell::Mv { indicator, .. } = cell else {
            return cell.is_missing();
        };
        if cell.is_missing() {
            return true;
        }
        let field = &schema.fields[idx];
        if let Some(code) = indicator
            && !schema.is_valid_mv_indicator(code)
        {
            let column = field.mv_indicator_column();
            self.reported_types.insert(column.clone());
            errors.push(ValidationError::new(
                row_number,
                &column,
                format!("{column} must be a valid MV indicator."),
            ));
        }
        false
    }

    /// Reports the coercion sentinel once per field.
    pub fn check_sentinel(
        &mut self,
        schema: &Schema,
        idx: usize,
        row_number: usize,
        cell: &Cell,
        errors: &mut Vec<ValidationError>,
    ) {
        if !cell.is_error() {
            return;
        }
        let field = &schema.fields[idx];
        if !self.reported_types.insert(field.name.clone()) {
            return;
        }
        errors.push(ValidationError::new(
            row_number,
            &field.name,
            format!(
                "{} must be of type {}.",
                field.name,
                field.datatype.friendly_name()
            ),
        ));
    }
}
