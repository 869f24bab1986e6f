//! Failure taxonomy surfaced by [`crate::importer::Importer::run`].
//!
//! `SchemaMismatch`, `EmptyData` and `Validation` mean the supplied data is
//! wrong. `Storage`, `Configuration` and `Collaborator` mean the system failed.

use std::fmt;

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use crate::{reconcile::Reconciliation, store::StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    /// 1-based position of the row in the batch.
    pub row_number: usize,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(row_number: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            row_number,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {} field '{}': {}", self.row_number, self.field, self.message)
    }
}

/// Every error found on the first failing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub row_number: usize,
    pub errors: Vec<ValidationError>,
}

impl RowFailure {
    pub fn fields(&self) -> Vec<&str> {
        self.errors.iter().map(|error| error.field.as_str()).collect()
    }
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Row {}: {}",
            self.row_number,
            self.errors.iter().map(|error| &error.message).join("; ")
        )
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{}", .0.describe())]
    SchemaMismatch(Reconciliation),
    #[error("Data file contained zero data rows")]
    EmptyData,
    #[error("{0}")]
    Validation(RowFailure),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Collaborator failure: {0:#}")]
    Collaborator(#[source] anyhow::Error),
}

impl ImportError {
    /// Whether the failure is attributable to the supplied data rather than
    /// to the system.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            ImportError::SchemaMismatch(_) | ImportError::EmptyData | ImportError::Validation(_)
        )
    }

    pub fn row_failure(&self) -> Option<&RowFailure> {
        match self {
            ImportError::Validation(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ImportError {
    fn from(err: anyhow::Error) -> Self {
        ImportError::Collaborator(err)
    }
}
