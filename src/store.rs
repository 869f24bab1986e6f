//! Destination storage contract.
//!
//! The importer owns one [`ImportStore`] for the duration of a batch and
//! drives its transaction: `begin` before reconciliation, `commit` only after
//! provenance has been emitted, `rollback` on any failure.

use serde::Serialize;
use thiserror::Error;

use crate::{
    lookup::ReferenceBackend, provenance::ProvenanceSink, row::ReconciledRow, schema::Schema,
};

#[derive(Debug, Error)]
pub enum StorageError {
    /// A uniqueness or other integrity constraint rejected the batch.
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, StorageError::Constraint(_))
    }
}

/// Where a batch is written and on whose behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTarget {
    pub container: String,
    pub user: String,
    pub destination: String,
}

impl ImportTarget {
    pub fn new(
        container: impl Into<String>,
        user: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            user: user.into(),
            destination: destination.into(),
        }
    }

    /// Stable identifier of a persisted row, used as the provenance output.
    pub fn row_lsid(&self, row_id: i64) -> String {
        format!(
            "urn:lsid:{}:{}:Row.{row_id}",
            self.container, self.destination
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsertedRow {
    pub row_id: i64,
    pub lsid: String,
}

pub trait ImportStore {
    fn begin(&mut self) -> Result<(), StorageError>;

    /// Writes every row inside the open transaction and returns their ids in
    /// input order.
    fn insert_rows(
        &mut self,
        target: &ImportTarget,
        schema: &Schema,
        rows: &[ReconciledRow],
    ) -> Result<Vec<InsertedRow>, StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self) -> Result<(), StorageError>;

    /// Entities that lookup fields can point at, when the store holds them.
    fn references(&self) -> Option<&dyn ReferenceBackend> {
        None
    }

    fn provenance_sink(&mut self) -> Option<&mut dyn ProvenanceSink> {
        None
    }
}
