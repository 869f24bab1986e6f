//! In-process store with the same transactional behavior as the SQLite one.
//!
//! Writes land in a pending area and only move to the committed area on
//! `commit`. Lookup calls are counted so callers can observe cache behavior,
//! and inserts can be made to fail on demand.

use std::{cell::Cell, collections::HashSet};

use anyhow::Result;
use log::debug;

use crate::{
    lookup::{Entity, ReferenceBackend},
    provenance::{ProvenanceEdge, ProvenanceSink, RunInput},
    reconcile::normalize_key,
    row::ReconciledRow,
    schema::{ReferenceTarget, Schema},
    store::{ImportStore, ImportTarget, InsertedRow, StorageError},
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_id: i64,
    pub lsid: String,
    pub container: String,
    pub destination: String,
    pub key: Option<String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEdge {
    pub container: String,
    pub output_scope: String,
    pub edge: ProvenanceEdge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRunInput {
    pub container: String,
    pub output_scope: String,
    pub input: RunInput,
}

/// `(container, destination, natural key)`
type RowKey = (String, String, String);

#[derive(Debug)]
pub struct MemoryStore {
    entities: Vec<Entity>,
    committed: Vec<StoredRow>,
    pending: Vec<StoredRow>,
    committed_keys: HashSet<RowKey>,
    pending_keys: HashSet<RowKey>,
    committed_edges: Vec<StoredEdge>,
    pending_edges: Vec<StoredEdge>,
    committed_run_inputs: Vec<StoredRunInput>,
    pending_run_inputs: Vec<StoredRunInput>,
    in_transaction: bool,
    next_row_id: i64,
    provenance_enabled: bool,
    insert_failure: Option<String>,
    name_lookups: Cell<usize>,
    id_lookups: Cell<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            committed: Vec::new(),
            pending: Vec::new(),
            committed_keys: HashSet::new(),
            pending_keys: HashSet::new(),
            committed_edges: Vec::new(),
            pending_edges: Vec::new(),
            committed_run_inputs: Vec::new(),
            pending_run_inputs: Vec::new(),
            in_transaction: false,
            next_row_id: 1,
            provenance_enabled: true,
            insert_failure: None,
            name_lookups: Cell::new(0),
            id_lookups: Cell::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that offers no provenance sink.
    pub fn without_provenance() -> Self {
        Self {
            provenance_enabled: false,
            ..Self::default()
        }
    }

    /// Makes every subsequent insert fail with a backend error.
    pub fn fail_inserts_with(&mut self, message: impl Into<String>) {
        self.insert_failure = Some(message.into());
    }

    pub fn add_entity(&mut self, collection: &str, name: &str, input: bool) -> Entity {
        let entity = Entity {
            row_id: 1000 + self.entities.len() as i64,
            lsid: format!("urn:lsid:memory:{collection}:{name}"),
            name: name.to_string(),
            collection: collection.to_string(),
            input,
        };
        self.entities.push(entity.clone());
        entity
    }

    pub fn rows(&self) -> &[StoredRow] {
        &self.committed
    }

    pub fn edges(&self) -> &[StoredEdge] {
        &self.committed_edges
    }

    pub fn run_inputs(&self) -> &[StoredRunInput] {
        &self.committed_run_inputs
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn name_lookups(&self) -> usize {
        self.name_lookups.get()
    }

    pub fn id_lookups(&self) -> usize {
        self.id_lookups.get()
    }

    fn require_transaction(&self) -> Result<(), StorageError> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(StorageError::Transaction("no transaction is open".to_string()))
        }
    }

}

fn in_collection(entity: &Entity, target: &ReferenceTarget) -> bool {
    match &target.collection {
        Some(collection) => normalize_key(&entity.collection) == normalize_key(collection),
        None => true,
    }
}

impl ImportStore for MemoryStore {
    fn begin(&mut self) -> Result<(), StorageError> {
        if self.in_transaction {
            return Err(StorageError::Transaction(
                "a transaction is already open".to_string(),
            ));
        }
        self.in_transaction = true;
        Ok(())
    }

    fn insert_rows(
        &mut self,
        target: &ImportTarget,
        schema: &Schema,
        rows: &[ReconciledRow],
    ) -> Result<Vec<InsertedRow>, StorageError> {
        self.require_transaction()?;
        if let Some(message) = &self.insert_failure {
            return Err(StorageError::Backend(message.clone()));
        }
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.natural_key(schema);
            if let Some(key) = &key {
                let row_key = (
                    target.container.clone(),
                    target.destination.clone(),
                    key.clone(),
                );
                if self.committed_keys.contains(&row_key) || !self.pending_keys.insert(row_key) {
                    return Err(StorageError::Constraint(format!(
                        "duplicate key '{}' in {} (row {})",
                        key.replace('\u{1f}', ", "),
                        target.destination,
                        row.row_number
                    )));
                }
            }
            let row_id = self.next_row_id;
            self.next_row_id += 1;
            let lsid = target.row_lsid(row_id);
            self.pending.push(StoredRow {
                row_id,
                lsid: lsid.clone(),
                container: target.container.clone(),
                destination: target.destination.clone(),
                key,
                data: row.to_json(schema),
            });
            inserted.push(InsertedRow { row_id, lsid });
        }
        Ok(inserted)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.require_transaction()?;
        debug!(
            "Committing {} row(s) and {} edge(s)",
            self.pending.len(),
            self.pending_edges.len()
        );
        self.committed.append(&mut self.pending);
        self.committed_keys.extend(self.pending_keys.drain());
        self.committed_edges.append(&mut self.pending_edges);
        self.committed_run_inputs.append(&mut self.pending_run_inputs);
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.require_transaction()?;
        self.pending.clear();
        self.pending_keys.clear();
        self.pending_edges.clear();
        self.pending_run_inputs.clear();
        self.in_transaction = false;
        Ok(())
    }

    fn references(&self) -> Option<&dyn ReferenceBackend> {
        Some(self)
    }

    fn provenance_sink(&mut self) -> Option<&mut dyn ProvenanceSink> {
        if self.provenance_enabled {
            Some(self)
        } else {
            None
        }
    }
}

impl ProvenanceSink for MemoryStore {
    fn add_edges(
        &mut self,
        container: &str,
        output_scope: &str,
        edges: &[ProvenanceEdge],
    ) -> Result<()> {
        self.pending_edges.extend(edges.iter().map(|edge| StoredEdge {
            container: container.to_string(),
            output_scope: output_scope.to_string(),
            edge: edge.clone(),
        }));
        Ok(())
    }

    fn add_run_inputs(
        &mut self,
        container: &str,
        output_scope: &str,
        inputs: &[RunInput],
    ) -> Result<()> {
        self.pending_run_inputs
            .extend(inputs.iter().map(|input| StoredRunInput {
                container: container.to_string(),
                output_scope: output_scope.to_string(),
                input: input.clone(),
            }));
        Ok(())
    }
}

impl ReferenceBackend for MemoryStore {
    fn find_by_name(
        &self,
        target: &ReferenceTarget,
        _container: &str,
        name: &str,
    ) -> Result<Option<Entity>> {
        self.name_lookups.set(self.name_lookups.get() + 1);
        let wanted = normalize_key(name);
        Ok(self
            .entities
            .iter()
            .find(|entity| in_collection(entity, target) && normalize_key(&entity.name) == wanted)
            .cloned())
    }

    fn find_by_id(&self, target: &ReferenceTarget, id: i64) -> Result<Option<Entity>> {
        self.id_lookups.set(self.id_lookups.get() + 1);
        Ok(self
            .entities
            .iter()
            .find(|entity| in_collection(entity, target) && entity.row_id == id)
            .cloned())
    }
}
