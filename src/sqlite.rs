//! SQLite-backed destination store.
//!
//! One database file holds referenceable entities, imported rows (as JSON
//! payloads) and provenance edges. Rows with a natural key are unique per
//! `(container, destination, key)`; a duplicate surfaces as
//! [`StorageError::Constraint`]. Entity names and collections are matched on
//! keys folded with [`normalize_key`], not SQLite's ASCII-only `NOCASE`.

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    lookup::{Entity, ReferenceBackend},
    provenance::{ProvenanceEdge, ProvenanceSink, RunInput},
    reconcile::normalize_key,
    row::ReconciledRow,
    schema::{ReferenceTarget, Schema},
    store::{ImportStore, ImportTarget, InsertedRow, StorageError},
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    row_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    lsid        TEXT NOT NULL UNIQUE,
    container   TEXT NOT NULL,
    collection  TEXT NOT NULL,
    name        TEXT NOT NULL,
    collection_key TEXT NOT NULL,
    name_key    TEXT NOT NULL,
    is_input    INTEGER NOT NULL DEFAULT 1,
    UNIQUE (container, collection_key, name_key)
);
CREATE TABLE IF NOT EXISTS import_rows (
    row_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    lsid         TEXT UNIQUE,
    container    TEXT NOT NULL,
    destination  TEXT NOT NULL,
    created_by   TEXT NOT NULL,
    row_key      TEXT,
    data         TEXT NOT NULL,
    UNIQUE (container, destination, row_key)
);
CREATE TABLE IF NOT EXISTS provenance (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    container     TEXT NOT NULL,
    output_scope  TEXT NOT NULL,
    input_lsid    TEXT,
    output_lsid   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS run_inputs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    container     TEXT NOT NULL,
    output_scope  TEXT NOT NULL,
    input_lsid    TEXT NOT NULL,
    role          TEXT,
    UNIQUE (output_scope, input_lsid)
);
"#;

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::Constraint(message.clone().unwrap_or_else(|| err.to_string()))
            }
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

pub struct SqliteStore {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("Opening SQLite store {path:?}"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().context("Opening in-memory SQLite")?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Initializing store tables")?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    /// Adds an entity that lookup fields can reference.
    pub fn register_entity(
        &self,
        container: &str,
        collection: &str,
        name: &str,
        input: bool,
    ) -> Result<Entity> {
        let lsid = format!("urn:lsid:{container}:{collection}:{name}");
        self.conn
            .execute(
                "INSERT INTO entities \
                 (lsid, container, collection, name, collection_key, name_key, is_input) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    lsid,
                    container,
                    collection,
                    name,
                    normalize_key(collection),
                    normalize_key(name),
                    input
                ],
            )
            .with_context(|| format!("Registering {collection} entity '{name}'"))?;
        Ok(Entity {
            row_id: self.conn.last_insert_rowid(),
            lsid,
            name: name.to_string(),
            collection: collection.to_string(),
            input,
        })
    }

    /// Committed rows for one destination, in insertion order.
    pub fn rows(&self, container: &str, destination: &str) -> Result<Vec<(i64, serde_json::Value)>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_id, data FROM import_rows \
             WHERE container = ?1 AND destination = ?2 ORDER BY row_id",
        )?;
        let rows = stmt
            .query_map(params![container, destination], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(row_id, data)| {
                let value = serde_json::from_str(&data)
                    .with_context(|| format!("Decoding payload of row {row_id}"))?;
                Ok((row_id, value))
            })
            .collect()
    }

    pub fn provenance_edges(&self, container: &str) -> Result<Vec<ProvenanceEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT input_lsid, output_lsid FROM provenance WHERE container = ?1 ORDER BY id",
        )?;
        let edges = stmt
            .query_map(params![container], |row| {
                Ok(ProvenanceEdge::new(row.get(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Run-level inputs recorded in a container, in insertion order.
    pub fn run_inputs(&self, container: &str) -> Result<Vec<RunInput>> {
        let mut stmt = self.conn.prepare(
            "SELECT input_lsid, role FROM run_inputs WHERE container = ?1 ORDER BY id",
        )?;
        let inputs = stmt
            .query_map(params![container], |row| {
                Ok(RunInput {
                    lsid: row.get(0)?,
                    role: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(inputs)
    }

    fn require_transaction(&self) -> Result<(), StorageError> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(StorageError::Transaction("no transaction is open".to_string()))
        }
    }
}

fn collection_key(target: &ReferenceTarget) -> Option<String> {
    target.collection.as_deref().map(normalize_key)
}

fn read_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        row_id: row.get(0)?,
        lsid: row.get(1)?,
        name: row.get(2)?,
        collection: row.get(3)?,
        input: row.get(4)?,
    })
}

impl ImportStore for SqliteStore {
    fn begin(&mut self) -> Result<(), StorageError> {
        if self.in_transaction {
            return Err(StorageError::Transaction(
                "a transaction is already open".to_string(),
            ));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
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
        let mut insert = self.conn.prepare(
            "INSERT INTO import_rows (container, destination, created_by, row_key, data) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut assign = self
            .conn
            .prepare("UPDATE import_rows SET lsid = ?1 WHERE row_id = ?2")?;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let data = serde_json::to_string(&row.to_json(schema))
                .map_err(|err| StorageError::Backend(err.to_string()))?;
            let row_id = insert.insert(params![
                target.container,
                target.destination,
                target.user,
                row.natural_key(schema),
                data
            ])?;
            let lsid = target.row_lsid(row_id);
            assign.execute(params![lsid, row_id])?;
            inserted.push(InsertedRow { row_id, lsid });
        }
        debug!("Inserted {} row(s) into {}", inserted.len(), target.destination);
        Ok(inserted)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.require_transaction()?;
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.require_transaction()?;
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn references(&self) -> Option<&dyn ReferenceBackend> {
        Some(self)
    }

    fn provenance_sink(&mut self) -> Option<&mut dyn ProvenanceSink> {
        Some(self)
    }
}

impl ProvenanceSink for SqliteStore {
    fn add_edges(
        &mut self,
        container: &str,
        output_scope: &str,
        edges: &[ProvenanceEdge],
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO provenance (container, output_scope, input_lsid, output_lsid) \
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for edge in edges {
            stmt.execute(params![container, output_scope, edge.input, edge.output])
                .with_context(|| format!("Recording provenance for {}", edge.output))?;
        }
        Ok(())
    }

    fn add_run_inputs(
        &mut self,
        container: &str,
        output_scope: &str,
        inputs: &[RunInput],
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO run_inputs (container, output_scope, input_lsid, role) \
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for input in inputs {
            stmt.execute(params![container, output_scope, input.lsid, input.role])
                .with_context(|| format!("Recording run input {}", input.lsid))?;
        }
        Ok(())
    }
}

impl ReferenceBackend for SqliteStore {
    fn find_by_name(
        &self,
        target: &ReferenceTarget,
        container: &str,
        name: &str,
    ) -> Result<Option<Entity>> {
        let entity = self
            .conn
            .query_row(
                "SELECT row_id, lsid, name, collection, is_input FROM entities \
                 WHERE container = ?1 AND name_key = ?2 \
                 AND (?3 IS NULL OR collection_key = ?3) \
                 ORDER BY row_id LIMIT 1",
                params![container, normalize_key(name), collection_key(target)],
                read_entity,
            )
            .optional()
            .with_context(|| format!("Looking up '{name}' in {target}"))?;
        Ok(entity)
    }

    fn find_by_id(&self, target: &ReferenceTarget, id: i64) -> Result<Option<Entity>> {
        let entity = self
            .conn
            .query_row(
                "SELECT row_id, lsid, name, collection, is_input FROM entities \
                 WHERE row_id = ?1 AND (?2 IS NULL OR collection_key = ?2)",
                params![id, collection_key(target)],
                read_entity,
            )
            .optional()
            .with_context(|| format!("Looking up id {id} in {target}"))?;
        Ok(entity)
    }
}
