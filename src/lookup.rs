//! Reference resolution with a batch-scoped memo.
//!
//! Lookups are keyed by `(target class, container, normalized key)`; both hits
//! and misses are remembered so the backend sees each distinct key at most
//! once per import run. A cache must not outlive the run that created it.

use std::collections::HashMap;

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{reconcile::normalize_key, schema::ReferenceTarget, value::Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub row_id: i64,
    pub lsid: String,
    pub name: String,
    pub collection: String,
    /// Whether the entity counts as an input for provenance purposes.
    pub input: bool,
}

pub trait ReferenceBackend {
    /// Case-insensitive lookup by display name within the target's collection,
    /// or across every collection when the target is unscoped.
    fn find_by_name(
        &self,
        target: &ReferenceTarget,
        container: &str,
        name: &str,
    ) -> Result<Option<Entity>>;

    fn find_by_id(&self, target: &ReferenceTarget, id: i64) -> Result<Option<Entity>>;
}

type NameKey = (String, String, String);
type IdKey = (String, i64);

pub struct ResolutionCache<'a> {
    backend: &'a dyn ReferenceBackend,
    by_name: HashMap<NameKey, Option<Entity>>,
    by_id: HashMap<IdKey, Option<Entity>>,
    hits: usize,
    misses: usize,
}

impl<'a> ResolutionCache<'a> {
    pub fn new(backend: &'a dyn ReferenceBackend) -> Self {
        Self {
            backend,
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn resolve_by_name(
        &mut self,
        target: &ReferenceTarget,
        container: &str,
        name: &str,
    ) -> Result<Option<Entity>> {
        let key = (
            target.class_key(),
            normalize_key(container),
            normalize_key(name),
        );
        if let Some(cached) = self.by_name.get(&key) {
            self.hits += 1;
            return Ok(cached.clone());
        }
        self.misses += 1;
        let found = self.backend.find_by_name(target, container, name.trim())?;
        if let Some(entity) = &found {
            self.by_id
                .entry((target.class_key(), entity.row_id))
                .or_insert_with(|| Some(entity.clone()));
        }
        self.by_name.insert(key, found.clone());
        Ok(found)
    }

    pub fn resolve_by_id(&mut self, target: &ReferenceTarget, id: i64) -> Result<Option<Entity>> {
        let key = (target.class_key(), id);
        if let Some(cached) = self.by_id.get(&key) {
            self.hits += 1;
            return Ok(cached.clone());
        }
        self.misses += 1;
        let found = self.backend.find_by_id(target, id)?;
        self.by_id.insert(key, found.clone());
        Ok(found)
    }

    /// Dispatches on the value: text resolves by name, integers by id.
    pub fn resolve(
        &mut self,
        target: &ReferenceTarget,
        container: &str,
        value: &Value,
    ) -> Result<Option<Entity>> {
        match value {
            Value::String(name) => self.resolve_by_name(target, container, name),
            Value::Integer(id) => self.resolve_by_id(target, *id),
            other => {
                debug!("Value '{other}' cannot address an entity of {target}");
                Ok(None)
            }
        }
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}
