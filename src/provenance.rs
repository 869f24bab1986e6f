//! Provenance edge collection.
//!
//! Each persisted row yields either one edge per discovered input or a single
//! edge with no input, so every output can be enumerated downstream.

use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

/// Passthrough column carrying explicitly supplied input ids.
pub const PROVENANCE_INPUT_KEY: &str = "prov:objectInputs";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProvenanceEdge {
    pub input: Option<String>,
    pub output: String,
}

impl ProvenanceEdge {
    pub fn new(input: Option<String>, output: impl Into<String>) -> Self {
        Self {
            input,
            output: output.into(),
        }
    }
}

/// An entity consumed by a run as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInput {
    pub lsid: String,
    /// Lookup field that resolved the entity; `None` when it was linked
    /// through contextual resolution.
    pub role: Option<String>,
}

/// Run-level inputs in discovery order. The first role seen for an entity
/// sticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInputs {
    entries: Vec<RunInput>,
    seen: HashSet<String>,
}

impl RunInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the entity was already recorded.
    pub fn add(&mut self, lsid: &str, role: Option<&str>) -> bool {
        if !self.seen.insert(lsid.to_string()) {
            return false;
        }
        self.entries.push(RunInput {
            lsid: lsid.to_string(),
            role: role.map(str::to_string),
        });
        true
    }

    pub fn role(&self, lsid: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|entry| entry.lsid == lsid)
            .map(|entry| entry.role.as_deref())
    }

    pub fn as_slice(&self) -> &[RunInput] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receives the edges of a committed batch.
pub trait ProvenanceSink {
    fn add_edges(
        &mut self,
        container: &str,
        output_scope: &str,
        edges: &[ProvenanceEdge],
    ) -> Result<()>;

    /// Records the entities the run consumed as a whole. Sinks that keep no
    /// run records ignore them.
    fn add_run_inputs(
        &mut self,
        _container: &str,
        _output_scope: &str,
        _inputs: &[RunInput],
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ProvenanceCollector {
    edges: BTreeSet<ProvenanceEdge>,
    flushed: bool,
}

impl ProvenanceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row<I, S>(&mut self, output: &str, inputs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut any = false;
        for input in inputs {
            any = true;
            self.edges
                .insert(ProvenanceEdge::new(Some(input.into()), output));
        }
        if !any {
            self.edges.insert(ProvenanceEdge::new(None, output));
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &ProvenanceEdge> {
        self.edges.iter()
    }

    /// Hands every collected edge to the sink. Returns how many were written;
    /// zero when no sink is configured.
    pub fn flush(
        &mut self,
        sink: Option<&mut dyn ProvenanceSink>,
        container: &str,
        output_scope: &str,
    ) -> Result<usize> {
        debug_assert!(!self.flushed, "provenance flushed twice");
        self.flushed = true;
        let Some(sink) = sink else {
            debug!("No provenance sink configured; skipping {} edge(s)", self.edges.len());
            return Ok(0);
        };
        if self.edges.is_empty() {
            return Ok(0);
        }
        let edges = self.edges.iter().cloned().collect::<Vec<_>>();
        sink.add_edges(container, output_scope, &edges)?;
        Ok(edges.len())
    }
}
