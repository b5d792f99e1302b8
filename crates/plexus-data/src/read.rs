//! Row assembly for streaming reads
//!
//! Collects (row id, property fqn, value) triples scanned from the value
//! keyspace into logical rows, deduplicating by content hash so linked
//! reads union values across contributing entity sets without repeats.

use futures::StreamExt;
use plexus_core::{EntityRow, RowStream};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Accumulates scanned values into [`EntityRow`]s
#[derive(Default)]
pub struct EntityRowAssembler {
    rows: HashMap<Uuid, HashMap<String, Vec<serde_json::Value>>>,
    seen: HashSet<(Uuid, String, String)>,
}

impl EntityRowAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one live value to a logical row. Values already contributed
    /// for the same (row, property, content hash) are dropped.
    pub fn push(&mut self, row_id: Uuid, fqn: &str, hash: &str, value: serde_json::Value) {
        if !self
            .seen
            .insert((row_id, fqn.to_string(), hash.to_string()))
        {
            return;
        }
        self.rows
            .entry(row_id)
            .or_default()
            .entry(fqn.to_string())
            .or_default()
            .push(value);
    }

    /// Number of logical rows assembled so far
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Finish assembly and expose the rows as a lazy stream
    pub fn into_stream(self) -> RowStream {
        futures::stream::iter(
            self.rows
                .into_iter()
                .map(|(row_id, properties)| Ok(EntityRow { row_id, properties })),
        )
        .boxed()
    }
}
