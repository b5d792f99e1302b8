//! Plexus Graph - Association edge store
//!
//! Models associations as first-class directed edges keyed by
//! [`EdgeKey`]: the edge's own entity address plus its two endpoints.
//! Each edge row carries the entity-type ids of all three participants
//! so neighbor and aggregation queries filter without consulting the
//! schema registry.
//!
//! Endpoint existence is the orchestrator's contract: this store never
//! creates missing endpoints and never deletes endpoint properties.

use async_trait::async_trait;
use plexus_core::{EdgeDirection, EdgeKey, NeighborTriplet, Result, WriteEvent};
use plexus_storage::{decode, put_record, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Primary adjacency rows, keyed edge/src/dst
const EDGES: &str = "edges";

/// Index rows keyed by source vertex, for cascading vertex deletes
const EDGES_BY_SRC: &str = "edges_by_src";

/// Index rows keyed by destination vertex
const EDGES_BY_DST: &str = "edges_by_dst";

/// One adjacency row: the edge key plus the entity-type ids needed for
/// fast neighbor filtering (set ids ride in the [`EdgeKey`]'s addresses)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub key: EdgeKey,
    pub edge_type_id: Uuid,
    pub src_type_id: Uuid,
    pub dst_type_id: Uuid,
}

/// Trait for graph edge operations
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert the adjacency row. Both endpoint key ids must already be
    /// resolvable; enforcing that is the caller's responsibility.
    async fn create_edge(&self, record: &EdgeRecord) -> Result<WriteEvent>;

    /// Remove one adjacency row; endpoint vertex properties untouched
    async fn delete_edge(&self, key: &EdgeKey) -> Result<()>;

    /// Remove every adjacency row where the vertex participates as src
    /// or dst. The vertex's own properties are the caller's separate
    /// responsibility.
    async fn delete_vertex(&self, entity_key_id: Uuid) -> Result<()>;

    /// The (association type, neighbor type, direction) triplets
    /// reachable from any entity of the set. Query-building aid, not a
    /// traversal primitive.
    async fn neighbors(&self, entity_set_id: Uuid) -> Result<HashSet<NeighborTriplet>>;

    /// Rank the set's entities by type-filtered adjacency count.
    /// `src_filters` counts edges where the entity is the source and the
    /// destination's type matches; `dst_filters` the mirror image. Top-k
    /// by count descending, ties broken by ascending entity key id.
    async fn aggregate_top_neighbors(
        &self,
        entity_set_id: Uuid,
        src_filters: &HashMap<Uuid, HashSet<Uuid>>,
        dst_filters: &HashMap<Uuid, HashSet<Uuid>>,
        k: usize,
    ) -> Result<Vec<(Uuid, u64)>>;
}

/// [`GraphStore`] over the key/value substrate
pub struct KvGraphStore {
    store: Arc<dyn KeyValueStore>,
}

impl KvGraphStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn edge_row_key(key: &EdgeKey) -> String {
        format!(
            "{}/{}/{}",
            key.edge.entity_key_id, key.src.entity_key_id, key.dst.entity_key_id
        )
    }

    fn by_src_key(key: &EdgeKey) -> String {
        format!(
            "{}/{}/{}",
            key.src.entity_key_id, key.edge.entity_key_id, key.dst.entity_key_id
        )
    }

    fn by_dst_key(key: &EdgeKey) -> String {
        format!(
            "{}/{}/{}",
            key.dst.entity_key_id, key.edge.entity_key_id, key.src.entity_key_id
        )
    }

    /// Remove the primary row and both index rows for one edge. Missing
    /// rows count as already removed, so a torn three-row write is
    /// repaired rather than fatal.
    async fn remove_edge_rows(&self, key: &EdgeKey) -> Result<bool> {
        let existed = self.store.remove(EDGES, &Self::edge_row_key(key)).await?;
        self.store.remove(EDGES_BY_SRC, &Self::by_src_key(key)).await?;
        self.store.remove(EDGES_BY_DST, &Self::by_dst_key(key)).await?;
        Ok(existed)
    }
}

#[async_trait]
impl GraphStore for KvGraphStore {
    async fn create_edge(&self, record: &EdgeRecord) -> Result<WriteEvent> {
        let store = self.store.as_ref();
        put_record(store, EDGES, &Self::edge_row_key(&record.key), record).await?;
        put_record(store, EDGES_BY_SRC, &Self::by_src_key(&record.key), record).await?;
        put_record(store, EDGES_BY_DST, &Self::by_dst_key(&record.key), record).await?;

        tracing::debug!(
            edge = %record.key.edge.entity_key_id,
            src = %record.key.src.entity_key_id,
            dst = %record.key.dst.entity_key_id,
            "Edge created"
        );
        Ok(WriteEvent::new(
            chrono_millis(),
            1,
        ))
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<()> {
        self.remove_edge_rows(key).await?;
        Ok(())
    }

    async fn delete_vertex(&self, entity_key_id: Uuid) -> Result<()> {
        let prefix = format!("{entity_key_id}/");
        let mut removed = 0usize;

        for keyspace in [EDGES_BY_SRC, EDGES_BY_DST] {
            for (_, bytes) in self.store.scan_prefix(keyspace, &prefix).await? {
                let record: EdgeRecord = decode(&bytes)?;
                if self.remove_edge_rows(&record.key).await? {
                    removed += 1;
                }
            }
        }

        tracing::debug!(
            entity_key_id = %entity_key_id,
            removed,
            "Vertex adjacency removed"
        );
        Ok(())
    }

    async fn neighbors(&self, entity_set_id: Uuid) -> Result<HashSet<NeighborTriplet>> {
        let mut triplets = HashSet::new();

        for (_, bytes) in self.store.scan_prefix(EDGES, "").await? {
            let record: EdgeRecord = decode(&bytes)?;
            if record.key.src.entity_set_id == entity_set_id {
                triplets.insert(NeighborTriplet {
                    association_type_id: record.edge_type_id,
                    neighbor_type_id: record.dst_type_id,
                    direction: EdgeDirection::Outgoing,
                });
            }
            if record.key.dst.entity_set_id == entity_set_id {
                triplets.insert(NeighborTriplet {
                    association_type_id: record.edge_type_id,
                    neighbor_type_id: record.src_type_id,
                    direction: EdgeDirection::Incoming,
                });
            }
        }

        Ok(triplets)
    }

    async fn aggregate_top_neighbors(
        &self,
        entity_set_id: Uuid,
        src_filters: &HashMap<Uuid, HashSet<Uuid>>,
        dst_filters: &HashMap<Uuid, HashSet<Uuid>>,
        k: usize,
    ) -> Result<Vec<(Uuid, u64)>> {
        let mut counts: HashMap<Uuid, u64> = HashMap::new();

        for (_, bytes) in self.store.scan_prefix(EDGES, "").await? {
            let record: EdgeRecord = decode(&bytes)?;

            if record.key.src.entity_set_id == entity_set_id {
                if let Some(neighbor_types) = src_filters.get(&record.edge_type_id) {
                    if neighbor_types.contains(&record.dst_type_id) {
                        *counts.entry(record.key.src.entity_key_id).or_default() += 1;
                    }
                }
            }
            if record.key.dst.entity_set_id == entity_set_id {
                if let Some(neighbor_types) = dst_filters.get(&record.edge_type_id) {
                    if neighbor_types.contains(&record.src_type_id) {
                        *counts.entry(record.key.dst.entity_key_id).or_default() += 1;
                    }
                }
            }
        }

        let mut ranked: Vec<(Uuid, u64)> = counts.into_iter().collect();
        // Count descending, entity key id ascending for determinism
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        Ok(ranked)
    }
}

fn chrono_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
