//! Plexus Service - Graph orchestration
//!
//! [`DataGraphService`] composes the identity service, the property
//! value store, and the edge store into the entity- and association-
//! level operations the API layer consumes:
//! - entity writes resolve surrogate ids, persist properties, and notify
//!   the search synchronizer
//! - association writes resolve all three participant ids, persist the
//!   edge entity's properties, then the adjacency row
//! - bulk operations scatter per-item work onto the runtime and join all
//!   of it; one item's failure never aborts its siblings, and every
//!   failure is collected into the returned [`BatchWriteReport`]
//! - top-utilizer ranking is cached in a bounded TTL cache keyed by the
//!   aggregation request; hydration always re-reads the property store

use futures::StreamExt;
use moka::future::Cache;
use plexus_core::{
    AggregationSpec, Association, AuthorizedProperties, BatchWriteReport, BulkAssociation,
    CacheConfig, EdgeDirection, EdgeKey, EndpointRef, EntityDataKey, EntityDefinition,
    EntityIndexer, EntityRow, NeighborTriplet, PlexusError, PropertyValues, Result, RowStream,
    SchemaRegistry, WriteEvent,
};
use plexus_data::PropertyStore;
use plexus_graph::{EdgeRecord, GraphStore};
use plexus_ids::IdService;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

pub mod audit;

pub use audit::{audit_log, AuditEvent};

// ============================================================================
// Results
// ============================================================================

/// Outcome of a combined entities+associations write. Id vectors align
/// positionally with the request; a failed item leaves `None` at its
/// position and a matching entry in the report.
#[derive(Debug, Clone)]
pub struct GraphWriteResult {
    pub entity_key_ids: Vec<Option<Uuid>>,
    pub association_ids: Vec<Option<Uuid>>,
    pub report: BatchWriteReport,
}

/// Cache key for one top-utilizer ranking
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RankingKey {
    entity_set_id: Uuid,
    specs: Vec<AggregationSpec>,
    k: usize,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Graph orchestration service over the three storage leaves and the
/// external collaborators
pub struct DataGraphService {
    /// Surrogate identity service
    ids: Arc<dyn IdService>,

    /// Versioned property store
    data: Arc<dyn PropertyStore>,

    /// Association edge store
    graph: Arc<dyn GraphStore>,

    /// External schema registry (entity-set to entity-type only)
    schema: Arc<dyn SchemaRegistry>,

    /// External search-index synchronizer
    indexer: Arc<dyn EntityIndexer>,

    /// Bounded cache over schema registry type lookups
    entity_types: Cache<Uuid, Uuid>,

    /// Bounded TTL cache of ranked top-utilizer id lists (ids only, not
    /// hydrated rows)
    rankings: Cache<RankingKey, Arc<Vec<(Uuid, u64)>>>,
}

impl DataGraphService {
    /// Create a new orchestrator. Cache bounds and TTLs come from the
    /// caller's configuration, never from hidden statics.
    pub fn new(
        ids: Arc<dyn IdService>,
        data: Arc<dyn PropertyStore>,
        graph: Arc<dyn GraphStore>,
        schema: Arc<dyn SchemaRegistry>,
        indexer: Arc<dyn EntityIndexer>,
        cache_config: &CacheConfig,
    ) -> Self {
        let entity_types = Cache::builder()
            .max_capacity(cache_config.entity_types_capacity)
            .time_to_live(Duration::from_secs(cache_config.entity_types_ttl_secs))
            .build();
        let rankings = Cache::builder()
            .max_capacity(cache_config.top_utilizers_capacity)
            .time_to_live(Duration::from_secs(cache_config.top_utilizers_ttl_secs))
            .build();

        Self {
            ids,
            data,
            graph,
            schema,
            indexer,
            entity_types,
            rankings,
        }
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Create or merge one entity. Returns its surrogate key id once the
    /// property write is acknowledged; index sync is fire-and-forget.
    pub async fn create_entity(
        &self,
        entity_set_id: Uuid,
        external_id: &str,
        properties: PropertyValues,
        authorized: &AuthorizedProperties,
    ) -> Result<Uuid> {
        let entity_key_id = self.ids.resolve(entity_set_id, external_id).await?;

        let payload = HashMap::from([(entity_key_id, properties)]);
        let event = self
            .data
            .create_or_merge(entity_set_id, &payload, authorized)
            .await?;

        let key = EntityDataKey::new(entity_set_id, entity_key_id);
        self.notify_written(key, event.version);
        audit_log(&AuditEvent::EntityWritten {
            entity_set_id,
            entity_key_id,
            event,
        });

        Ok(entity_key_id)
    }

    /// Bulk entity write: per-entity work is scattered onto the runtime
    /// and joined; a failed entity is reported, logged, and does not
    /// abort its siblings.
    pub async fn create_entities(
        &self,
        entity_set_id: Uuid,
        entities: HashMap<String, PropertyValues>,
        authorized: &AuthorizedProperties,
    ) -> Result<BatchWriteReport> {
        if entities.is_empty() {
            return Err(PlexusError::InvalidArgument(
                "no entities in request".to_string(),
            ));
        }

        let requested = entities.len();
        let authorized = Arc::new(authorized.clone());
        let mut join_set = JoinSet::new();

        for (external_id, properties) in entities {
            let ids = Arc::clone(&self.ids);
            let data = Arc::clone(&self.data);
            let authorized = Arc::clone(&authorized);

            join_set.spawn(async move {
                let outcome: Result<(Uuid, WriteEvent)> = async {
                    let entity_key_id = ids.resolve(entity_set_id, &external_id).await?;
                    let payload = HashMap::from([(entity_key_id, properties)]);
                    let event = data
                        .create_or_merge(entity_set_id, &payload, &authorized)
                        .await?;
                    Ok((entity_key_id, event))
                }
                .await;
                (external_id, outcome)
            });
        }

        let mut report = BatchWriteReport::default();
        let mut version = 0i64;
        let mut updates = 0usize;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok((entity_key_id, event)))) => {
                    version = version.max(event.version);
                    updates += event.num_updates;
                    self.notify_written(
                        EntityDataKey::new(entity_set_id, entity_key_id),
                        event.version,
                    );
                }
                Ok((external_id, Err(error))) => {
                    tracing::warn!(
                        entity_set_id = %entity_set_id,
                        external_id = %external_id,
                        error = %error,
                        "Entity write failed"
                    );
                    report.push_failure(external_id, error);
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Entity write task panicked");
                    report.push_failure("<task>", join_error);
                }
            }
        }

        report.event = WriteEvent::new(version, updates);
        audit_log(&AuditEvent::EntitiesWritten {
            entity_set_id,
            requested,
            failed: report.failures.len(),
            event: report.event,
        });
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Associations
    // ------------------------------------------------------------------

    /// Bulk association write. Per association the edge, source, and
    /// destination ids are resolved in parallel; an endpoint that fails
    /// to resolve fails that association only (no partial edge row) and
    /// its siblings proceed.
    pub async fn create_associations(
        &self,
        entity_set_id: Uuid,
        associations: &[Association],
        authorized: &AuthorizedProperties,
    ) -> Result<BatchWriteReport> {
        if associations.is_empty() {
            return Err(PlexusError::InvalidArgument(
                "no associations in request".to_string(),
            ));
        }

        let mut report = BatchWriteReport::default();
        let mut version = 0i64;
        let mut updates = 0usize;

        for association in associations {
            let outcome: Result<(EdgeKey, WriteEvent)> = async {
                if association.key.entity_set_id != entity_set_id {
                    return Err(PlexusError::InvalidArgument(format!(
                        "association {} belongs to entity set {}, not {}",
                        association.key.external_id,
                        association.key.entity_set_id,
                        entity_set_id
                    )));
                }

                let (edge_res, src_res, dst_res) = tokio::join!(
                    self.ids
                        .resolve(association.key.entity_set_id, &association.key.external_id),
                    self.ids
                        .resolve(association.src.entity_set_id, &association.src.external_id),
                    self.ids
                        .resolve(association.dst.entity_set_id, &association.dst.external_id),
                );

                let edge = edge_res.map_err(|e| {
                    PlexusError::EndpointNotFound(format!(
                        "edge {}: {e}",
                        association.key.external_id
                    ))
                })?;
                let src = src_res.map_err(|e| {
                    PlexusError::EndpointNotFound(format!(
                        "src {}: {e}",
                        association.src.external_id
                    ))
                })?;
                let dst = dst_res.map_err(|e| {
                    PlexusError::EndpointNotFound(format!(
                        "dst {}: {e}",
                        association.dst.external_id
                    ))
                })?;

                self.write_edge(
                    EntityDataKey::new(association.key.entity_set_id, edge),
                    EntityDataKey::new(association.src.entity_set_id, src),
                    EntityDataKey::new(association.dst.entity_set_id, dst),
                    &association.details,
                    authorized,
                )
                .await
            }
            .await;

            match outcome {
                Ok((_, event)) => {
                    version = version.max(event.version);
                    updates += event.num_updates;
                }
                Err(error) => {
                    tracing::warn!(
                        entity_set_id = %entity_set_id,
                        association = %association.key.external_id,
                        error = %error,
                        "Association write failed"
                    );
                    report.push_failure(association.key.external_id.clone(), error);
                }
            }
        }

        report.event = WriteEvent::new(version, updates);
        audit_log(&AuditEvent::AssociationsWritten {
            entity_set_id,
            requested: associations.len(),
            failed: report.failures.len(),
            event: report.event,
        });
        Ok(report)
    }

    /// Two-phase combined write: all entities first (so their key ids
    /// exist), then associations, whose endpoints may name just-created
    /// entities positionally. A positional reference past what was
    /// actually created is that association's `InvalidArgument` failure.
    pub async fn create_entities_and_associations(
        &self,
        entities: &[EntityDefinition],
        associations: &[BulkAssociation],
        authorized_by_set: &HashMap<Uuid, AuthorizedProperties>,
    ) -> Result<GraphWriteResult> {
        let mut report = BatchWriteReport::default();
        let mut version = 0i64;
        let mut updates = 0usize;

        // Phase 1: entities, in request order so positional references
        // stay meaningful
        let mut created: Vec<Option<EntityDataKey>> = Vec::with_capacity(entities.len());
        for definition in entities {
            let outcome: Result<(EntityDataKey, WriteEvent)> = async {
                let authorized = authorized_by_set
                    .get(&definition.entity_set_id)
                    .ok_or_else(|| {
                        PlexusError::NotFound(format!("entity set {}", definition.entity_set_id))
                    })?;
                let entity_key_id = self
                    .ids
                    .resolve(definition.entity_set_id, &definition.external_id)
                    .await?;
                let payload = HashMap::from([(entity_key_id, definition.properties.clone())]);
                let event = self
                    .data
                    .create_or_merge(definition.entity_set_id, &payload, authorized)
                    .await?;
                Ok((
                    EntityDataKey::new(definition.entity_set_id, entity_key_id),
                    event,
                ))
            }
            .await;

            match outcome {
                Ok((key, event)) => {
                    version = version.max(event.version);
                    updates += event.num_updates;
                    self.notify_written(key, event.version);
                    created.push(Some(key));
                }
                Err(error) => {
                    tracing::warn!(
                        external_id = %definition.external_id,
                        error = %error,
                        "Entity write failed"
                    );
                    report.push_failure(definition.external_id.clone(), error);
                    created.push(None);
                }
            }
        }

        // Phase 2: associations against the now-existing ids
        let mut association_ids: Vec<Option<Uuid>> = Vec::with_capacity(associations.len());
        for association in associations {
            let outcome: Result<(EdgeKey, WriteEvent)> = async {
                let authorized = authorized_by_set
                    .get(&association.key.entity_set_id)
                    .ok_or_else(|| {
                        PlexusError::NotFound(format!(
                            "entity set {}",
                            association.key.entity_set_id
                        ))
                    })?;

                let src = self.resolve_endpoint(&association.src, &created).await?;
                let dst = self.resolve_endpoint(&association.dst, &created).await?;
                let edge = self
                    .ids
                    .resolve(association.key.entity_set_id, &association.key.external_id)
                    .await
                    .map_err(|e| {
                        PlexusError::EndpointNotFound(format!(
                            "edge {}: {e}",
                            association.key.external_id
                        ))
                    })?;

                self.write_edge(
                    EntityDataKey::new(association.key.entity_set_id, edge),
                    src,
                    dst,
                    &association.details,
                    authorized,
                )
                .await
            }
            .await;

            match outcome {
                Ok((edge_key, event)) => {
                    version = version.max(event.version);
                    updates += event.num_updates;
                    association_ids.push(Some(edge_key.edge.entity_key_id));
                }
                Err(error) => {
                    tracing::warn!(
                        association = %association.key.external_id,
                        error = %error,
                        "Association write failed"
                    );
                    report.push_failure(association.key.external_id.clone(), error);
                    association_ids.push(None);
                }
            }
        }

        report.event = WriteEvent::new(version, updates);
        Ok(GraphWriteResult {
            entity_key_ids: created
                .iter()
                .map(|key| key.map(|k| k.entity_key_id))
                .collect(),
            association_ids,
            report,
        })
    }

    // ------------------------------------------------------------------
    // Deletes
    // ------------------------------------------------------------------

    /// Composed entity delete: removes the vertex's adjacency rows and
    /// tombstones its properties. Neighbor vertices keep their
    /// properties.
    pub async fn delete_entity(
        &self,
        key: EntityDataKey,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent> {
        self.graph.delete_vertex(key.entity_key_id).await?;
        let event = self
            .data
            .clear(key.entity_set_id, Some(&[key.entity_key_id]), authorized)
            .await?;

        self.notify_deleted(key);
        audit_log(&AuditEvent::EntityDeleted {
            entity_set_id: key.entity_set_id,
            entity_key_id: key.entity_key_id,
        });
        Ok(event)
    }

    /// Composed association delete: removes the adjacency row and
    /// tombstones the edge entity's own properties. Endpoint vertices
    /// are unaffected.
    pub async fn delete_association(
        &self,
        key: EdgeKey,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent> {
        self.graph.delete_edge(&key).await?;
        let event = self
            .data
            .clear(
                key.edge.entity_set_id,
                Some(&[key.edge.entity_key_id]),
                authorized,
            )
            .await?;

        self.notify_deleted(key.edge);
        audit_log(&AuditEvent::AssociationDeleted {
            entity_set_id: key.edge.entity_set_id,
            edge_entity_key_id: key.edge.entity_key_id,
        });
        Ok(event)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Rank the set's entities by type-filtered adjacency count and
    /// hydrate the winners, emitted in rank order. The ranked id list is
    /// cached per (set, specs, k) for the configured TTL; hydration is
    /// never cached.
    pub async fn get_top_utilizers(
        &self,
        entity_set_id: Uuid,
        specs: Vec<AggregationSpec>,
        k: usize,
        authorized: &AuthorizedProperties,
    ) -> Result<RowStream> {
        if specs.is_empty() {
            return Err(PlexusError::InvalidArgument(
                "no aggregation specs in request".to_string(),
            ));
        }

        let cache_key = RankingKey {
            entity_set_id,
            specs,
            k,
        };

        let ranked = match self.rankings.get(&cache_key).await {
            Some(ranked) => {
                tracing::debug!(entity_set_id = %entity_set_id, "Top-utilizer ranking served from cache");
                ranked
            }
            None => {
                let (src_filters, dst_filters) = filters_from_specs(&cache_key.specs);
                let ranked = Arc::new(
                    self.graph
                        .aggregate_top_neighbors(entity_set_id, &src_filters, &dst_filters, k)
                        .await?,
                );
                self.rankings
                    .insert(cache_key.clone(), Arc::clone(&ranked))
                    .await;
                ranked
            }
        };

        // Hydrate through the property store and re-emit in rank order
        let ids: HashSet<Uuid> = ranked.iter().map(|(id, _)| *id).collect();
        let by_set = HashMap::from([(entity_set_id, authorized.clone())]);
        let rows = self
            .data
            .read(&[entity_set_id], Some(&ids), &by_set, false)
            .await?;

        let mut by_id: HashMap<Uuid, EntityRow> = HashMap::new();
        let mut collected = rows.collect::<Vec<_>>().await;
        for row in collected.drain(..) {
            let row = row?;
            by_id.insert(row.row_id, row);
        }

        let ordered: Vec<Result<EntityRow>> = ranked
            .iter()
            .filter_map(|(id, _)| by_id.remove(id).map(Ok))
            .collect();
        Ok(futures::stream::iter(ordered).boxed())
    }

    /// Neighbor triplets reachable from the set (pass-through to the
    /// edge store)
    pub async fn neighbors(&self, entity_set_id: Uuid) -> Result<HashSet<NeighborTriplet>> {
        self.graph.neighbors(entity_set_id).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn resolve_endpoint(
        &self,
        endpoint: &EndpointRef,
        created: &[Option<EntityDataKey>],
    ) -> Result<EntityDataKey> {
        match endpoint {
            EndpointRef::Key(key) => {
                let entity_key_id = self
                    .ids
                    .resolve(key.entity_set_id, &key.external_id)
                    .await
                    .map_err(|e| {
                        PlexusError::EndpointNotFound(format!("{}: {e}", key.external_id))
                    })?;
                Ok(EntityDataKey::new(key.entity_set_id, entity_key_id))
            }
            EndpointRef::Index(index) => {
                created.get(*index).copied().flatten().ok_or_else(|| {
                    PlexusError::InvalidArgument(format!(
                        "positional reference {index} does not name a created entity"
                    ))
                })
            }
        }
    }

    /// Persist one edge: the edge entity's properties first, then the
    /// adjacency row, typed via the (cached) schema registry.
    async fn write_edge(
        &self,
        edge: EntityDataKey,
        src: EntityDataKey,
        dst: EntityDataKey,
        details: &PropertyValues,
        authorized: &AuthorizedProperties,
    ) -> Result<(EdgeKey, WriteEvent)> {
        let edge_type_id = self.entity_type_of(edge.entity_set_id).await?;
        let src_type_id = self.entity_type_of(src.entity_set_id).await?;
        let dst_type_id = self.entity_type_of(dst.entity_set_id).await?;

        let payload = HashMap::from([(edge.entity_key_id, details.clone())]);
        let props_event = self
            .data
            .create_or_merge(edge.entity_set_id, &payload, authorized)
            .await?;

        let edge_key = EdgeKey::new(edge, src, dst);
        let edge_event = self
            .graph
            .create_edge(&EdgeRecord {
                key: edge_key,
                edge_type_id,
                src_type_id,
                dst_type_id,
            })
            .await?;

        let version = props_event.version.max(edge_event.version);
        self.notify_written(edge, version);
        Ok((
            edge_key,
            WriteEvent::new(version, props_event.num_updates + edge_event.num_updates),
        ))
    }

    /// Entity type of a set, via the bounded lookaside cache
    async fn entity_type_of(&self, entity_set_id: Uuid) -> Result<Uuid> {
        if let Some(entity_type) = self.entity_types.get(&entity_set_id).await {
            return Ok(entity_type);
        }
        let entity_type = self.schema.entity_type_of(entity_set_id).await?;
        self.entity_types.insert(entity_set_id, entity_type).await;
        Ok(entity_type)
    }

    /// Fire-and-forget index notification; failures are logged, never
    /// surfaced
    fn notify_written(&self, key: EntityDataKey, version: i64) {
        let indexer = Arc::clone(&self.indexer);
        tokio::spawn(async move {
            if let Err(error) = indexer.entity_written(key, version).await {
                tracing::warn!(
                    indexer = indexer.name(),
                    entity_key_id = %key.entity_key_id,
                    error = %error,
                    "Index write notification failed"
                );
            }
        });
    }

    fn notify_deleted(&self, key: EntityDataKey) {
        let indexer = Arc::clone(&self.indexer);
        tokio::spawn(async move {
            if let Err(error) = indexer.entity_deleted(key).await {
                tracing::warn!(
                    indexer = indexer.name(),
                    entity_key_id = %key.entity_key_id,
                    error = %error,
                    "Index delete notification failed"
                );
            }
        });
    }
}

/// Split aggregation specs into the per-direction filter maps the edge
/// store consumes
fn filters_from_specs(
    specs: &[AggregationSpec],
) -> (
    HashMap<Uuid, HashSet<Uuid>>,
    HashMap<Uuid, HashSet<Uuid>>,
) {
    let mut src_filters: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    let mut dst_filters: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();

    for spec in specs {
        let target = match spec.direction {
            EdgeDirection::Outgoing => &mut src_filters,
            EdgeDirection::Incoming => &mut dst_filters,
        };
        target
            .entry(spec.association_type_id)
            .or_default()
            .extend(spec.neighbor_type_ids.iter().copied());
    }

    (src_filters, dst_filters)
}

// ============================================================================
// Collaborator Implementations
// ============================================================================

/// Schema registry backed by a fixed set -> type map. Suitable for
/// embedded deployments and tests; production wires the real registry.
pub struct StaticSchemaRegistry {
    types: HashMap<Uuid, Uuid>,
}

impl StaticSchemaRegistry {
    pub fn new(types: HashMap<Uuid, Uuid>) -> Self {
        Self { types }
    }
}

#[async_trait::async_trait]
impl SchemaRegistry for StaticSchemaRegistry {
    async fn entity_type_of(&self, entity_set_id: Uuid) -> Result<Uuid> {
        self.types
            .get(&entity_set_id)
            .copied()
            .ok_or_else(|| PlexusError::NotFound(format!("entity set {entity_set_id}")))
    }
}

/// Indexer that drops every notification. Useful when no search index is
/// deployed.
pub struct NoopIndexer;

#[async_trait::async_trait]
impl EntityIndexer for NoopIndexer {
    async fn entity_written(&self, _key: EntityDataKey, _version: i64) -> Result<()> {
        Ok(())
    }

    async fn entity_deleted(&self, _key: EntityDataKey) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}
