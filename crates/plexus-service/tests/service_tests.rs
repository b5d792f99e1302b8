//! End-to-end orchestration tests over the in-process substrate

use async_trait::async_trait;
use futures::StreamExt;
use plexus_core::{
    AggregationSpec, Association, AuthorizedProperties, BulkAssociation, CacheConfig,
    EdgeDirection, EdgeKey, EndpointRef, EntityDataKey, EntityDefinition, EntityIndexer,
    EntityKey, PlexusError, PropertyDataType, PropertyTypeDescriptor, PropertyValues, Result,
};
use plexus_data::{KvPropertyStore, PropertyStore};
use plexus_graph::{EdgeRecord, GraphStore, KvGraphStore};
use plexus_ids::{IdService, KvIdService};
use plexus_service::{DataGraphService, StaticSchemaRegistry};
use plexus_storage::{KeyValueStore, MemoryStore};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Test Doubles
// ============================================================================

/// Indexer that records every notification it receives
#[derive(Default)]
struct RecordingIndexer {
    written: Mutex<Vec<(EntityDataKey, i64)>>,
    deleted: Mutex<Vec<EntityDataKey>>,
}

#[async_trait]
impl EntityIndexer for RecordingIndexer {
    async fn entity_written(&self, key: EntityDataKey, version: i64) -> Result<()> {
        self.written.lock().unwrap().push((key, version));
        Ok(())
    }

    async fn entity_deleted(&self, key: EntityDataKey) -> Result<()> {
        self.deleted.lock().unwrap().push(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Graph store wrapper counting aggregation computations
struct CountingGraphStore {
    inner: Arc<dyn GraphStore>,
    aggregations: Arc<AtomicUsize>,
}

#[async_trait]
impl GraphStore for CountingGraphStore {
    async fn create_edge(&self, record: &EdgeRecord) -> Result<plexus_core::WriteEvent> {
        self.inner.create_edge(record).await
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<()> {
        self.inner.delete_edge(key).await
    }

    async fn delete_vertex(&self, entity_key_id: Uuid) -> Result<()> {
        self.inner.delete_vertex(entity_key_id).await
    }

    async fn neighbors(
        &self,
        entity_set_id: Uuid,
    ) -> Result<HashSet<plexus_core::NeighborTriplet>> {
        self.inner.neighbors(entity_set_id).await
    }

    async fn aggregate_top_neighbors(
        &self,
        entity_set_id: Uuid,
        src_filters: &HashMap<Uuid, HashSet<Uuid>>,
        dst_filters: &HashMap<Uuid, HashSet<Uuid>>,
        k: usize,
    ) -> Result<Vec<(Uuid, u64)>> {
        self.aggregations.fetch_add(1, Ordering::SeqCst);
        self.inner
            .aggregate_top_neighbors(entity_set_id, src_filters, dst_filters, k)
            .await
    }
}

/// Identity service that fails resolution for poisoned external ids,
/// simulating an unreachable substrate for those keys
struct FlakyIdService {
    inner: Arc<dyn IdService>,
    poisoned: HashSet<String>,
}

#[async_trait]
impl IdService for FlakyIdService {
    async fn resolve(&self, entity_set_id: Uuid, external_id: &str) -> Result<Uuid> {
        if self.poisoned.contains(external_id) {
            return Err(PlexusError::Unavailable(format!(
                "simulated outage resolving {external_id}"
            )));
        }
        self.inner.resolve(entity_set_id, external_id).await
    }

    async fn resolve_batch(
        &self,
        entity_set_id: Uuid,
        external_ids: &HashSet<String>,
    ) -> Result<HashMap<String, Uuid>> {
        self.inner.resolve_batch(entity_set_id, external_ids).await
    }

    async fn reserve(&self, entity_set_id: Uuid, count: usize) -> Result<Vec<Uuid>> {
        self.inner.reserve(entity_set_id, count).await
    }

    async fn reverse_lookup(&self, entity_key_id: Uuid) -> Result<EntityKey> {
        self.inner.reverse_lookup(entity_key_id).await
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    service: DataGraphService,
    ids: Arc<dyn IdService>,
    data: Arc<KvPropertyStore>,
    indexer: Arc<RecordingIndexer>,
    aggregations: Arc<AtomicUsize>,

    person_set: Uuid,
    person_type: Uuid,
    org_set: Uuid,
    org_type: Uuid,
    works_at_set: Uuid,
    works_at_type: Uuid,
    knows_set: Uuid,
    knows_type: Uuid,

    name: PropertyTypeDescriptor,
    age: PropertyTypeDescriptor,
    role: PropertyTypeDescriptor,
}

impl Harness {
    fn new() -> Self {
        Self::with_poisoned_ids(HashSet::new())
    }

    fn with_poisoned_ids(poisoned: HashSet<String>) -> Self {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let person_set = Uuid::new_v4();
        let person_type = Uuid::new_v4();
        let org_set = Uuid::new_v4();
        let org_type = Uuid::new_v4();
        let works_at_set = Uuid::new_v4();
        let works_at_type = Uuid::new_v4();
        let knows_set = Uuid::new_v4();
        let knows_type = Uuid::new_v4();

        let ids: Arc<dyn IdService> = Arc::new(FlakyIdService {
            inner: Arc::new(KvIdService::new(Arc::clone(&kv))),
            poisoned,
        });
        let data = Arc::new(KvPropertyStore::new(Arc::clone(&kv)));
        let aggregations = Arc::new(AtomicUsize::new(0));
        let graph: Arc<dyn GraphStore> = Arc::new(CountingGraphStore {
            inner: Arc::new(KvGraphStore::new(Arc::clone(&kv))),
            aggregations: Arc::clone(&aggregations),
        });
        let schema = Arc::new(StaticSchemaRegistry::new(HashMap::from([
            (person_set, person_type),
            (org_set, org_type),
            (works_at_set, works_at_type),
            (knows_set, knows_type),
        ])));
        let indexer = Arc::new(RecordingIndexer::default());

        let service = DataGraphService::new(
            Arc::clone(&ids),
            data.clone() as Arc<dyn PropertyStore>,
            graph,
            schema,
            indexer.clone() as Arc<dyn EntityIndexer>,
            &CacheConfig::default(),
        );

        Self {
            service,
            ids,
            data,
            indexer,
            aggregations,
            person_set,
            person_type,
            org_set,
            org_type,
            works_at_set,
            works_at_type,
            knows_set,
            knows_type,
            name: descriptor("person.name"),
            age: descriptor("person.age"),
            role: descriptor("works_at.role"),
        }
    }

    fn person_auth(&self) -> AuthorizedProperties {
        authorized(&[&self.name, &self.age])
    }

    fn edge_auth(&self) -> AuthorizedProperties {
        authorized(&[&self.role])
    }

    async fn read_set(
        &self,
        entity_set_id: Uuid,
        auth: &AuthorizedProperties,
    ) -> HashMap<Uuid, HashMap<String, Vec<serde_json::Value>>> {
        let by_set = HashMap::from([(entity_set_id, auth.clone())]);
        self.data
            .read(&[entity_set_id], None, &by_set, false)
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|row| {
                let row = row.unwrap();
                (row.row_id, row.properties)
            })
            .collect()
    }

    fn works_at(&self, edge_id: &str, src: &str, dst: &str) -> Association {
        Association {
            key: EntityKey::new(self.works_at_set, edge_id),
            src: EntityKey::new(self.person_set, src),
            dst: EntityKey::new(self.org_set, dst),
            details: props(self.role.id, json!("engineer")),
        }
    }
}

fn descriptor(fqn: &str) -> PropertyTypeDescriptor {
    PropertyTypeDescriptor::new(Uuid::new_v4(), fqn, PropertyDataType::Text)
}

fn authorized(descriptors: &[&PropertyTypeDescriptor]) -> AuthorizedProperties {
    descriptors.iter().map(|d| (d.id, (*d).clone())).collect()
}

fn props(property_type_id: Uuid, value: serde_json::Value) -> PropertyValues {
    HashMap::from([(property_type_id, vec![value])])
}

/// Let spawned fire-and-forget notifications land
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Entities
// ============================================================================

#[tokio::test]
async fn test_create_entity_then_read() {
    let h = Harness::new();
    let auth = h.person_auth();

    let id = h
        .service
        .create_entity(h.person_set, "p1", props(h.age.id, json!(30)), &auth)
        .await
        .unwrap();

    let rows = h.read_set(h.person_set, &auth).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[&id]["person.age"], vec![json!(30)]);

    // Repeating the create returns the same surrogate id
    let again = h
        .service
        .create_entity(h.person_set, "p1", props(h.age.id, json!(30)), &auth)
        .await
        .unwrap();
    assert_eq!(id, again);

    settle().await;
    let written = h.indexer.written.lock().unwrap();
    assert!(written
        .iter()
        .any(|(key, _)| key.entity_key_id == id && key.entity_set_id == h.person_set));
}

#[tokio::test]
async fn test_create_entities_reports_partial_failure() {
    let h = Harness::with_poisoned_ids(HashSet::from(["bad".to_string()]));
    let auth = h.person_auth();

    let entities = HashMap::from([
        ("good-1".to_string(), props(h.name.id, json!("ada"))),
        ("bad".to_string(), props(h.name.id, json!("ghost"))),
        ("good-2".to_string(), props(h.name.id, json!("grace"))),
    ]);

    let report = h
        .service
        .create_entities(h.person_set, entities, &auth)
        .await
        .unwrap();

    // The failed entity is named, the survivors landed
    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].item, "bad");
    assert_eq!(report.event.num_updates, 2);

    let rows = h.read_set(h.person_set, &auth).await;
    assert_eq!(rows.len(), 2);
}

// ============================================================================
// Associations
// ============================================================================

#[tokio::test]
async fn test_create_associations_writes_edge_and_properties() {
    let h = Harness::new();
    let person_auth = h.person_auth();
    let edge_auth = h.edge_auth();

    h.service
        .create_entity(h.person_set, "p1", props(h.name.id, json!("ada")), &person_auth)
        .await
        .unwrap();
    h.service
        .create_entity(h.org_set, "o1", props(h.name.id, json!("acme")), &person_auth)
        .await
        .unwrap();

    let report = h
        .service
        .create_associations(h.works_at_set, &[h.works_at("e1", "p1", "o1")], &edge_auth)
        .await
        .unwrap();

    assert!(report.is_complete());
    // One edge property plus the adjacency row
    assert_eq!(report.event.num_updates, 2);

    let triplets = h.service.neighbors(h.person_set).await.unwrap();
    assert_eq!(triplets.len(), 1);
    let triplet = triplets.into_iter().next().unwrap();
    assert_eq!(triplet.association_type_id, h.works_at_type);
    assert_eq!(triplet.neighbor_type_id, h.org_type);
    assert_eq!(triplet.direction, EdgeDirection::Outgoing);

    // The edge entity's own properties are readable
    let edge_rows = h.read_set(h.works_at_set, &edge_auth).await;
    assert_eq!(edge_rows.len(), 1);
    let (_, properties) = edge_rows.into_iter().next().unwrap();
    assert_eq!(properties["works_at.role"], vec![json!("engineer")]);
}

#[tokio::test]
async fn test_association_with_unresolvable_endpoint_skips_only_that_edge() {
    let h = Harness::with_poisoned_ids(HashSet::from(["ghost".to_string()]));
    let edge_auth = h.edge_auth();

    let report = h
        .service
        .create_associations(
            h.works_at_set,
            &[
                h.works_at("e1", "p1", "o1"),
                h.works_at("e2", "ghost", "o1"),
            ],
            &edge_auth,
        )
        .await
        .unwrap();

    // The sibling landed, the bad association is named and produced no
    // edge row
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].item, "e2");
    assert_eq!(report.event.num_updates, 2);

    let triplets = h.service.neighbors(h.person_set).await.unwrap();
    assert_eq!(triplets.len(), 1);

    // Only e1's edge entity exists
    let edge_rows = h.read_set(h.works_at_set, &edge_auth).await;
    assert_eq!(edge_rows.len(), 1);
}

#[tokio::test]
async fn test_positional_reference_association() {
    let h = Harness::new();
    let authorized_by_set = HashMap::from([
        (h.person_set, h.person_auth()),
        (h.knows_set, h.edge_auth()),
    ]);

    let entities = vec![
        EntityDefinition {
            entity_set_id: h.person_set,
            external_id: "a".to_string(),
            properties: props(h.name.id, json!("ada")),
        },
        EntityDefinition {
            entity_set_id: h.person_set,
            external_id: "b".to_string(),
            properties: props(h.name.id, json!("grace")),
        },
    ];
    let associations = vec![BulkAssociation {
        key: EntityKey::new(h.knows_set, "k1"),
        src: EndpointRef::Index(0),
        dst: EndpointRef::Index(1),
        details: props(h.role.id, json!("colleague")),
    }];

    let result = h
        .service
        .create_entities_and_associations(&entities, &associations, &authorized_by_set)
        .await
        .unwrap();

    assert!(result.report.is_complete());
    assert_eq!(result.entity_key_ids.len(), 2);
    let a_id = result.entity_key_ids[0].unwrap();
    let b_id = result.entity_key_ids[1].unwrap();
    assert_ne!(a_id, b_id);
    assert!(result.association_ids[0].is_some());

    // Both directions of the single edge are visible from the person set
    let graph = h.service.neighbors(h.person_set).await.unwrap();
    assert_eq!(graph.len(), 2);

    let ranked = h
        .service
        .get_top_utilizers(
            h.person_set,
            vec![AggregationSpec {
                association_type_id: h.knows_type,
                neighbor_type_ids: BTreeSet::from([h.person_type]),
                direction: EdgeDirection::Outgoing,
            }],
            10,
            &h.person_auth(),
        )
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await;
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].as_ref().unwrap().row_id, a_id);
}

#[tokio::test]
async fn test_positional_reference_out_of_range_is_a_caller_error() {
    let h = Harness::new();
    let authorized_by_set = HashMap::from([
        (h.person_set, h.person_auth()),
        (h.knows_set, h.edge_auth()),
    ]);

    let entities = vec![EntityDefinition {
        entity_set_id: h.person_set,
        external_id: "a".to_string(),
        properties: props(h.name.id, json!("ada")),
    }];
    let associations = vec![BulkAssociation {
        key: EntityKey::new(h.knows_set, "k1"),
        src: EndpointRef::Index(0),
        dst: EndpointRef::Index(5),
        details: PropertyValues::new(),
    }];

    let result = h
        .service
        .create_entities_and_associations(&entities, &associations, &authorized_by_set)
        .await
        .unwrap();

    assert_eq!(result.report.failures.len(), 1);
    assert!(result.report.failures[0].error.contains("positional reference"));
    assert_eq!(result.association_ids[0], None);
    // The entity itself was still created
    assert!(result.entity_key_ids[0].is_some());
    assert!(h.service.neighbors(h.person_set).await.unwrap().is_empty());
}

// ============================================================================
// Top Utilizers
// ============================================================================

#[tokio::test]
async fn test_top_utilizers_ranks_and_caches() {
    let h = Harness::new();
    let person_auth = h.person_auth();
    let edge_auth = h.edge_auth();

    for person in ["p1", "p2"] {
        h.service
            .create_entity(h.person_set, person, props(h.name.id, json!(person)), &person_auth)
            .await
            .unwrap();
    }
    for org in ["o1", "o2", "o3"] {
        h.service
            .create_entity(h.org_set, org, props(h.name.id, json!(org)), &person_auth)
            .await
            .unwrap();
    }

    // p1 connects to three orgs, p2 to one
    let associations: Vec<Association> = vec![
        h.works_at("e1", "p1", "o1"),
        h.works_at("e2", "p1", "o2"),
        h.works_at("e3", "p1", "o3"),
        h.works_at("e4", "p2", "o1"),
    ];
    let report = h
        .service
        .create_associations(h.works_at_set, &associations, &edge_auth)
        .await
        .unwrap();
    assert!(report.is_complete());

    let specs = vec![AggregationSpec {
        association_type_id: h.works_at_type,
        neighbor_type_ids: BTreeSet::from([h.org_type]),
        direction: EdgeDirection::Outgoing,
    }];

    let first: Vec<Uuid> = h
        .service
        .get_top_utilizers(h.person_set, specs.clone(), 10, &person_auth)
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|row| row.unwrap().row_id)
        .collect();

    let p1 = h.ids.resolve(h.person_set, "p1").await.unwrap();
    let p2 = h.ids.resolve(h.person_set, "p2").await.unwrap();
    assert_eq!(first, vec![p1, p2]);
    assert_eq!(h.aggregations.load(Ordering::SeqCst), 1);

    // Identical query within the TTL: same order, no second aggregation
    let second: Vec<Uuid> = h
        .service
        .get_top_utilizers(h.person_set, specs, 10, &person_auth)
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|row| row.unwrap().row_id)
        .collect();

    assert_eq!(first, second);
    assert_eq!(h.aggregations.load(Ordering::SeqCst), 1);

    // A different k is a different cache entry
    h.service
        .get_top_utilizers(
            h.person_set,
            vec![AggregationSpec {
                association_type_id: h.works_at_type,
                neighbor_type_ids: BTreeSet::from([h.org_type]),
                direction: EdgeDirection::Outgoing,
            }],
            1,
            &person_auth,
        )
        .await
        .unwrap();
    assert_eq!(h.aggregations.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn test_delete_entity_removes_adjacency_and_tombstones_properties() {
    let h = Harness::new();
    let person_auth = h.person_auth();
    let edge_auth = h.edge_auth();

    let p1 = h
        .service
        .create_entity(h.person_set, "p1", props(h.name.id, json!("ada")), &person_auth)
        .await
        .unwrap();
    h.service
        .create_entity(h.org_set, "o1", props(h.name.id, json!("acme")), &person_auth)
        .await
        .unwrap();
    h.service
        .create_associations(h.works_at_set, &[h.works_at("e1", "p1", "o1")], &edge_auth)
        .await
        .unwrap();

    h.service
        .delete_entity(EntityDataKey::new(h.person_set, p1), &person_auth)
        .await
        .unwrap();

    // Adjacency is gone, the person's properties are tombstoned, the
    // neighbor org is untouched
    assert!(h.service.neighbors(h.person_set).await.unwrap().is_empty());
    assert!(h.read_set(h.person_set, &person_auth).await.is_empty());
    assert_eq!(h.read_set(h.org_set, &person_auth).await.len(), 1);

    settle().await;
    let deleted = h.indexer.deleted.lock().unwrap();
    assert!(deleted.iter().any(|key| key.entity_key_id == p1));
}

#[tokio::test]
async fn test_delete_association_keeps_endpoints() {
    let h = Harness::new();
    let person_auth = h.person_auth();
    let edge_auth = h.edge_auth();

    h.service
        .create_entity(h.person_set, "p1", props(h.name.id, json!("ada")), &person_auth)
        .await
        .unwrap();
    h.service
        .create_entity(h.org_set, "o1", props(h.name.id, json!("acme")), &person_auth)
        .await
        .unwrap();
    h.service
        .create_associations(h.works_at_set, &[h.works_at("e1", "p1", "o1")], &edge_auth)
        .await
        .unwrap();

    let edge = h.ids.resolve(h.works_at_set, "e1").await.unwrap();
    let p1 = h.ids.resolve(h.person_set, "p1").await.unwrap();
    let o1 = h.ids.resolve(h.org_set, "o1").await.unwrap();
    let edge_key = EdgeKey::new(
        EntityDataKey::new(h.works_at_set, edge),
        EntityDataKey::new(h.person_set, p1),
        EntityDataKey::new(h.org_set, o1),
    );

    h.service
        .delete_association(edge_key, &edge_auth)
        .await
        .unwrap();

    assert!(h.service.neighbors(h.person_set).await.unwrap().is_empty());
    assert!(h.read_set(h.works_at_set, &edge_auth).await.is_empty());
    // Endpoint vertices keep their properties
    assert_eq!(h.read_set(h.person_set, &person_auth).await.len(), 1);
    assert_eq!(h.read_set(h.org_set, &person_auth).await.len(), 1);
}
