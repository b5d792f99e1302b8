//! Plexus Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the Plexus
//! graph store:
//! - Identity types (entity keys, surrogate key ids, edge keys)
//! - Versioning states and write results
//! - Property type descriptors supplied by the external schema registry
//! - Association/bulk-write request types
//! - Common error types
//! - Collaborator traits (schema registry, search-index synchronizer)
//! - Configuration management

pub mod config;

pub use config::{AppConfig, CacheConfig, ConfigError, LoggingConfig, StorageConfig};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for Plexus operations
#[derive(Error, Debug)]
pub enum PlexusError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Association endpoint could not be resolved: {0}")]
    EndpointNotFound(String),

    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlexusError>;

// ============================================================================
// Identity Types
// ============================================================================

/// Caller-facing identity of an entity: the entity set it lives in plus
/// the external id the caller named it with. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity set this key belongs to
    pub entity_set_id: Uuid,

    /// Caller-supplied external identifier
    pub external_id: String,
}

impl EntityKey {
    /// Create a new entity key
    pub fn new(entity_set_id: Uuid, external_id: impl Into<String>) -> Self {
        Self {
            entity_set_id,
            external_id: external_id.into(),
        }
    }
}

/// Storage address of one entity's properties: the entity set plus the
/// surrogate key id assigned by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityDataKey {
    pub entity_set_id: Uuid,
    pub entity_key_id: Uuid,
}

impl EntityDataKey {
    pub fn new(entity_set_id: Uuid, entity_key_id: Uuid) -> Self {
        Self {
            entity_set_id,
            entity_key_id,
        }
    }
}

/// Identity of one association edge. The edge is itself an entity (it has
/// its own key id, set membership and properties) plus two endpoint
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    /// The edge's own storage address
    pub edge: EntityDataKey,

    /// Source endpoint
    pub src: EntityDataKey,

    /// Destination endpoint
    pub dst: EntityDataKey,
}

impl EdgeKey {
    pub fn new(edge: EntityDataKey, src: EntityDataKey, dst: EntityDataKey) -> Self {
        Self { edge, src, dst }
    }
}

// ============================================================================
// Versioning
// ============================================================================

/// Version state of one property value slot.
///
/// The wire/storage form is a signed epoch-millis version where a negative
/// sign marks a tombstone; this type names the two states so callers never
/// interpret the sign themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum VersionState {
    /// Value is visible to reads at this version
    Live(i64),
    /// Value is soft-deleted; the magnitude is the version at which the
    /// tombstone was written
    Tombstoned(i64),
}

impl VersionState {
    /// Magnitude of the version, regardless of liveness
    pub fn magnitude(&self) -> i64 {
        match self {
            Self::Live(v) | Self::Tombstoned(v) => *v,
        }
    }

    /// Signed version as persisted (negative when tombstoned)
    pub fn signed(&self) -> i64 {
        match self {
            Self::Live(v) => *v,
            Self::Tombstoned(v) => -v,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }
}

impl From<i64> for VersionState {
    fn from(v: i64) -> Self {
        if v < 0 {
            Self::Tombstoned(-v)
        } else {
            Self::Live(v)
        }
    }
}

impl From<VersionState> for i64 {
    fn from(state: VersionState) -> Self {
        state.signed()
    }
}

/// Whether a write path enforces caller-visible monotonic versioning or
/// assigns versions silently (reserved for privileged bulk writers).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    #[default]
    Versioned,
    Unversioned,
}

// ============================================================================
// Write Results
// ============================================================================

/// Outcome of one mutating operation: the version assigned to the write
/// and the number of value slots actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEvent {
    /// Version assigned to this write (epoch millis)
    pub version: i64,

    /// Number of value slots actually written (resubmitted duplicates are
    /// not counted)
    pub num_updates: usize,
}

impl WriteEvent {
    pub fn new(version: i64, num_updates: usize) -> Self {
        Self {
            version,
            num_updates,
        }
    }
}

impl Default for WriteEvent {
    fn default() -> Self {
        Self {
            version: 0,
            num_updates: 0,
        }
    }
}

/// One failed item inside a bulk operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Identifies the offending item (external id, entity key id, or edge
    /// key rendering)
    pub item: String,

    /// Error text for the failure
    pub error: String,
}

/// Result of a bulk fan-out write. Sibling items never abort each other;
/// every failed item is recorded here so callers can distinguish full from
/// partial success instead of inferring it from a reduced update count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchWriteReport {
    pub event: WriteEvent,
    pub failures: Vec<BatchFailure>,
}

impl BatchWriteReport {
    pub fn new(event: WriteEvent) -> Self {
        Self {
            event,
            failures: Vec::new(),
        }
    }

    /// True when every item in the batch was applied
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Record a failed item
    pub fn push_failure(&mut self, item: impl Into<String>, error: impl std::fmt::Display) {
        self.failures.push(BatchFailure {
            item: item.into(),
            error: error.to_string(),
        });
    }
}

// ============================================================================
// Property Types
// ============================================================================

/// Datatypes a property type can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyDataType {
    Text,
    Integer,
    Double,
    Boolean,
    DateTime,
    Guid,
}

/// Schema-level descriptor of a property type, resolved by the external
/// schema registry and supplied per call. The store treats this as an
/// opaque lookup table scoped to the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyTypeDescriptor {
    /// Property type id
    pub id: Uuid,

    /// Namespaced full-qualified name (e.g. "person.age")
    pub fqn: String,

    /// Declared datatype
    pub datatype: PropertyDataType,
}

impl PropertyTypeDescriptor {
    pub fn new(id: Uuid, fqn: impl Into<String>, datatype: PropertyDataType) -> Self {
        Self {
            id,
            fqn: fqn.into(),
            datatype,
        }
    }
}

/// Pre-authorized property map supplied by the external authorization
/// oracle: property type id to descriptor, already filtered to what the
/// caller may touch.
pub type AuthorizedProperties = HashMap<Uuid, PropertyTypeDescriptor>;

/// Multi-valued property payload for one entity: property type id to the
/// set of values being written.
pub type PropertyValues = HashMap<Uuid, Vec<serde_json::Value>>;

// ============================================================================
// Read Results
// ============================================================================

/// One logical row produced by a read: the row id (entity key id, or
/// linking id for linked reads) and the live values grouped by property
/// full-qualified name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRow {
    pub row_id: Uuid,
    pub properties: HashMap<String, Vec<serde_json::Value>>,
}

/// Lazy, finite stream of rows from the property store
pub type RowStream = BoxStream<'static, Result<EntityRow>>;

// ============================================================================
// Associations
// ============================================================================

/// One association in a `create_associations` batch: the edge's own
/// caller-facing key, both endpoints, and the edge entity's properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    pub key: EntityKey,
    pub src: EntityKey,
    pub dst: EntityKey,
    pub details: PropertyValues,
}

/// Endpoint reference inside a combined entities+associations batch:
/// either an explicit entity key or a positional index into the entity
/// batch created in the same call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRef {
    Key(EntityKey),
    Index(usize),
}

/// One entity in a combined entities+associations batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub entity_set_id: Uuid,
    pub external_id: String,
    pub properties: PropertyValues,
}

/// One association in a combined entities+associations batch; endpoints
/// may reference just-created entities positionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAssociation {
    pub key: EntityKey,
    pub src: EndpointRef,
    pub dst: EndpointRef,
    pub details: PropertyValues,
}

// ============================================================================
// Graph Types
// ============================================================================

/// Which side of an edge an entity set sits on, viewed from that set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    /// Entities of the set appear as edge sources
    Outgoing,
    /// Entities of the set appear as edge destinations
    Incoming,
}

/// An (association type, neighbor type, direction) triplet reachable from
/// an entity set, used for query building rather than traversal at scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighborTriplet {
    pub association_type_id: Uuid,
    pub neighbor_type_id: Uuid,
    pub direction: EdgeDirection,
}

/// One aggregation over typed adjacency for top-utilizer ranking
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub association_type_id: Uuid,

    /// Neighbor entity types counted by this aggregation (ordered so
    /// cache keys hash deterministically)
    pub neighbor_type_ids: BTreeSet<Uuid>,

    /// Side of the edge the ranked entity sits on
    pub direction: EdgeDirection,
}

// ============================================================================
// Entity Metadata
// ============================================================================

/// Row-level metadata for one entity. `last_index` tracks search-sync
/// freshness and is owned by the index synchronizer collaborator; the
/// store only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub version: i64,
    pub last_write: DateTime<Utc>,
    pub last_index: Option<DateTime<Utc>>,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// External schema/EDM registry, consulted for entity-set to entity-type
/// resolution when typing graph edges. Property type descriptors are NOT
/// fetched through this trait; they arrive pre-authorized per call.
#[async_trait::async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Resolve the entity type of an entity set
    async fn entity_type_of(&self, entity_set_id: Uuid) -> Result<Uuid>;
}

/// External search-index synchronizer. Notifications are best effort and
/// asynchronous; the store never waits for acknowledgment and never rolls
/// back on indexing failure.
#[async_trait::async_trait]
pub trait EntityIndexer: Send + Sync {
    /// An entity's properties changed at the given version
    async fn entity_written(&self, key: EntityDataKey, version: i64) -> Result<()>;

    /// An entity's properties were removed
    async fn entity_deleted(&self, key: EntityDataKey) -> Result<()>;

    /// Synchronizer name for logging
    fn name(&self) -> &str;
}

// ============================================================================
// Tests
// ============================================================================
