//! Plexus Data - Versioned property value store
//!
//! For each (entity set, entity key id, property type) this store holds a
//! *set* of distinct values, each with its own version history and a
//! content hash used for deduplication. Writes merge, replace, or
//! tombstone values; tombstoning negates the version while preserving
//! history, so intent is reversible without data loss. Hard deletes are
//! a separate administrative scrub path.
//!
//! Versions are epoch millis. Each write to a value slot takes
//! `max(now, previous + 1)`, so per-slot magnitudes strictly increase
//! even under clock skew; concurrent writers to the same slot converge
//! on last-write-wins by version number.

use async_trait::async_trait;
use chrono::Utc;
use plexus_core::{
    AuthorizedProperties, EntityDataKey, EntityMetadata, PlexusError, PropertyValues, Result,
    RowStream, UpdateType, VersionState, WriteEvent,
};
use plexus_storage::{get_record, update_record, KeyValueStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

mod read;

pub use read::EntityRowAssembler;

/// Keyspace for property value rows, keyed set/entity/property/hash
const PROPERTY_VALUES: &str = "property_values";

/// Keyspace for row-level entity metadata, keyed set/entity
const ENTITY_METADATA: &str = "entity_metadata";

/// Keyspace for entity-key-id -> linking-id bindings, owned by the
/// external record-linking collaborator
const LINKING_IDS: &str = "linking_ids";

// ============================================================================
// Records
// ============================================================================

/// One distinct property value with its version lineage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyValueRecord {
    /// The stored value
    pub value: serde_json::Value,

    /// Current version state (negative serialized form = tombstoned)
    pub state: VersionState,

    /// Append-only version history; tombstones recorded as negative
    /// entries
    pub history: Vec<i64>,

    /// Wall clock of the last write to this slot
    pub last_write: chrono::DateTime<Utc>,
}

/// Replacement of one exact stored value with another, addressed by the
/// stored value's content hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueReplacement {
    /// The exact value currently stored
    pub existing: serde_json::Value,

    /// The value that takes over its slot (and lineage)
    pub replacement: serde_json::Value,
}

// ============================================================================
// Trait
// ============================================================================

/// Trait for versioned property storage.
///
/// Every operation takes the pre-authorized property map supplied by the
/// external authorization oracle; writes naming a property type outside
/// that map fail with `InvalidArgument` before any row is touched. The
/// store performs no authorization logic of its own.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Insert values that are not already stored; identical live values
    /// are an idempotent no-op, tombstoned identical values are revived.
    /// `num_updates` counts only slots actually written.
    async fn create_or_merge(
        &self,
        entity_set_id: Uuid,
        entities: &HashMap<Uuid, PropertyValues>,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent>;

    /// Full replace per entity: every live value under any authorized
    /// property of a named entity that is not resubmitted is tombstoned;
    /// resubmitted values are created-or-merged.
    async fn replace_entities(
        &self,
        entity_set_id: Uuid,
        entities: &HashMap<Uuid, PropertyValues>,
        authorized: &AuthorizedProperties,
        update_type: UpdateType,
    ) -> Result<WriteEvent>;

    /// Replace scoped per property: only property types present in the
    /// request have the not-resubmitted-means-tombstoned rule applied;
    /// absent properties are neither read nor modified.
    async fn partial_replace(
        &self,
        entity_set_id: Uuid,
        entities: &HashMap<Uuid, PropertyValues>,
        authorized: &AuthorizedProperties,
        update_type: UpdateType,
    ) -> Result<WriteEvent>;

    /// Replace specific values, addressed by content hash; the new value
    /// inherits the old slot's version lineage.
    async fn replace_property_values(
        &self,
        entity_set_id: Uuid,
        replacements: &HashMap<Uuid, HashMap<Uuid, Vec<ValueReplacement>>>,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent>;

    /// Soft delete: tombstone every live value under the authorized
    /// properties, set-wide or restricted to the given entities. History
    /// is preserved.
    async fn clear(
        &self,
        entity_set_id: Uuid,
        entity_key_ids: Option<&[Uuid]>,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent>;

    /// Hard delete: physically remove rows, irreversibly. Administrative
    /// scrub only; normal application deletes use [`clear`](PropertyStore::clear).
    /// Returns the number of rows removed.
    async fn delete(
        &self,
        entity_set_id: Uuid,
        entity_key_ids: Option<&[Uuid]>,
        authorized: &AuthorizedProperties,
    ) -> Result<u64>;

    /// Lazy, finite stream of rows. Tombstoned values are excluded. With
    /// `linking` set, rows from sets sharing a linking id merge into one
    /// logical row per linking id, each set contributing only its own
    /// authorized properties. A set missing from `authorized_by_set` is
    /// `NotFound` (distinct from a present set with zero rows).
    async fn read(
        &self,
        entity_set_ids: &[Uuid],
        entity_key_ids: Option<&HashSet<Uuid>>,
        authorized_by_set: &HashMap<Uuid, AuthorizedProperties>,
        linking: bool,
    ) -> Result<RowStream>;

    /// Row-level metadata for one entity, if any writes have landed
    async fn entity_metadata(&self, key: &EntityDataKey) -> Result<Option<EntityMetadata>>;
}

// ============================================================================
// Content Hashing & Versions
// ============================================================================

/// Content hash of a property value: hex SHA-256 over the canonical JSON
/// encoding. Dedup is by content, not arrival order.
pub fn content_hash(value: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| PlexusError::Storage(format!("value encode failed: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Next version for a slot: the clock, unless the slot has already seen
/// an equal or later version
fn next_version(previous: Option<i64>, now: i64) -> i64 {
    match previous {
        Some(prev) => now.max(prev + 1),
        None => now,
    }
}

// ============================================================================
// Store Implementation
// ============================================================================

/// [`PropertyStore`] over the key/value substrate
pub struct KvPropertyStore {
    store: Arc<dyn KeyValueStore>,
}

impl KvPropertyStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn value_key(entity_set_id: Uuid, entity_key_id: Uuid, property_type_id: Uuid, hash: &str) -> String {
        format!("{entity_set_id}/{entity_key_id}/{property_type_id}/{hash}")
    }

    fn entity_prefix(entity_set_id: Uuid, entity_key_id: Uuid) -> String {
        format!("{entity_set_id}/{entity_key_id}/")
    }

    fn metadata_key(entity_set_id: Uuid, entity_key_id: Uuid) -> String {
        format!("{entity_set_id}/{entity_key_id}")
    }

    /// Bind (or unbind) the linking id of an entity. Owned by the
    /// external record-linking collaborator; the store only reads the
    /// binding during linked reads.
    pub async fn bind_linking_id(
        &self,
        entity_key_id: Uuid,
        linking_id: Option<Uuid>,
    ) -> Result<()> {
        match linking_id {
            Some(id) => {
                plexus_storage::put_record(
                    self.store.as_ref(),
                    LINKING_IDS,
                    &entity_key_id.to_string(),
                    &id,
                )
                .await
            }
            None => {
                self.store
                    .remove(LINKING_IDS, &entity_key_id.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    /// Stamp the index-sync freshness timestamp. Owned by the search
    /// synchronizer collaborator.
    pub async fn mark_indexed(&self, key: &EntityDataKey) -> Result<()> {
        let meta_key = Self::metadata_key(key.entity_set_id, key.entity_key_id);
        update_record::<EntityMetadata, (), _>(
            self.store.as_ref(),
            ENTITY_METADATA,
            &meta_key,
            |current| match current {
                Some(mut meta) => {
                    meta.last_index = Some(Utc::now());
                    (Some(meta), ())
                }
                // No writes recorded; nothing to stamp.
                None => (None, ()),
            },
        )
        .await
    }

    async fn linking_id(&self, entity_key_id: Uuid) -> Result<Option<Uuid>> {
        get_record::<Uuid>(self.store.as_ref(), LINKING_IDS, &entity_key_id.to_string()).await
    }

    /// Raise the entity's row-level version to at least `version` and
    /// stamp the write time
    async fn touch_entity(&self, entity_set_id: Uuid, entity_key_id: Uuid, version: i64) -> Result<()> {
        let key = Self::metadata_key(entity_set_id, entity_key_id);
        update_record::<EntityMetadata, (), _>(
            self.store.as_ref(),
            ENTITY_METADATA,
            &key,
            |current| {
                let mut meta = current.unwrap_or(EntityMetadata {
                    version: 0,
                    last_write: Utc::now(),
                    last_index: None,
                });
                meta.version = meta.version.max(version);
                meta.last_write = Utc::now();
                (Some(meta), ())
            },
        )
        .await
    }

    /// Create-or-merge one value slot. Returns whether the slot was
    /// actually written.
    async fn write_value(
        &self,
        key: &str,
        value: &serde_json::Value,
        update_type: UpdateType,
        now: i64,
    ) -> Result<bool> {
        let value = value.clone();
        update_record::<PropertyValueRecord, bool, _>(
            self.store.as_ref(),
            PROPERTY_VALUES,
            key,
            move |current| match current {
                // Identical live value: idempotent merge, no version bump
                Some(row) if row.state.is_live() => (None, false),

                // Tombstoned identical value: revive at a strictly larger
                // version
                Some(mut row) => {
                    let version = next_version(Some(row.state.magnitude()), now);
                    row.state = VersionState::Live(version);
                    if update_type == UpdateType::Versioned {
                        row.history.push(version);
                    }
                    row.last_write = Utc::now();
                    (Some(row), true)
                }

                // First write of this content
                None => {
                    let history = match update_type {
                        UpdateType::Versioned => vec![now],
                        UpdateType::Unversioned => Vec::new(),
                    };
                    let row = PropertyValueRecord {
                        value: value.clone(),
                        state: VersionState::Live(now),
                        history,
                        last_write: Utc::now(),
                    };
                    (Some(row), true)
                }
            },
        )
        .await
    }

    /// Tombstone one slot if it is live. Returns whether a tombstone was
    /// written.
    async fn tombstone_value(&self, key: &str, now: i64) -> Result<bool> {
        update_record::<PropertyValueRecord, bool, _>(
            self.store.as_ref(),
            PROPERTY_VALUES,
            key,
            move |current| match current {
                Some(mut row) if row.state.is_live() => {
                    let version = next_version(Some(row.state.magnitude()), now);
                    row.state = VersionState::Tombstoned(version);
                    row.history.push(-version);
                    row.last_write = Utc::now();
                    (Some(row), true)
                }
                _ => (None, false),
            },
        )
        .await
    }

    /// Shared body of the two replace flavors. `scope_to_request`
    /// restricts the tombstone sweep to property types present in the
    /// request (partial replace) instead of every authorized property
    /// (full replace).
    async fn replace_inner(
        &self,
        entity_set_id: Uuid,
        entities: &HashMap<Uuid, PropertyValues>,
        authorized: &AuthorizedProperties,
        update_type: UpdateType,
        scope_to_request: bool,
    ) -> Result<WriteEvent> {
        require_entities(entities)?;
        for properties in entities.values() {
            check_authorized(properties.keys(), authorized)?;
        }
        let now = now_millis();
        let mut updates = 0usize;

        for (&entity_key_id, properties) in entities {
            // Hashes being resubmitted, per property type
            let mut resubmitted: HashMap<Uuid, HashSet<String>> = HashMap::new();
            for (&property_type_id, values) in properties {
                let hashes = resubmitted.entry(property_type_id).or_default();
                for value in values {
                    hashes.insert(content_hash(value)?);
                }
            }

            // Sweep current rows; tombstone anything in scope that was
            // not resubmitted
            let prefix = Self::entity_prefix(entity_set_id, entity_key_id);
            for (key, _) in self.store.scan_prefix(PROPERTY_VALUES, &prefix).await? {
                let Some(parts) = parse_value_key(&key) else {
                    continue;
                };
                let in_scope = if scope_to_request {
                    properties.contains_key(&parts.property_type_id)
                } else {
                    authorized.contains_key(&parts.property_type_id)
                };
                if !in_scope {
                    continue;
                }
                let keep = resubmitted
                    .get(&parts.property_type_id)
                    .map(|hashes| hashes.contains(parts.hash))
                    .unwrap_or(false);
                if !keep && self.tombstone_value(&key, now).await? {
                    updates += 1;
                }
            }

            // Write the new value set
            for (&property_type_id, values) in properties {
                for value in values {
                    let hash = content_hash(value)?;
                    let key = Self::value_key(entity_set_id, entity_key_id, property_type_id, &hash);
                    if self.write_value(&key, value, update_type, now).await? {
                        updates += 1;
                    }
                }
            }

            self.touch_entity(entity_set_id, entity_key_id, now).await?;
        }

        Ok(WriteEvent::new(now, updates))
    }
}

/// Parsed components of a property value key
struct ValueKeyParts<'a> {
    entity_key_id: Uuid,
    property_type_id: Uuid,
    hash: &'a str,
}

fn parse_value_key(key: &str) -> Option<ValueKeyParts<'_>> {
    let mut parts = key.splitn(4, '/');
    let _entity_set_id = parts.next()?;
    let entity_key_id = parts.next()?.parse().ok()?;
    let property_type_id = parts.next()?.parse().ok()?;
    let hash = parts.next()?;
    Some(ValueKeyParts {
        entity_key_id,
        property_type_id,
        hash,
    })
}

fn require_entities(entities: &HashMap<Uuid, PropertyValues>) -> Result<()> {
    if entities.is_empty() {
        return Err(PlexusError::InvalidArgument(
            "no entities in request".to_string(),
        ));
    }
    Ok(())
}

fn check_authorized<'a>(
    requested: impl Iterator<Item = &'a Uuid>,
    authorized: &AuthorizedProperties,
) -> Result<()> {
    for property_type_id in requested {
        if !authorized.contains_key(property_type_id) {
            return Err(PlexusError::InvalidArgument(format!(
                "property type {property_type_id} is not in the authorized set"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl PropertyStore for KvPropertyStore {
    async fn create_or_merge(
        &self,
        entity_set_id: Uuid,
        entities: &HashMap<Uuid, PropertyValues>,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent> {
        require_entities(entities)?;
        for properties in entities.values() {
            check_authorized(properties.keys(), authorized)?;
        }
        let now = now_millis();
        let mut updates = 0usize;

        for (&entity_key_id, properties) in entities {
            for (&property_type_id, values) in properties {
                for value in values {
                    let hash = content_hash(value)?;
                    let key = Self::value_key(entity_set_id, entity_key_id, property_type_id, &hash);
                    if self
                        .write_value(&key, value, UpdateType::Versioned, now)
                        .await?
                    {
                        updates += 1;
                    }
                }
            }

            self.touch_entity(entity_set_id, entity_key_id, now).await?;
        }

        tracing::debug!(
            entity_set_id = %entity_set_id,
            entities = entities.len(),
            updates,
            "create_or_merge"
        );
        Ok(WriteEvent::new(now, updates))
    }

    async fn replace_entities(
        &self,
        entity_set_id: Uuid,
        entities: &HashMap<Uuid, PropertyValues>,
        authorized: &AuthorizedProperties,
        update_type: UpdateType,
    ) -> Result<WriteEvent> {
        self.replace_inner(entity_set_id, entities, authorized, update_type, false)
            .await
    }

    async fn partial_replace(
        &self,
        entity_set_id: Uuid,
        entities: &HashMap<Uuid, PropertyValues>,
        authorized: &AuthorizedProperties,
        update_type: UpdateType,
    ) -> Result<WriteEvent> {
        self.replace_inner(entity_set_id, entities, authorized, update_type, true)
            .await
    }

    async fn replace_property_values(
        &self,
        entity_set_id: Uuid,
        replacements: &HashMap<Uuid, HashMap<Uuid, Vec<ValueReplacement>>>,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent> {
        if replacements.is_empty() {
            return Err(PlexusError::InvalidArgument(
                "no replacements in request".to_string(),
            ));
        }
        for by_property in replacements.values() {
            check_authorized(by_property.keys(), authorized)?;
        }
        let now = now_millis();
        let mut updates = 0usize;

        for (&entity_key_id, by_property) in replacements {
            for (&property_type_id, swaps) in by_property {
                for swap in swaps {
                    let old_hash = content_hash(&swap.existing)?;
                    let old_key =
                        Self::value_key(entity_set_id, entity_key_id, property_type_id, &old_hash);

                    let Some(old_row) = get_record::<PropertyValueRecord>(
                        self.store.as_ref(),
                        PROPERTY_VALUES,
                        &old_key,
                    )
                    .await?
                    else {
                        tracing::debug!(
                            entity_key_id = %entity_key_id,
                            property_type_id = %property_type_id,
                            "replace target value not stored, skipping"
                        );
                        continue;
                    };

                    // The slot relocates: the new content inherits the old
                    // lineage plus the new version, and the old hash row
                    // goes away.
                    let version = next_version(Some(old_row.state.magnitude()), now);
                    let mut history = old_row.history.clone();
                    history.push(version);
                    let new_row = PropertyValueRecord {
                        value: swap.replacement.clone(),
                        state: VersionState::Live(version),
                        history,
                        last_write: Utc::now(),
                    };

                    let new_hash = content_hash(&swap.replacement)?;
                    let new_key =
                        Self::value_key(entity_set_id, entity_key_id, property_type_id, &new_hash);
                    plexus_storage::put_record(
                        self.store.as_ref(),
                        PROPERTY_VALUES,
                        &new_key,
                        &new_row,
                    )
                    .await?;
                    self.store.remove(PROPERTY_VALUES, &old_key).await?;
                    updates += 1;
                }
            }

            self.touch_entity(entity_set_id, entity_key_id, now).await?;
        }

        Ok(WriteEvent::new(now, updates))
    }

    async fn clear(
        &self,
        entity_set_id: Uuid,
        entity_key_ids: Option<&[Uuid]>,
        authorized: &AuthorizedProperties,
    ) -> Result<WriteEvent> {
        let now = now_millis();
        let mut updates = 0usize;
        let mut touched: HashSet<Uuid> = HashSet::new();

        let prefixes: Vec<String> = match entity_key_ids {
            Some(ids) => ids
                .iter()
                .map(|id| Self::entity_prefix(entity_set_id, *id))
                .collect(),
            None => vec![format!("{entity_set_id}/")],
        };

        for prefix in prefixes {
            for (key, _) in self.store.scan_prefix(PROPERTY_VALUES, &prefix).await? {
                let Some(parts) = parse_value_key(&key) else {
                    continue;
                };
                if !authorized.contains_key(&parts.property_type_id) {
                    continue;
                }
                if self.tombstone_value(&key, now).await? {
                    updates += 1;
                    touched.insert(parts.entity_key_id);
                }
            }
        }

        for entity_key_id in touched {
            self.touch_entity(entity_set_id, entity_key_id, now).await?;
        }

        tracing::info!(
            entity_set_id = %entity_set_id,
            updates,
            "Cleared property values"
        );
        Ok(WriteEvent::new(now, updates))
    }

    async fn delete(
        &self,
        entity_set_id: Uuid,
        entity_key_ids: Option<&[Uuid]>,
        authorized: &AuthorizedProperties,
    ) -> Result<u64> {
        let mut removed = 0u64;

        let prefixes: Vec<String> = match entity_key_ids {
            Some(ids) => ids
                .iter()
                .map(|id| Self::entity_prefix(entity_set_id, *id))
                .collect(),
            None => vec![format!("{entity_set_id}/")],
        };

        for prefix in prefixes {
            for (key, _) in self.store.scan_prefix(PROPERTY_VALUES, &prefix).await? {
                let Some(parts) = parse_value_key(&key) else {
                    continue;
                };
                if !authorized.contains_key(&parts.property_type_id) {
                    continue;
                }
                if self.store.remove(PROPERTY_VALUES, &key).await? {
                    removed += 1;
                }
            }
        }

        tracing::warn!(
            entity_set_id = %entity_set_id,
            removed,
            "Hard-deleted property rows"
        );
        Ok(removed)
    }

    async fn read(
        &self,
        entity_set_ids: &[Uuid],
        entity_key_ids: Option<&HashSet<Uuid>>,
        authorized_by_set: &HashMap<Uuid, AuthorizedProperties>,
        linking: bool,
    ) -> Result<RowStream> {
        if entity_set_ids.is_empty() {
            return Err(PlexusError::InvalidArgument(
                "no entity sets in request".to_string(),
            ));
        }

        let mut assembler = EntityRowAssembler::new();
        let mut linking_ids: HashMap<Uuid, Option<Uuid>> = HashMap::new();

        for &entity_set_id in entity_set_ids {
            let authorized = authorized_by_set.get(&entity_set_id).ok_or_else(|| {
                PlexusError::NotFound(format!("entity set {entity_set_id}"))
            })?;

            let prefix = format!("{entity_set_id}/");
            for (key, bytes) in self.store.scan_prefix(PROPERTY_VALUES, &prefix).await? {
                let Some(parts) = parse_value_key(&key) else {
                    continue;
                };
                if let Some(filter) = entity_key_ids {
                    if !filter.contains(&parts.entity_key_id) {
                        continue;
                    }
                }
                // Reads filter to the authorized properties; unauthorized
                // rows are simply invisible, not an error.
                let Some(descriptor) = authorized.get(&parts.property_type_id) else {
                    continue;
                };

                let record: PropertyValueRecord = plexus_storage::decode(&bytes)?;
                if !record.state.is_live() {
                    continue;
                }

                let row_id = if linking {
                    let entity_key_id = parts.entity_key_id;
                    if !linking_ids.contains_key(&entity_key_id) {
                        let bound = self.linking_id(entity_key_id).await?;
                        linking_ids.insert(entity_key_id, bound);
                    }
                    // Entities with no linking binding stand as their own
                    // logical row.
                    linking_ids[&entity_key_id].unwrap_or(entity_key_id)
                } else {
                    parts.entity_key_id
                };

                assembler.push(row_id, &descriptor.fqn, parts.hash, record.value);
            }
        }

        Ok(assembler.into_stream())
    }

    async fn entity_metadata(&self, key: &EntityDataKey) -> Result<Option<EntityMetadata>> {
        get_record(
            self.store.as_ref(),
            ENTITY_METADATA,
            &Self::metadata_key(key.entity_set_id, key.entity_key_id),
        )
        .await
    }
}
