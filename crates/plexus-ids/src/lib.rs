//! Plexus Ids - Surrogate identity service
//!
//! Maps caller-facing [`EntityKey`]s to stable surrogate key ids and
//! back. The forward mapping is a bijection for the lifetime of the
//! entity set: assignment is idempotent, first-writer-wins under
//! concurrent resolution, and mappings are never deleted (hard deletes
//! remove property values, not identifiers, to avoid id reuse hazards).

use async_trait::async_trait;
use plexus_core::{EntityKey, PlexusError, Result};
use plexus_storage::{encode, get_record, put_record, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Keyspace for the (entity set, external id) -> key id mapping
const ID_FORWARD: &str = "entity_key_ids";

/// Keyspace for the key id -> entity key mapping
const ID_REVERSE: &str = "entity_keys";

/// Trait for surrogate identity operations
#[async_trait]
pub trait IdService: Send + Sync {
    /// Return the key id for the pair, assigning and persisting a fresh
    /// one if the pair has never been seen. Safe under concurrent callers
    /// resolving the same pair: exactly one id is ever assigned.
    async fn resolve(&self, entity_set_id: Uuid, external_id: &str) -> Result<Uuid>;

    /// Bulk form of [`resolve`](IdService::resolve). Each individual
    /// mapping follows the same first-writer-wins rule; the call as a
    /// whole is not atomic across ids.
    async fn resolve_batch(
        &self,
        entity_set_id: Uuid,
        external_ids: &HashSet<String>,
    ) -> Result<HashMap<String, Uuid>>;

    /// Pre-allocate `count` fresh key ids not yet bound to any external
    /// id, for bulk ingest callers that assign external ids out of band.
    async fn reserve(&self, entity_set_id: Uuid, count: usize) -> Result<Vec<Uuid>>;

    /// Entity key for an assigned id. Fails with `NotFound` when the id
    /// was never assigned, or was reserved but never bound.
    async fn reverse_lookup(&self, entity_key_id: Uuid) -> Result<EntityKey>;
}

/// Reverse-keyspace record: which set an id belongs to and, once bound,
/// which external id names it. Reserved ids carry no external id yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdBinding {
    entity_set_id: Uuid,
    external_id: Option<String>,
}

/// [`IdService`] over the key/value substrate
pub struct KvIdService {
    store: Arc<dyn KeyValueStore>,
}

impl KvIdService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn forward_key(entity_set_id: Uuid, external_id: &str) -> String {
        format!("{entity_set_id}/{external_id}")
    }
}

#[async_trait]
impl IdService for KvIdService {
    async fn resolve(&self, entity_set_id: Uuid, external_id: &str) -> Result<Uuid> {
        let forward_key = Self::forward_key(entity_set_id, external_id);

        if let Some(id) =
            get_record::<Uuid>(self.store.as_ref(), ID_FORWARD, &forward_key).await?
        {
            return Ok(id);
        }

        let candidate = Uuid::new_v4();
        match self
            .store
            .put_if_absent(ID_FORWARD, &forward_key, encode(&candidate)?)
            .await?
        {
            None => {
                // Won the assignment; the winner records the reverse binding.
                let binding = IdBinding {
                    entity_set_id,
                    external_id: Some(external_id.to_string()),
                };
                put_record(
                    self.store.as_ref(),
                    ID_REVERSE,
                    &candidate.to_string(),
                    &binding,
                )
                .await?;
                tracing::debug!(
                    entity_set_id = %entity_set_id,
                    entity_key_id = %candidate,
                    "Assigned entity key id"
                );
                Ok(candidate)
            }
            Some(winner) => plexus_storage::decode::<Uuid>(&winner),
        }
    }

    async fn resolve_batch(
        &self,
        entity_set_id: Uuid,
        external_ids: &HashSet<String>,
    ) -> Result<HashMap<String, Uuid>> {
        let mut resolved = HashMap::with_capacity(external_ids.len());
        for external_id in external_ids {
            let id = self.resolve(entity_set_id, external_id).await?;
            resolved.insert(external_id.clone(), id);
        }
        Ok(resolved)
    }

    async fn reserve(&self, entity_set_id: Uuid, count: usize) -> Result<Vec<Uuid>> {
        let mut reserved = Vec::with_capacity(count);
        for _ in 0..count {
            let id = Uuid::new_v4();
            let binding = IdBinding {
                entity_set_id,
                external_id: None,
            };
            put_record(self.store.as_ref(), ID_REVERSE, &id.to_string(), &binding).await?;
            reserved.push(id);
        }
        tracing::debug!(
            entity_set_id = %entity_set_id,
            count = reserved.len(),
            "Reserved entity key ids"
        );
        Ok(reserved)
    }

    async fn reverse_lookup(&self, entity_key_id: Uuid) -> Result<EntityKey> {
        let binding = get_record::<IdBinding>(
            self.store.as_ref(),
            ID_REVERSE,
            &entity_key_id.to_string(),
        )
        .await?
        .ok_or_else(|| PlexusError::NotFound(format!("entity key id {entity_key_id}")))?;

        match binding.external_id {
            Some(external_id) => Ok(EntityKey::new(binding.entity_set_id, external_id)),
            // Reserved but never bound: no EntityKey exists for it yet.
            None => Err(PlexusError::NotFound(format!(
                "entity key id {entity_key_id} is reserved but unbound"
            ))),
        }
    }
}
