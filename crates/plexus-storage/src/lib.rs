//! Plexus Storage - Key/value substrate abstraction
//!
//! The identity, property, and edge stores all persist into named
//! keyspaces of a cluster-shared key/value substrate. This crate defines
//! that substrate as the [`KeyValueStore`] trait: per-key atomic
//! compare-and-swap and first-writer-wins insert are the only
//! concurrency primitives the upper layers rely on, so any backend with
//! per-key atomicity (an embedded engine, a managed cache, a relational
//! table with row-level CAS) satisfies the contract.
//!
//! Keys are `/`-joined composite strings so that prefix scans express
//! "all rows of an entity set / entity / property". Values are opaque
//! byte records; [`encode`]/[`decode`] wrap the serde_json framing.

use async_trait::async_trait;
use plexus_core::{PlexusError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod memory;

pub use memory::MemoryStore;

/// Cluster-shared key/value store with per-key atomic primitives.
///
/// All operations address one named keyspace. No cross-key or cross-
/// keyspace atomicity is offered; upper layers must not assume any.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read one key
    async fn get(&self, keyspace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditionally write one key
    async fn put(&self, keyspace: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Insert only if the key is absent. Returns `None` when this caller
    /// won the insert, or the already-present value when it lost the race
    /// (first writer wins).
    async fn put_if_absent(
        &self,
        keyspace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>>;

    /// Atomically replace the value only if the current value equals
    /// `expected` (`None` expects absence). Returns whether the swap
    /// applied.
    async fn compare_and_swap(
        &self,
        keyspace: &str,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool>;

    /// Remove one key, reporting whether it existed
    async fn remove(&self, keyspace: &str, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`. The snapshot is
    /// per-key consistent only; concurrent writers may be partially
    /// visible.
    async fn scan_prefix(&self, keyspace: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Encode a record for storage
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PlexusError::Storage(format!("encode failed: {e}")))
}

/// Decode a stored record
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| PlexusError::Storage(format!("decode failed: {e}")))
}

/// Read a typed record
pub async fn get_record<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    keyspace: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(keyspace, key).await? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Write a typed record unconditionally
pub async fn put_record<T: Serialize>(
    store: &dyn KeyValueStore,
    keyspace: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    store.put(keyspace, key, encode(value)?).await
}

/// Atomic read-modify-write over one typed record.
///
/// `apply` receives the current record (if any) and returns the new
/// record to write (`None` leaves the key untouched) plus a caller
/// result. The write is retried with compare-and-swap until it lands on
/// an unchanged base, so concurrent mutators interleave per-key
/// atomically.
pub async fn update_record<T, R, F>(
    store: &dyn KeyValueStore,
    keyspace: &str,
    key: &str,
    mut apply: F,
) -> Result<R>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> (Option<T>, R),
{
    loop {
        let raw = store.get(keyspace, key).await?;
        let current = match &raw {
            Some(bytes) => Some(decode::<T>(bytes)?),
            None => None,
        };

        let (next, result) = apply(current);
        let Some(next) = next else {
            return Ok(result);
        };

        let swapped = store
            .compare_and_swap(keyspace, key, raw.as_deref(), encode(&next)?)
            .await?;
        if swapped {
            return Ok(result);
        }
        // Lost the race; reload and reapply against the winner's value.
    }
}
