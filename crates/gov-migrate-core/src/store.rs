//! Ordered byte-key store seam plus the write batch the driver fills.
//!
//! Backends only need point reads, snapshot prefix scans, and an atomic
//! batch commit. The driver never writes while a scan is open: it collects
//! every pair first and mutates only through the batch.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

pub type KvPair = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

pub trait KvStore {
    /// Reads one value.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend read fails.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns every pair under `prefix` in ascending key order, as the store
    /// stood when the call was made.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend scan fails.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError>;

    /// Applies every operation in `batch` or none of them.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the commit fails; the store is
    /// then unchanged.
    fn commit(&mut self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Pending writes keyed by full store key. `None` marks a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.insert(key, None);
    }

    /// `Some(None)` means the key is deleted by this batch.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops.get(key).map(Option::as_deref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.ops
            .iter()
            .map(|(key, value)| (key.as_slice(), value.as_deref()))
    }

    pub fn into_ops(self) -> impl Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> {
        self.ops.into_iter()
    }
}

/// In-memory backend. Commits are trivially atomic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = KvPair>) -> Self {
        Self {
            entries: pairs.into_iter().collect(),
        }
    }

    /// Writes one value directly, bypassing batching. Used for seeding.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.keys().map(Vec::as_slice)
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        Ok(self
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        for (key, value) in batch.into_ops() {
            match value {
                Some(value) => {
                    self.entries.insert(key, value);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// A key prefix scoping one logical store inside the physical keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    prefix: Vec<u8>,
}

impl Namespace {
    #[must_use]
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    #[must_use]
    pub fn key(&self, inner: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + inner.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(inner);
        key
    }

    #[must_use]
    pub fn strip<'k>(&self, key: &'k [u8]) -> Option<&'k [u8]> {
        key.strip_prefix(self.prefix.as_slice())
    }

    /// Pairs under `inner_prefix`, returned with namespace-relative keys.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend scan fails.
    pub fn scan<S: KvStore + ?Sized>(
        &self,
        store: &S,
        inner_prefix: &[u8],
    ) -> Result<Vec<KvPair>, StoreError> {
        let full = self.key(inner_prefix);
        let prefix_len = self.prefix.len();
        Ok(store
            .scan_prefix(&full)?
            .into_iter()
            .map(|(mut key, value)| (key.split_off(prefix_len), value))
            .collect())
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when the prefix is all `0xff` bytes (the range is then unbounded).
#[must_use]
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

/// Hex SHA-256 over every pair under the given prefixes, in order, each
/// field length-prefixed. Identical states yield identical digests.
///
/// # Errors
/// Returns [`StoreError`] when a backend scan fails.
pub fn state_digest<S: KvStore + ?Sized>(
    store: &S,
    prefixes: &[&[u8]],
) -> Result<String, StoreError> {
    let mut hasher = Sha256::new();
    for prefix in prefixes {
        for (key, value) in store.scan_prefix(prefix)? {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(&key);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(&value);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copies every pair under the given prefixes into a detached in-memory store.
///
/// # Errors
/// Returns [`StoreError`] when a backend scan fails.
pub fn snapshot_prefixes<S: KvStore + ?Sized>(
    store: &S,
    prefixes: &[&[u8]],
) -> Result<MemStore, StoreError> {
    let mut snapshot = MemStore::new();
    for prefix in prefixes {
        for (key, value) in store.scan_prefix(prefix)? {
            snapshot.insert(key, value);
        }
    }
    Ok(snapshot)
}
