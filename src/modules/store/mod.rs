//! Candidate pool persistence.
//!
//! Proxies and cookie sessions are pulled from a store exposing
//! `list_active` and `mark_used`. An in-memory store and an embedded `redb`
//! store are provided; both hold records as the same serde types.

mod redb_store;

pub use redb_store::RedbStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Number of tries applied to store operations before surfacing an error.
pub const DEFAULT_STORE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("record '{0}' not found")]
    NotFound(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<StoreError> },
}

/// A record held in a rotating pool.
pub trait PoolRecord: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn id(&self) -> &str;

    /// Persistent active flag.
    fn is_active(&self) -> bool;

    /// Whether the record may be handed out at `now`.
    fn is_eligible(&self, _now: DateTime<Utc>) -> bool {
        self.is_active()
    }

    /// Record a use at `at`.
    fn touch(&mut self, at: DateTime<Utc>);

    /// Mark the record inactive if it has expired at `now`. Returns true when
    /// the record changed.
    fn expire(&mut self, _now: DateTime<Utc>) -> bool {
        false
    }
}

#[async_trait]
pub trait PoolStore<T: PoolRecord>: Send + Sync {
    /// Records currently flagged active. Callers still re-check eligibility.
    async fn list_active(&self) -> Result<Vec<T>, StoreError>;

    async fn mark_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn upsert(&self, record: T) -> Result<(), StoreError>;

    /// Flip expired records to inactive, returning how many changed.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Run `op` up to `attempts` times, returning the first success.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut tried = 0;
    loop {
        tried += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if tried >= attempts => {
                log::error!("store operation failed after {tried} attempts: {err}");
                return Err(StoreError::Exhausted {
                    attempts: tried,
                    last: Box::new(err),
                });
            }
            Err(err) => {
                log::debug!("store operation attempt {tried} failed: {err}");
            }
        }
    }
}

/// In-process store keyed by record id, preserving insertion order.
#[derive(Debug, Clone)]
pub struct MemoryStore<T> {
    inner: Arc<RwLock<MemoryState<T>>>,
}

#[derive(Debug)]
struct MemoryState<T> {
    order: Vec<String>,
    records: HashMap<String, T>,
}

impl<T: PoolRecord> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryState {
                order: Vec::new(),
                records: HashMap::new(),
            })),
        }
    }

    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let store = Self::new();
        if let Ok(mut guard) = store.inner.write() {
            for record in records {
                guard.insert(record);
            }
        }
        store
    }

    /// Snapshot of a single record, active or not.
    pub fn get(&self, id: &str) -> Option<T> {
        self.inner
            .read()
            .ok()
            .and_then(|guard| guard.records.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|guard| guard.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: PoolRecord> MemoryState<T> {
    fn insert(&mut self, record: T) {
        let id = record.id().to_string();
        if !self.records.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.records.insert(id, record);
    }
}

impl<T: PoolRecord> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: PoolRecord> PoolStore<T> for MemoryStore<T> {
    async fn list_active(&self) -> Result<Vec<T>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard
            .order
            .iter()
            .filter_map(|id| guard.records.get(id))
            .filter(|record| record.is_active())
            .cloned()
            .collect())
    }

    async fn mark_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let record = guard
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.touch(at);
        Ok(())
    }

    async fn upsert(&self, record: T) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        guard.insert(record);
        Ok(())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        Ok(guard
            .records
            .values_mut()
            .map(|record| record.expire(now))
            .filter(|changed| *changed)
            .count())
    }
}
