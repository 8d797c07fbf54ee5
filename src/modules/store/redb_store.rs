//! Embedded persistent pool store on `redb`.
//!
//! Each pool lives in its own table keyed by record id, with the record body
//! stored as JSON. `redb` is synchronous, so every operation runs on the
//! blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use super::{PoolRecord, PoolStore, StoreError};

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Pool store persisted to a `redb` database file.
pub struct RedbStore<T> {
    db: Arc<Database>,
    table: Arc<str>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for RedbStore<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            table: self.table.clone(),
            _record: PhantomData,
        }
    }
}

impl<T: PoolRecord> RedbStore<T> {
    /// Open (or create) the database at `path` and ensure `table` exists.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(backend)?;
        Self::with_database(Arc::new(db), table)
    }

    /// Share an already opened database; several pools can live in one file.
    pub fn with_database(db: Arc<Database>, table: &str) -> Result<Self, StoreError> {
        let store = Self {
            db,
            table: Arc::from(table),
            _record: PhantomData,
        };
        let txn = store.db.begin_write().map_err(backend)?;
        {
            txn.open_table(store.definition()).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(store)
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    fn definition(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    async fn run_blocking<R, F>(&self, op: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&Database, &str) -> Result<R, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || op(&db, &table))
            .await
            .map_err(backend)?
    }
}

fn read_all<T: PoolRecord>(db: &Database, table: &str) -> Result<Vec<T>, StoreError> {
    let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
    let txn = db.begin_read().map_err(backend)?;
    let table = txn.open_table(definition).map_err(backend)?;
    let mut records = Vec::new();
    for entry in table.iter().map_err(backend)? {
        let (_, value) = entry.map_err(backend)?;
        records.push(serde_json::from_slice::<T>(value.value())?);
    }
    Ok(records)
}

fn modify<T, F>(db: &Database, table: &str, mut apply: F) -> Result<usize, StoreError>
where
    T: PoolRecord,
    F: FnMut(&mut T) -> bool,
{
    let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
    let txn = db.begin_write().map_err(backend)?;
    let mut changed = 0;
    {
        let mut table = txn.open_table(definition).map_err(backend)?;
        let mut updates = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            let mut record: T = serde_json::from_slice(value.value())?;
            if apply(&mut record) {
                updates.push(record);
            }
        }
        for record in updates {
            let encoded = serde_json::to_vec(&record)?;
            table
                .insert(record.id(), encoded.as_slice())
                .map_err(backend)?;
            changed += 1;
        }
    }
    txn.commit().map_err(backend)?;
    Ok(changed)
}

#[async_trait]
impl<T: PoolRecord> PoolStore<T> for RedbStore<T> {
    async fn list_active(&self) -> Result<Vec<T>, StoreError> {
        self.run_blocking(|db, table| {
            Ok(read_all::<T>(db, table)?
                .into_iter()
                .filter(|record| record.is_active())
                .collect())
        })
        .await
    }

    async fn mark_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let id = id.to_string();
        self.run_blocking(move |db, table| {
            let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut table = txn.open_table(definition).map_err(backend)?;
                let existing = table
                    .get(id.as_str())
                    .map_err(backend)?
                    .map(|guard| guard.value().to_vec())
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                let mut record: T = serde_json::from_slice(&existing)?;
                record.touch(at);
                let encoded = serde_json::to_vec(&record)?;
                table
                    .insert(id.as_str(), encoded.as_slice())
                    .map_err(backend)?;
            }
            txn.commit().map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn upsert(&self, record: T) -> Result<(), StoreError> {
        self.run_blocking(move |db, table| {
            let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
            let encoded = serde_json::to_vec(&record)?;
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut table = txn.open_table(definition).map_err(backend)?;
                table
                    .insert(record.id(), encoded.as_slice())
                    .map_err(backend)?;
            }
            txn.commit().map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.run_blocking(move |db, table| modify::<T, _>(db, table, |record| record.expire(now)))
            .await
    }
}
