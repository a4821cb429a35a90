//! In-memory record and blob stores
//!
//! Used by tests and embedders that need no persistence. Query semantics come
//! from [`evaluate_page`], the same as every other adapter.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{
    apply_updates, evaluate_page, key_of, Blob, BlobMeta, BlobStore, Disposition, FieldUpdate, Item, PutCondition,
    Query, QueryPage, RecordStore, Table, UrlSigner,
};
use crate::error::{PostboxError, PostboxResult};

type TableKey = (String, String);

fn storage_key(table: Table, item: &Item) -> PostboxResult<TableKey> {
    let key = key_of(table, item)?;
    let schema = table.key_schema();
    let partition = super::attr_str(&key, schema.partition).unwrap_or_default().to_string();
    let sort = schema
        .sort
        .and_then(|attr| super::attr_str(&key, attr))
        .unwrap_or_default()
        .to_string();
    Ok((partition, sort))
}

/// Record store backed by ordered maps
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<HashMap<Table, BTreeMap<TableKey, Item>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table
    pub async fn len(&self, table: Table) -> usize {
        self.tables.read().await.get(&table).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, table: Table, key: &Item) -> PostboxResult<Option<Item>> {
        let key = storage_key(table, key)?;
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .and_then(|rows| rows.get(&key))
            .cloned())
    }

    async fn put(&self, table: Table, item: Item, condition: PutCondition) -> PostboxResult<()> {
        let key = storage_key(table, &item)?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        if condition == PutCondition::NotExists && rows.contains_key(&key) {
            return Err(PostboxError::condition_failed(format!(
                "{} already holds ({}, {})",
                table.name(),
                key.0,
                key.1
            )));
        }
        rows.insert(key, item);
        Ok(())
    }

    async fn update(&self, table: Table, key: &Item, updates: &[(String, FieldUpdate<Value>)]) -> PostboxResult<Item> {
        let key = storage_key(table, key)?;
        let mut tables = self.tables.write().await;
        let item = tables
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(&key))
            .ok_or_else(|| PostboxError::not_found(format!("{} ({}, {})", table.name(), key.0, key.1)))?;

        let mut updated = item.clone();
        apply_updates(table, &mut updated, updates)?;
        *item = updated.clone();
        Ok(updated)
    }

    async fn query(&self, query: &Query) -> PostboxResult<QueryPage> {
        let tables = self.tables.read().await;
        let candidates = tables
            .get(&query.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(evaluate_page(query, candidates))
    }

    async fn batch_get(&self, table: Table, keys: &[Item]) -> PostboxResult<Vec<Item>> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = rows.get(&storage_key(table, key)?) {
                found.push(item.clone());
            }
        }
        Ok(found)
    }
}

/// Blob store backed by a map
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Blob>>,
    signer: UrlSigner,
}

impl MemoryBlobStore {
    pub fn new(signer: UrlSigner) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            signer,
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.blobs.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes, meta: BlobMeta) -> PostboxResult<()> {
        self.blobs.write().await.insert(key.to_string(), Blob { data, meta });
        Ok(())
    }

    async fn get(&self, key: &str) -> PostboxResult<Blob> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| PostboxError::not_found(format!("blob {}", key)))
    }

    async fn head(&self, key: &str) -> PostboxResult<BlobMeta> {
        Ok(self.get(key).await?.meta)
    }

    async fn copy(&self, source: &str, destination: &str, meta: Option<BlobMeta>) -> PostboxResult<()> {
        let mut blobs = self.blobs.write().await;
        let blob = blobs
            .get(source)
            .cloned()
            .ok_or_else(|| PostboxError::not_found(format!("blob {}", source)))?;
        let copied = Blob {
            data: blob.data,
            meta: meta.unwrap_or(blob.meta),
        };
        blobs.insert(destination.to_string(), copied);
        Ok(())
    }

    async fn delete(&self, key: &str) -> PostboxResult<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn presign(&self, key: &str, disposition: &Disposition, ttl: Duration) -> PostboxResult<String> {
        self.signer.sign(key, &disposition.header_value(), ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{table_key, Filter, IndexName, SortRange};
    use serde_json::json;

    fn email(recipient: &str, sender: &str, timestamp: &str) -> Item {
        json!({
            "recipient": recipient,
            "sender": sender,
            "recipient_sender": format!("{}#{}", recipient, sender),
            "timestamp": timestamp,
            "archived": false,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_and_condition() {
        let store = MemoryRecordStore::new();
        let item = email("me@x.org", "you@y.org", "2025-01-01T00:00:00.000Z#a");
        store.put(Table::Emails, item.clone(), PutCondition::NotExists).await.unwrap();

        let again = store.put(Table::Emails, item.clone(), PutCondition::NotExists).await;
        assert!(matches!(again, Err(PostboxError::ConditionFailed(_))));

        let key = table_key(Table::Emails, "me@x.org", "2025-01-01T00:00:00.000Z#a");
        assert_eq!(store.get(Table::Emails, &key).await.unwrap(), Some(item));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryRecordStore::new();
        let key = table_key(Table::Emails, "me@x.org", "nope");
        let result = store
            .update(Table::Emails, &key, &[("read".into(), FieldUpdate::Set(json!(true)))])
            .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_index_query() {
        let store = MemoryRecordStore::new();
        store.put(Table::Emails, email("a@x.org", "me@x.org", "2025-01-01#1"), PutCondition::Always).await.unwrap();
        store.put(Table::Emails, email("b@x.org", "me@x.org", "2025-02-01#2"), PutCondition::Always).await.unwrap();
        store.put(Table::Emails, email("me@x.org", "a@x.org", "2025-03-01#3"), PutCondition::Always).await.unwrap();

        let sent = store
            .query(&Query::on_index(IndexName::SenderTimestamp, "me@x.org").with_range(SortRange::AtLeast("2025-01-15".into())))
            .await
            .unwrap();
        assert_eq!(sent.items.len(), 1);
        assert_eq!(sent.items[0]["recipient"], json!("b@x.org"));

        let none = store
            .query(&Query::new(Table::Emails, "me@x.org").with_filter(Filter::eq("archived", true)))
            .await
            .unwrap();
        assert!(none.items.is_empty());
    }

    #[tokio::test]
    async fn test_blob_copy_and_missing() {
        let store = MemoryBlobStore::new(UrlSigner::new("https://b.example/", "k").unwrap());
        store.put("a", Bytes::from_static(b"hi"), BlobMeta::new("text/plain")).await.unwrap();
        store.copy("a", "b", None).await.unwrap();
        assert_eq!(store.get("b").await.unwrap().data, Bytes::from_static(b"hi"));
        assert!(store.get("c").await.unwrap_err().is_not_found());
        assert!(store.copy("c", "d", None).await.is_err());
    }
}
