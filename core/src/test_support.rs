//! Fixtures shared by unit tests

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{PostboxError, PostboxResult};
use crate::message::MessageDraft;
use crate::storage::{
    Blob, BlobMeta, BlobStore, Disposition, FieldUpdate, Item, MemoryBlobStore, MemoryRecordStore, PutCondition,
    Query, QueryPage, RecordStore, Table, UrlSigner,
};

pub fn signer() -> UrlSigner {
    UrlSigner::new("https://blobs.postbox.test/", "test-secret").unwrap()
}

pub fn memory_stores() -> (Arc<MemoryRecordStore>, Arc<MemoryBlobStore>) {
    (Arc::new(MemoryRecordStore::new()), Arc::new(MemoryBlobStore::new(signer())))
}

pub fn draft(sender: &str, recipient: &str, subject: &str, message_id: &str) -> MessageDraft {
    MessageDraft {
        recipient: recipient.to_string(),
        sender: sender.to_string(),
        subject: subject.to_string(),
        body: format!("<p>{}</p>", subject),
        message_id: message_id.to_string(),
        ..MessageDraft::default()
    }
}

/// Record store that records every write and can be told to fail
pub struct FlakyRecords {
    inner: MemoryRecordStore,
    pub writes: Mutex<Vec<Table>>,
    pub queried: Mutex<Vec<String>>,
    pub fail_put_on: Option<Table>,
    pub fail_queries: AtomicBool,
}

impl FlakyRecords {
    pub fn new() -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            writes: Mutex::new(Vec::new()),
            queried: Mutex::new(Vec::new()),
            fail_put_on: None,
            fail_queries: AtomicBool::new(false),
        }
    }

    pub fn failing_put_on(table: Table) -> Self {
        Self {
            fail_put_on: Some(table),
            ..Self::new()
        }
    }

    pub fn inner(&self) -> &MemoryRecordStore {
        &self.inner
    }
}

#[async_trait]
impl RecordStore for FlakyRecords {
    async fn get(&self, table: Table, key: &Item) -> PostboxResult<Option<Item>> {
        self.inner.get(table, key).await
    }

    async fn put(&self, table: Table, item: Item, condition: PutCondition) -> PostboxResult<()> {
        if self.fail_put_on == Some(table) {
            return Err(PostboxError::storage(format!("injected failure writing {}", table.name())));
        }
        self.writes.lock().await.push(table);
        self.inner.put(table, item, condition).await
    }

    async fn update(&self, table: Table, key: &Item, updates: &[(String, FieldUpdate<Value>)]) -> PostboxResult<Item> {
        self.inner.update(table, key, updates).await
    }

    async fn query(&self, query: &Query) -> PostboxResult<QueryPage> {
        self.queried.lock().await.push(query.partition_value.clone());
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(PostboxError::storage("injected query failure"));
        }
        self.inner.query(query).await
    }

    async fn batch_get(&self, table: Table, keys: &[Item]) -> PostboxResult<Vec<Item>> {
        self.inner.batch_get(table, keys).await
    }
}

/// Blob store that records every put and can be told to fail
pub struct FlakyBlobs {
    inner: MemoryBlobStore,
    pub puts: Mutex<Vec<String>>,
    pub fail_puts: AtomicBool,
    pub fail_gets: AtomicBool,
}

impl FlakyBlobs {
    pub fn new() -> Self {
        Self {
            inner: MemoryBlobStore::new(signer()),
            puts: Mutex::new(Vec::new()),
            fail_puts: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &MemoryBlobStore {
        &self.inner
    }
}

#[async_trait]
impl BlobStore for FlakyBlobs {
    async fn put(&self, key: &str, data: Bytes, meta: BlobMeta) -> PostboxResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(PostboxError::blob(format!("injected failure writing {}", key)));
        }
        self.puts.lock().await.push(key.to_string());
        self.inner.put(key, data, meta).await
    }

    async fn get(&self, key: &str) -> PostboxResult<Blob> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(PostboxError::blob(format!("injected failure reading {}", key)));
        }
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> PostboxResult<BlobMeta> {
        self.inner.head(key).await
    }

    async fn copy(&self, source: &str, destination: &str, meta: Option<BlobMeta>) -> PostboxResult<()> {
        self.puts.lock().await.push(destination.to_string());
        self.inner.copy(source, destination, meta).await
    }

    async fn delete(&self, key: &str) -> PostboxResult<()> {
        self.inner.delete(key).await
    }

    async fn presign(&self, key: &str, disposition: &Disposition, ttl: Duration) -> PostboxResult<String> {
        self.inner.presign(key, disposition, ttl).await
    }
}
