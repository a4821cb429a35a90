//! Storage layer for Postbox
//!
//! Two seams: a partitioned record store with secondary indexes
//! ([`RecordStore`]) and a blob store with presigned URLs ([`BlobStore`]).
//! Records travel as JSON objects ([`Item`]) so adapters stay generic;
//! [`to_item`] and [`from_item`] convert to and from the typed model.

pub mod blob;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod presign;

pub use blob::FsBlobStore;
pub use database::SqliteRecordStore;
pub use memory::{MemoryBlobStore, MemoryRecordStore};
pub use migrations::MigrationManager;
pub use presign::{PresignedTarget, UrlSigner};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PostboxError, PostboxResult};

/// A stored record
pub type Item = serde_json::Map<String, Value>;

/// Record tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Message metadata, keyed by `(recipient, timestamp)`
    Emails,
    /// Thread index, keyed by `(thread_id, timestamp)`
    ThreadRelations,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Emails => "emails",
            Table::ThreadRelations => "thread_relations",
        }
    }

    pub fn key_schema(self) -> KeySchema {
        match self {
            Table::Emails => KeySchema::new("recipient", Some("timestamp")),
            Table::ThreadRelations => KeySchema::new("thread_id", Some("timestamp")),
        }
    }

    pub fn indexes(self) -> &'static [IndexName] {
        match self {
            Table::Emails => &[IndexName::SenderTimestamp, IndexName::RecipientSender],
            Table::ThreadRelations => &[IndexName::MessageId],
        }
    }
}

/// Secondary indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexName {
    /// `emails` by `(sender, timestamp)`
    SenderTimestamp,
    /// `emails` by `(recipient_sender, timestamp)`
    RecipientSender,
    /// `thread_relations` by `message_id`
    MessageId,
}

impl IndexName {
    pub fn name(self) -> &'static str {
        match self {
            IndexName::SenderTimestamp => "SenderTimestampIndex",
            IndexName::RecipientSender => "RecipientSenderIndex",
            IndexName::MessageId => "MessageIdIndex",
        }
    }

    pub fn table(self) -> Table {
        match self {
            IndexName::SenderTimestamp | IndexName::RecipientSender => Table::Emails,
            IndexName::MessageId => Table::ThreadRelations,
        }
    }

    pub fn key_schema(self) -> KeySchema {
        match self {
            IndexName::SenderTimestamp => KeySchema::new("sender", Some("timestamp")),
            IndexName::RecipientSender => KeySchema::new("recipient_sender", Some("timestamp")),
            IndexName::MessageId => KeySchema::new("message_id", None),
        }
    }
}

/// Partition and optional sort attribute of a table or index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySchema {
    pub partition: &'static str,
    pub sort: Option<&'static str>,
}

impl KeySchema {
    pub const fn new(partition: &'static str, sort: Option<&'static str>) -> Self {
        Self { partition, sort }
    }

    fn attributes(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.partition).chain(self.sort)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Condition on the sort attribute, compared lexically
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SortRange {
    #[default]
    Any,
    Between(String, String),
    AtLeast(String),
    AtMost(String),
}

impl SortRange {
    /// Build from optional inclusive bounds
    pub fn from_bounds(start: Option<String>, end: Option<String>) -> Self {
        match (start, end) {
            (Some(start), Some(end)) => SortRange::Between(start, end),
            (Some(start), None) => SortRange::AtLeast(start),
            (None, Some(end)) => SortRange::AtMost(end),
            (None, None) => SortRange::Any,
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        match self {
            SortRange::Any => true,
            SortRange::Between(start, end) => value >= start.as_str() && value <= end.as_str(),
            SortRange::AtLeast(start) => value >= start.as_str(),
            SortRange::AtMost(end) => value <= end.as_str(),
        }
    }
}

/// Equality filter applied after the key condition
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub attribute: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    fn matches(&self, item: &Item) -> bool {
        item.get(&self.attribute) == Some(&self.value)
    }
}

/// A key-condition query against a table or one of its indexes
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub index: Option<IndexName>,
    pub partition_value: String,
    pub range: SortRange,
    pub filters: Vec<Filter>,
    /// Maximum number of items evaluated (before filters), like a managed
    /// NoSQL store's page limit
    pub limit: Option<usize>,
    pub start_key: Option<Item>,
    pub sort: SortOrder,
}

impl Query {
    pub fn new(table: Table, partition_value: impl Into<String>) -> Self {
        Self {
            table,
            index: None,
            partition_value: partition_value.into(),
            range: SortRange::Any,
            filters: Vec::new(),
            limit: None,
            start_key: None,
            sort: SortOrder::Desc,
        }
    }

    pub fn on_index(index: IndexName, partition_value: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            ..Self::new(index.table(), partition_value)
        }
    }

    pub fn with_range(mut self, range: SortRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_start_key(mut self, start_key: Option<Item>) -> Self {
        self.start_key = start_key;
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Key schema the key condition applies to
    pub fn key_schema(&self) -> KeySchema {
        self.index
            .map(IndexName::key_schema)
            .unwrap_or_else(|| self.table.key_schema())
    }
}

/// One page of query results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub items: Vec<Item>,
    /// Key of the last evaluated item when more items remain
    pub last_evaluated_key: Option<Item>,
}

/// Change to a single attribute
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Remove,
}

impl<T> FieldUpdate<T> {
    /// `Some(v)` sets, `None` keeps
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => FieldUpdate::Set(value),
            None => FieldUpdate::Keep,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }
}

/// Attribute updates for [`RecordStore::update`]
pub type Updates = Vec<(String, FieldUpdate<Value>)>;

/// Write condition for [`RecordStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    Always,
    /// Fail with `ConditionFailed` if the key is already present
    NotExists,
}

/// Partitioned key-value store with secondary indexes
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one record by its full key
    async fn get(&self, table: Table, key: &Item) -> PostboxResult<Option<Item>>;

    /// Write one record
    async fn put(&self, table: Table, item: Item, condition: PutCondition) -> PostboxResult<()>;

    /// Update an existing record and return its new state.
    /// A missing key is `NotFound`.
    async fn update(&self, table: Table, key: &Item, updates: &[(String, FieldUpdate<Value>)]) -> PostboxResult<Item>;

    /// Run a key-condition query
    async fn query(&self, query: &Query) -> PostboxResult<QueryPage>;

    /// Fetch many records; missing keys are skipped
    async fn batch_get(&self, table: Table, keys: &[Item]) -> PostboxResult<Vec<Item>>;
}

/// Content type and user metadata of a blob
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlobMeta {
    pub content_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BlobMeta {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn json() -> Self {
        Self::new(mime::APPLICATION_JSON.as_ref())
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(name.to_string(), value.into());
        self
    }
}

/// A fetched blob
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub data: Bytes,
    pub meta: BlobMeta,
}

/// What a presigned URL lets its holder do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Read, rendered in place
    Inline,
    /// Read, downloaded under the given filename
    Attachment(String),
    /// Write (upload) with the given content type
    Upload(String),
}

impl Disposition {
    /// Header-style value embedded in the URL
    pub fn header_value(&self) -> String {
        match self {
            Disposition::Inline => "inline".to_string(),
            Disposition::Attachment(filename) => format!("attachment; filename=\"{}\"", filename),
            Disposition::Upload(content_type) => format!("upload; content-type=\"{}\"", content_type),
        }
    }
}

/// Object store for bodies and attachments
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, meta: BlobMeta) -> PostboxResult<()>;

    /// Fetch a blob; a missing key is `NotFound`
    async fn get(&self, key: &str) -> PostboxResult<Blob>;

    /// Metadata only; a missing key is `NotFound`
    async fn head(&self, key: &str) -> PostboxResult<BlobMeta>;

    /// Server-side copy, optionally replacing the metadata
    async fn copy(&self, source: &str, destination: &str, meta: Option<BlobMeta>) -> PostboxResult<()>;

    async fn delete(&self, key: &str) -> PostboxResult<()>;

    /// Time-bounded URL granting `disposition` on `key`
    async fn presign(&self, key: &str, disposition: &Disposition, ttl: Duration) -> PostboxResult<String>;
}

/// Record and blob stores used together by the engine
#[derive(Clone)]
pub struct StorageManager {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
}

impl StorageManager {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { records, blobs }
    }

    /// In-memory stores, signing URLs with `signer`
    pub fn in_memory(signer: UrlSigner) -> Self {
        Self::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryBlobStore::new(signer)),
        )
    }

    pub fn records(&self) -> Arc<dyn RecordStore> {
        self.records.clone()
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }
}

/// Serialize a model value into a record, dropping null attributes
pub fn to_item<T: Serialize>(value: &T) -> PostboxResult<Item> {
    match serde_json::to_value(value)? {
        Value::Object(mut map) => {
            map.retain(|_, v| !v.is_null());
            Ok(map)
        }
        other => Err(PostboxError::storage(format!("Record must be an object, got {}", other))),
    }
}

/// Deserialize a record into a model value
pub fn from_item<T: DeserializeOwned>(item: Item) -> PostboxResult<T> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

/// Build a full table key
pub fn table_key(table: Table, partition: &str, sort: &str) -> Item {
    let schema = table.key_schema();
    let mut key = Item::new();
    key.insert(schema.partition.to_string(), Value::String(partition.to_string()));
    if let Some(sort_attr) = schema.sort {
        key.insert(sort_attr.to_string(), Value::String(sort.to_string()));
    }
    key
}

/// String value of an attribute
pub fn attr_str<'a>(item: &'a Item, attribute: &str) -> Option<&'a str> {
    item.get(attribute).and_then(Value::as_str)
}

/// Extract the table key attributes of a record
pub fn key_of(table: Table, item: &Item) -> PostboxResult<Item> {
    let mut key = Item::new();
    for attribute in table.key_schema().attributes() {
        let value = attr_str(item, attribute).ok_or_else(|| {
            PostboxError::validation(format!(
                "Record for {} is missing key attribute {}",
                table.name(),
                attribute
            ))
        })?;
        key.insert(attribute.to_string(), Value::String(value.to_string()));
    }
    Ok(key)
}

/// Apply attribute updates to a record; key attributes cannot change
pub fn apply_updates(table: Table, item: &mut Item, updates: &[(String, FieldUpdate<Value>)]) -> PostboxResult<()> {
    let schema = table.key_schema();
    let effective: Vec<_> = updates.iter().filter(|(_, update)| !update.is_keep()).collect();
    if effective.is_empty() {
        return Err(PostboxError::validation("No updates provided"));
    }

    for (attribute, update) in effective {
        if schema.attributes().any(|key_attr| key_attr == attribute.as_str()) {
            return Err(PostboxError::validation(format!("Cannot update key attribute {}", attribute)));
        }
        match update {
            FieldUpdate::Set(value) => {
                item.insert(attribute.clone(), value.clone());
            }
            FieldUpdate::Remove => {
                item.remove(attribute);
            }
            FieldUpdate::Keep => {}
        }
    }
    Ok(())
}

/// Position of a record in query order: index sort value, then table key
fn position(query: &Query, item: &Item) -> (String, String, String) {
    let sort_value = query
        .key_schema()
        .sort
        .and_then(|attr| attr_str(item, attr))
        .unwrap_or_default();
    let table_schema = query.table.key_schema();
    let partition = attr_str(item, table_schema.partition).unwrap_or_default();
    let sort = table_schema
        .sort
        .and_then(|attr| attr_str(item, attr))
        .unwrap_or_default();
    (sort_value.to_string(), partition.to_string(), sort.to_string())
}

/// Key handed back to resume after `item`: table key plus index key
fn evaluated_key(query: &Query, item: &Item) -> Item {
    let mut key = Item::new();
    for attribute in query.table.key_schema().attributes().chain(query.key_schema().attributes()) {
        if let Some(value) = item.get(attribute) {
            key.insert(attribute.to_string(), value.clone());
        }
    }
    key
}

/// Evaluate a query over candidate records.
///
/// Shared by every adapter so that key conditions, ordering, resumption,
/// limits and filters behave identically. Candidates outside the partition
/// or range are ignored.
pub fn evaluate_page(query: &Query, candidates: Vec<Item>) -> QueryPage {
    let schema = query.key_schema();
    let mut matching: Vec<Item> = candidates
        .into_iter()
        .filter(|item| attr_str(item, schema.partition) == Some(query.partition_value.as_str()))
        .filter(|item| match schema.sort {
            Some(attr) => attr_str(item, attr).map(|v| query.range.contains(v)).unwrap_or(false),
            None => true,
        })
        .collect();

    matching.sort_by(|a, b| {
        let ordering = position(query, a).cmp(&position(query, b));
        match query.sort {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });

    if let Some(start_key) = &query.start_key {
        let start = position(query, start_key);
        matching.retain(|item| {
            let ordering = position(query, item).cmp(&start);
            match query.sort {
                SortOrder::Asc => ordering == Ordering::Greater,
                SortOrder::Desc => ordering == Ordering::Less,
            }
        });
    }

    let limit = query.limit.unwrap_or(usize::MAX);
    let has_more = matching.len() > limit;
    matching.truncate(limit);

    let last_evaluated_key = if has_more {
        matching.last().map(|item| evaluated_key(query, item))
    } else {
        None
    };

    let items = matching
        .into_iter()
        .filter(|item| query.filters.iter().all(|filter| filter.matches(item)))
        .collect();

    QueryPage {
        items,
        last_evaluated_key,
    }
}
