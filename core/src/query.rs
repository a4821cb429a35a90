//! Mailbox query engine
//!
//! Lists one viewer's messages through one of three access patterns and
//! fetches whole threads. Page boundaries are handed to callers as opaque
//! cursors.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{PostboxError, PostboxResult};
use crate::mailbox::MailboxKind;
use crate::message::{recipient_sender, timestamp_instant, Message};
use crate::storage::{
    attr_str, from_item, table_key, BlobStore, Filter, IndexName, Item, Query, RecordStore, SortOrder, SortRange,
    Table,
};

/// Page size used when a request does not set one
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Filters for [`MailboxQuery::list`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub sender: Option<String>,
    /// Inclusive lower bound, compared lexically (`2025-01` works)
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub mailbox: Option<MailboxKind>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// One page of a mailbox listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
    pub count: usize,
}

/// Opaque pagination token: the hex-encoded JSON of a last-evaluated key
pub struct Cursor;

impl Cursor {
    pub fn encode(key: &Item) -> PostboxResult<String> {
        Ok(hex::encode(serde_json::to_vec(key)?))
    }

    pub fn decode(cursor: &str) -> PostboxResult<Item> {
        let raw = hex::decode(cursor.trim()).map_err(|_| PostboxError::validation("Malformed cursor"))?;
        serde_json::from_slice(&raw).map_err(|_| PostboxError::validation("Malformed cursor"))
    }
}

/// Read side of the mail store
#[derive(Clone)]
pub struct MailboxQuery {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    default_limit: usize,
}

impl MailboxQuery {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            records,
            blobs,
            default_limit: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// Build the store query for a listing.
    ///
    /// Sent uses the sender index. A sender filter uses the composite
    /// recipient/sender index. Everything else reads the viewer's own
    /// partition. Inbox and Archived add an `archived` equality filter.
    pub fn plan(&self, viewer: &str, request: &ListRequest) -> PostboxResult<Query> {
        let limit = request.limit.unwrap_or(self.default_limit);
        if limit == 0 {
            return Err(PostboxError::validation("limit must be positive"));
        }

        let range = SortRange::from_bounds(request.start_date.clone(), request.end_date.clone());
        let start_key = request.cursor.as_deref().map(Cursor::decode).transpose()?;

        let mut query = match (request.mailbox, request.sender.as_deref()) {
            (Some(MailboxKind::Sent), _) => Query::on_index(IndexName::SenderTimestamp, viewer),
            (_, Some(sender)) if !sender.is_empty() => {
                Query::on_index(IndexName::RecipientSender, recipient_sender(viewer, sender))
            }
            _ => Query::new(Table::Emails, viewer),
        };

        if let Some(archived) = request.mailbox.and_then(MailboxKind::archived_filter) {
            query = query.with_filter(Filter::eq("archived", archived));
        }

        Ok(query
            .with_range(range)
            .with_limit(limit)
            .with_start_key(start_key)
            .with_sort(request.sort_order.unwrap_or_default()))
    }

    /// List one page of the viewer's messages
    pub async fn list(&self, viewer: &str, request: &ListRequest) -> PostboxResult<ListPage> {
        let query = self.plan(viewer, request)?;
        let page = self.records.query(&query).await?;

        let messages = page
            .items
            .into_iter()
            .map(from_item::<Message>)
            .collect::<PostboxResult<Vec<_>>>()?;
        let next_cursor = page.last_evaluated_key.as_ref().map(Cursor::encode).transpose()?;

        tracing::debug!("Listed {} messages for {}", messages.len(), viewer);
        Ok(ListPage {
            count: messages.len(),
            messages,
            next_cursor,
        })
    }

    /// Messages of one thread visible to `viewer`, oldest first
    pub async fn get_thread(&self, thread_id: Uuid, viewer: &str, include_body: bool) -> PostboxResult<Vec<Message>> {
        let relations = self
            .records
            .query(
                &Query::new(Table::ThreadRelations, thread_id.to_string())
                    .with_filter(Filter::eq("recipient", viewer))
                    .with_sort(SortOrder::Asc),
            )
            .await?;
        if relations.items.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<Item> = relations
            .items
            .iter()
            .filter_map(|relation| {
                let recipient = attr_str(relation, "recipient")?;
                let timestamp = attr_str(relation, "timestamp")?;
                Some(table_key(Table::Emails, recipient, timestamp))
            })
            .collect();

        let mut messages = Vec::with_capacity(keys.len());
        for item in self.records.batch_get(Table::Emails, &keys).await? {
            let metadata: Message = from_item(item)?;
            if include_body {
                messages.push(self.hydrate(metadata).await);
            } else {
                messages.push(metadata);
            }
        }

        messages.sort_by(|a, b| timestamp_instant(&a.timestamp).cmp(timestamp_instant(&b.timestamp)));
        Ok(messages)
    }

    /// Full message from its body blob, or the metadata if that fails
    pub async fn hydrate(&self, metadata: Message) -> Message {
        match self.load_body(&metadata.s3_key).await {
            Ok(full) => full,
            Err(e) => {
                tracing::warn!("Error fetching body {}: {}", metadata.s3_key, e);
                metadata
            }
        }
    }

    /// Read and decode a body blob
    pub async fn load_body(&self, s3_key: &str) -> PostboxResult<Message> {
        let blob = self.blobs.get(s3_key).await?;
        Ok(serde_json::from_slice(&blob.data)?)
    }
}
