//! Reply threading
//!
//! A message joins the thread of the first ancestor we already know about,
//! trying `In-Reply-To` first and then `References` newest to oldest.
//! Ancestors are found through the `MessageIdIndex` on thread relations.
//! Subjects are never consulted.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::PostboxResult;
use crate::storage::{attr_str, IndexName, Query, RecordStore};

/// Outcome of [`ThreadResolver::resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadResolution {
    pub thread_id: Uuid,
    pub is_new_thread: bool,
}

impl ThreadResolution {
    fn existing(thread_id: Uuid) -> Self {
        Self {
            thread_id,
            is_new_thread: false,
        }
    }

    fn fresh() -> Self {
        Self {
            thread_id: Uuid::new_v4(),
            is_new_thread: true,
        }
    }
}

/// Assigns thread ids from reply headers
#[derive(Clone)]
pub struct ThreadResolver {
    records: Arc<dyn RecordStore>,
}

impl ThreadResolver {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Decide which thread a message belongs to.
    ///
    /// `message_id` and `viewing_recipient` are accepted for logging only:
    /// Message-IDs are treated as globally unique, so the lookup is not
    /// scoped to a recipient. Lookup failures count as misses.
    pub async fn resolve(
        &self,
        message_id: &str,
        in_reply_to: Option<&str>,
        references: &[String],
        viewing_recipient: &str,
    ) -> ThreadResolution {
        let ancestors = in_reply_to
            .into_iter()
            .chain(references.iter().rev().map(String::as_str))
            .filter(|id| !id.trim().is_empty());

        for ancestor in ancestors {
            if let Some(thread_id) = self.lookup(ancestor).await {
                tracing::debug!(
                    "Message {} for {} joins thread {} via {}",
                    message_id,
                    viewing_recipient,
                    thread_id,
                    ancestor
                );
                return ThreadResolution::existing(thread_id);
            }
        }

        let resolution = ThreadResolution::fresh();
        tracing::debug!(
            "Message {} for {} starts thread {}",
            message_id,
            viewing_recipient,
            resolution.thread_id
        );
        resolution
    }

    async fn lookup(&self, message_id: &str) -> Option<Uuid> {
        match self.try_lookup(message_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Error looking up thread for message {}: {}", message_id, e);
                None
            }
        }
    }

    async fn try_lookup(&self, message_id: &str) -> PostboxResult<Option<Uuid>> {
        let page = self
            .records
            .query(&Query::on_index(IndexName::MessageId, message_id).with_limit(1))
            .await?;

        let Some(thread_id) = page.items.first().and_then(|item| attr_str(item, "thread_id")) else {
            return Ok(None);
        };
        match Uuid::parse_str(thread_id) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                tracing::warn!("Ignoring malformed thread id {} for {}: {}", thread_id, message_id, e);
                Ok(None)
            }
        }
    }
}
