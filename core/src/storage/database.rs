//! SQLite-backed record store for Postbox

use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    apply_updates, attr_str, evaluate_page, key_of, FieldUpdate, Item, PutCondition, Query, QueryPage, RecordStore,
    Table,
};
use crate::error::{PostboxError, PostboxResult};

/// Record store over one SQLite connection
pub struct SqliteRecordStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) the database file
    pub async fn new(database_path: PathBuf) -> PostboxResult<Self> {
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connection = Connection::open(database_path)?;
        let _mode: String = connection.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        connection.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;")?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Private in-memory database
    pub async fn in_memory() -> PostboxResult<Self> {
        Ok(Self {
            connection: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// Initialize the database (run migrations)
    pub async fn initialize(&mut self) -> PostboxResult<()> {
        let mut migration_manager = super::migrations::MigrationManager::new(self.connection.clone());
        migration_manager.run_migrations().await
    }
}

/// Columns projected out of the record for keys and indexes
fn columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Emails => &["recipient", "timestamp", "sender", "recipient_sender"],
        Table::ThreadRelations => &["thread_id", "timestamp", "message_id"],
    }
}

fn parse_item(text: &str) -> PostboxResult<Item> {
    Ok(serde_json::from_str(text)?)
}

fn key_clause(table: Table) -> String {
    table
        .key_schema()
        .attributes()
        .enumerate()
        .map(|(i, attribute)| format!("{} = ?{}", attribute, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn key_values(table: Table, key: &Item) -> PostboxResult<Vec<String>> {
    let key = key_of(table, key)?;
    Ok(table
        .key_schema()
        .attributes()
        .filter_map(|attribute| attr_str(&key, attribute).map(str::to_string))
        .collect())
}

fn select_one(conn: &Connection, table: Table, key: &Item) -> PostboxResult<Option<Item>> {
    let sql = format!("SELECT item FROM {} WHERE {}", table.name(), key_clause(table));
    let text: Option<String> = conn
        .query_row(&sql, params_from_iter(key_values(table, key)?), |row| row.get(0))
        .optional()?;
    text.as_deref().map(parse_item).transpose()
}

fn write(conn: &Connection, table: Table, item: &Item, condition: PutCondition) -> PostboxResult<()> {
    key_of(table, item)?;
    let cols = columns(table);
    let verb = match condition {
        PutCondition::Always => "INSERT OR REPLACE",
        PutCondition::NotExists => "INSERT",
    };
    let placeholders = (1..=cols.len() + 1).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "{} INTO {} ({}, item) VALUES ({})",
        verb,
        table.name(),
        cols.join(", "),
        placeholders
    );

    let mut values: Vec<Option<String>> = cols
        .iter()
        .map(|column| attr_str(item, column).map(str::to_string))
        .collect();
    values.push(Some(serde_json::to_string(item)?));

    match conn.execute(&sql, params_from_iter(values)) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => Err(
            PostboxError::condition_failed(format!("{} already holds this key", table.name())),
        ),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, table: Table, key: &Item) -> PostboxResult<Option<Item>> {
        let conn = self.connection.lock().await;
        select_one(&conn, table, key)
    }

    async fn put(&self, table: Table, item: Item, condition: PutCondition) -> PostboxResult<()> {
        let conn = self.connection.lock().await;
        write(&conn, table, &item, condition)
    }

    async fn update(&self, table: Table, key: &Item, updates: &[(String, FieldUpdate<Value>)]) -> PostboxResult<Item> {
        let conn = self.connection.lock().await;
        let mut item = select_one(&conn, table, key)?
            .ok_or_else(|| PostboxError::not_found(format!("{} record", table.name())))?;
        apply_updates(table, &mut item, updates)?;
        write(&conn, table, &item, PutCondition::Always)?;
        Ok(item)
    }

    async fn query(&self, query: &Query) -> PostboxResult<QueryPage> {
        let conn = self.connection.lock().await;
        let sql = format!(
            "SELECT item FROM {} WHERE {} = ?1",
            query.table.name(),
            query.key_schema().partition
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([query.partition_value.as_str()], |row| row.get::<_, String>(0))?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(parse_item(&row?)?);
        }
        Ok(evaluate_page(query, candidates))
    }

    async fn batch_get(&self, table: Table, keys: &[Item]) -> PostboxResult<Vec<Item>> {
        let conn = self.connection.lock().await;
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = select_one(&conn, table, key)? {
                found.push(item);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{table_key, Filter, IndexName};
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteRecordStore {
        let mut store = SqliteRecordStore::new(dir.path().join("postbox.db")).await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn email(recipient: &str, sender: &str, timestamp: &str) -> Item {
        json!({
            "recipient": recipient,
            "sender": sender,
            "recipient_sender": format!("{}#{}", recipient, sender),
            "timestamp": timestamp,
            "subject": "hi",
            "archived": false,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let item = email("me@x.org", "you@y.org", "2025-01-01T00:00:00.000Z#1");
        store.put(Table::Emails, item.clone(), PutCondition::NotExists).await.unwrap();

        let key = table_key(Table::Emails, "me@x.org", "2025-01-01T00:00:00.000Z#1");
        assert_eq!(store.get(Table::Emails, &key).await.unwrap(), Some(item.clone()));

        let missing = table_key(Table::Emails, "me@x.org", "nope");
        assert_eq!(store.get(Table::Emails, &missing).await.unwrap(), None);

        let duplicate = store.put(Table::Emails, item, PutCondition::NotExists).await;
        assert!(matches!(duplicate, Err(PostboxError::ConditionFailed(_))));
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .put(Table::Emails, email("me@x.org", "you@y.org", "t1"), PutCondition::Always)
            .await
            .unwrap();

        let key = table_key(Table::Emails, "me@x.org", "t1");
        let updated = store
            .update(Table::Emails, &key, &[("archived".into(), FieldUpdate::Set(json!(true)))])
            .await
            .unwrap();
        assert_eq!(updated["archived"], json!(true));

        let reread = store.get(Table::Emails, &key).await.unwrap().unwrap();
        assert_eq!(reread["archived"], json!(true));

        let missing = table_key(Table::Emails, "me@x.org", "t2");
        let err = store
            .update(Table::Emails, &missing, &[("read".into(), FieldUpdate::Set(json!(true)))])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_query_by_index_and_filter() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.put(Table::Emails, email("me@x.org", "a@x.org", "t1"), PutCondition::Always).await.unwrap();
        store.put(Table::Emails, email("me@x.org", "b@x.org", "t2"), PutCondition::Always).await.unwrap();
        store.put(Table::Emails, email("me@x.org", "a@x.org", "t3"), PutCondition::Always).await.unwrap();

        let page = store
            .query(&Query::on_index(IndexName::RecipientSender, "me@x.org#a@x.org"))
            .await
            .unwrap();
        let stamps: Vec<_> = page.items.iter().map(|i| i["timestamp"].clone()).collect();
        assert_eq!(stamps, vec![json!("t3"), json!("t1")]);

        let archived = store
            .query(&Query::new(Table::Emails, "me@x.org").with_filter(Filter::eq("archived", true)))
            .await
            .unwrap();
        assert!(archived.items.is_empty());
    }

    #[tokio::test]
    async fn test_thread_relations_by_message_id() {
        let store = {
            let mut store = SqliteRecordStore::in_memory().await.unwrap();
            store.initialize().await.unwrap();
            store
        };
        let relation = json!({
            "thread_id": "t-1",
            "timestamp": "2025-01-01T00:00:00.000Z#a",
            "message_id": "<a@x>",
            "recipient": "me@x.org",
            "subject": "hi",
        })
        .as_object()
        .cloned()
        .unwrap();
        store.put(Table::ThreadRelations, relation, PutCondition::Always).await.unwrap();

        let page = store
            .query(&Query::on_index(IndexName::MessageId, "<a@x>").with_limit(1))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["thread_id"], json!("t-1"));
    }
}
