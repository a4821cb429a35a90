//! Database migrations for Postbox

use crate::error::{PostboxError, PostboxResult};
use rusqlite::{Connection, Result as SqliteResult};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Migration manager for database schema updates
pub struct MigrationManager {
    connection: Arc<Mutex<Connection>>,
}

impl MigrationManager {
    /// Create a new migration manager
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    /// Run all pending migrations
    pub async fn run_migrations(&mut self) -> PostboxResult<()> {
        self.create_migrations_table().await?;

        for migration in self.get_migrations() {
            if !self.is_migration_applied(migration.name()).await? {
                tracing::info!("Applying migration: {}", migration.name());
                let mut conn = self.connection.lock().await;
                migration
                    .apply(&mut conn)
                    .map_err(|e| PostboxError::DatabaseMigration(format!("{}: {}", migration.name(), e)))?;
                drop(conn);
                self.mark_migration_applied(migration.name()).await?;
                tracing::info!("Migration applied successfully: {}", migration.name());
            }
        }

        Ok(())
    }

    /// Number of applied migrations
    pub async fn applied_count(&self) -> PostboxResult<i64> {
        let conn = self.connection.lock().await;
        let count = conn.query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Create the migrations tracking table
    async fn create_migrations_table(&mut self) -> SqliteResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(())
    }

    /// Check if a migration has been applied
    async fn is_migration_applied(&self, migration_name: &str) -> SqliteResult<bool> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM migrations WHERE name = ?")?;
        let count: i64 = stmt.query_row([migration_name], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Mark a migration as applied
    async fn mark_migration_applied(&mut self, migration_name: &str) -> SqliteResult<()> {
        let conn = self.connection.lock().await;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [migration_name])?;
        Ok(())
    }

    fn get_migrations(&self) -> Vec<Box<dyn Migration>> {
        vec![
            Box::new(CreateEmailsTable),
            Box::new(CreateThreadRelationsTable),
            Box::new(AddIndexes),
        ]
    }
}

trait Migration {
    fn name(&self) -> &str;
    fn apply(&self, connection: &mut Connection) -> SqliteResult<()>;
}

/// Metadata records. Key and index attributes are projected into columns,
/// the full record lives in `item`.
struct CreateEmailsTable;

impl Migration for CreateEmailsTable {
    fn name(&self) -> &str {
        "create_emails_table"
    }

    fn apply(&self, connection: &mut Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE emails (
                recipient TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                sender TEXT,
                recipient_sender TEXT,
                item TEXT NOT NULL,
                PRIMARY KEY (recipient, timestamp)
            )",
            [],
        )?;
        Ok(())
    }
}

struct CreateThreadRelationsTable;

impl Migration for CreateThreadRelationsTable {
    fn name(&self) -> &str {
        "create_thread_relations_table"
    }

    fn apply(&self, connection: &mut Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE TABLE thread_relations (
                thread_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                message_id TEXT,
                item TEXT NOT NULL,
                PRIMARY KEY (thread_id, timestamp)
            )",
            [],
        )?;
        Ok(())
    }
}

struct AddIndexes;

impl Migration for AddIndexes {
    fn name(&self) -> &str {
        "add_indexes"
    }

    fn apply(&self, connection: &mut Connection) -> SqliteResult<()> {
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_emails_sender_timestamp ON emails (sender, timestamp)",
            [],
        )?;
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_emails_recipient_sender_timestamp ON emails (recipient_sender, timestamp)",
            [],
        )?;
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_thread_relations_message_id ON thread_relations (message_id)",
            [],
        )?;
        Ok(())
    }
}
