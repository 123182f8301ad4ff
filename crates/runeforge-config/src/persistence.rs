//! DuckDB-backed document persistence.
//!
//! Each logical collection is a table of JSON documents keyed by identifier.
//! A per-table sequence records first insertion order, which callers rely on
//! when replaying state (the training queue is ordered by it).

use anyhow::{Context, Result};
use chrono::Utc;
use duckdb::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Collections stored by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentTable {
    TrainingQueue,
    Orbs,
    Runes,
    Approvals,
    Enhancements,
    Revocations,
    Agents,
}

impl DocumentTable {
    pub const ALL: [DocumentTable; 7] = [
        DocumentTable::TrainingQueue,
        DocumentTable::Orbs,
        DocumentTable::Runes,
        DocumentTable::Approvals,
        DocumentTable::Enhancements,
        DocumentTable::Revocations,
        DocumentTable::Agents,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            DocumentTable::TrainingQueue => "training_queue",
            DocumentTable::Orbs => "orbs",
            DocumentTable::Runes => "runes",
            DocumentTable::Approvals => "approvals",
            DocumentTable::Enhancements => "enhancements",
            DocumentTable::Revocations => "revocations",
            DocumentTable::Agents => "agents",
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub seq: i64,
    pub body: String,
    pub updated_at: String,
}

/// Durable storage handle.
#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl Persistence {
    /// Open (or create) a database file and run migrations.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        let persistence = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path),
        };
        persistence.migrate()?;
        Ok(persistence)
    }

    /// Open a throwaway in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let persistence = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        };
        persistence.migrate()?;
        Ok(persistence)
    }

    /// Path of the database file, if file-backed.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection lock poisoned"))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        for table in DocumentTable::ALL {
            let name = table.table_name();
            conn.execute_batch(&format!(
                "CREATE SEQUENCE IF NOT EXISTS {name}_seq START 1;
                 CREATE TABLE IF NOT EXISTS {name} (
                     id TEXT PRIMARY KEY,
                     seq BIGINT NOT NULL,
                     body TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );"
            ))
            .with_context(|| format!("Failed to migrate table {name}"))?;
        }
        Ok(())
    }

    /// Insert a document, or replace the body of an existing one.
    ///
    /// Replacing keeps the original sequence number.
    pub fn document_upsert(&self, table: DocumentTable, id: &str, body: &str) -> Result<()> {
        let name = table.table_name();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {name} (id, seq, body, updated_at)
                 VALUES (?, nextval('{name}_seq'), ?, ?)
                 ON CONFLICT (id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at"
            ),
            params![id, body, now],
        )
        .with_context(|| format!("Failed to upsert {id} into {name}"))?;
        Ok(())
    }

    /// Fetch one document body.
    pub fn document_get(&self, table: DocumentTable, id: &str) -> Result<Option<String>> {
        let name = table.table_name();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT body FROM {name} WHERE id = ?"))?;
        let mut rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        let body = match rows.next() {
            Some(body) => Some(body?),
            None => None,
        };
        Ok(body)
    }

    /// List every document in first-insertion order.
    pub fn document_list(&self, table: DocumentTable) -> Result<Vec<DocumentRecord>> {
        let name = table.table_name();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, seq, body, updated_at FROM {name} ORDER BY seq"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(DocumentRecord {
                id: row.get(0)?,
                seq: row.get(1)?,
                body: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record.with_context(|| format!("Failed to read row from {name}"))?);
        }
        Ok(records)
    }

    /// Count documents in a table.
    pub fn document_count(&self, table: DocumentTable) -> Result<i64> {
        let name = table.table_name();
        let conn = self.conn()?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_upsert_and_list_in_insertion_order() {
        let persistence = Persistence::in_memory().unwrap();
        persistence
            .document_upsert(DocumentTable::TrainingQueue, "b", r#"{"n":1}"#)
            .unwrap();
        persistence
            .document_upsert(DocumentTable::TrainingQueue, "a", r#"{"n":2}"#)
            .unwrap();
        // Updating "b" must not move it behind "a"
        persistence
            .document_upsert(DocumentTable::TrainingQueue, "b", r#"{"n":3}"#)
            .unwrap();

        let records = persistence
            .document_list(DocumentTable::TrainingQueue)
            .unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(records[0].body, r#"{"n":3}"#);
        assert_eq!(
            persistence
                .document_count(DocumentTable::TrainingQueue)
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_document_get() {
        let persistence = Persistence::in_memory().unwrap();
        persistence
            .document_upsert(DocumentTable::Orbs, "orb-1", "{}")
            .unwrap();

        assert_eq!(
            persistence.document_get(DocumentTable::Orbs, "orb-1").unwrap(),
            Some("{}".to_string())
        );
        assert_eq!(
            persistence.document_get(DocumentTable::Orbs, "missing").unwrap(),
            None
        );
    }

    #[test]
    fn test_tables_are_isolated() {
        let persistence = Persistence::in_memory().unwrap();
        persistence
            .document_upsert(DocumentTable::Runes, "x", "{}")
            .unwrap();
        assert_eq!(persistence.document_count(DocumentTable::Orbs).unwrap(), 0);
        assert_eq!(persistence.document_count(DocumentTable::Runes).unwrap(), 1);
    }

    #[test]
    fn test_file_backed_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.duckdb");

        {
            let persistence = Persistence::new(&path).unwrap();
            persistence
                .document_upsert(DocumentTable::Approvals, "item-1", r#"{"status":"pending"}"#)
                .unwrap();
        }

        let reopened = Persistence::new(&path).unwrap();
        assert_eq!(reopened.db_path(), Some(path.as_path()));
        let records = reopened.document_list(DocumentTable::Approvals).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "item-1");
    }
}
