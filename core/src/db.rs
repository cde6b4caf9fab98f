use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::info;
use serde_json::Value;

use crate::error::CoreError;
use crate::migrations::MIGRATIONS;
use crate::store::{DocumentStore, Edit};

pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

pub fn open_store(path: impl AsRef<Path>) -> Result<SqliteDocumentStore, CoreError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| CoreError::Persistence(format!("create {}: {}", parent.display(), err)))?;
    }
    let conn = Connection::open(&path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA journal_size_limit = 67108864; \
         PRAGMA temp_store = MEMORY;",
    )?;
    apply_migrations(&conn)?;
    info!(path = %path.display(), "document store opened");
    Ok(SqliteDocumentStore {
        conn: Mutex::new(conn),
    })
}

pub fn open_in_memory() -> Result<SqliteDocumentStore, CoreError> {
    let conn = Connection::open_in_memory()?;
    apply_migrations(&conn)?;
    Ok(SqliteDocumentStore {
        conn: Mutex::new(conn),
    })
}

pub fn apply_migrations(conn: &Connection) -> Result<(), CoreError> {
    let current_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let mut version = current_version as usize;
    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let next_version = idx + 1;
        if next_version <= version {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute_batch(&format!("PRAGMA user_version = {};", next_version))?;
        version = next_version;
    }
    Ok(())
}

impl SqliteDocumentStore {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Persistence("document store lock poisoned".to_string()))
    }
}

fn upsert(tx: &Transaction<'_>, collection: &str, key: &str, body: &Value) -> Result<(), CoreError> {
    tx.execute(
        "INSERT INTO documents (collection, key, body, updated_at) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(collection, key) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        params![collection, key, serde_json::to_string(body)?, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn decode(raw: String) -> Result<Value, CoreError> {
    Ok(serde_json::from_str(&raw)?)
}

impl DocumentStore for SqliteDocumentStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, CoreError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    fn list(&self, collection: &str) -> Result<Vec<Value>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM documents WHERE collection = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(row?)?);
        }
        Ok(out)
    }

    fn put(&self, collection: &str, key: &str, body: &Value) -> Result<(), CoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        upsert(&tx, collection, key, body)?;
        tx.commit()?;
        Ok(())
    }

    fn put_many(&self, collection: &str, docs: &[(String, Value)]) -> Result<(), CoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (key, body) in docs {
            upsert(&tx, collection, key, body)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn modify(
        &self,
        collection: &str,
        key: &str,
        edit: &mut dyn FnMut(Option<&Value>) -> Result<Edit, CoreError>,
    ) -> Result<bool, CoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?;
        let current = raw.map(decode).transpose()?;
        let written = match edit(current.as_ref())? {
            Edit::Keep => false,
            Edit::Put(body) => {
                upsert(&tx, collection, key, &body)?;
                true
            }
            Edit::Delete => {
                tx.execute(
                    "DELETE FROM documents WHERE collection = ?1 AND key = ?2",
                    params![collection, key],
                )? > 0
            }
        };
        tx.commit()?;
        Ok(written)
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool, CoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(removed > 0)
    }

    fn clear(&self, collection: &str) -> Result<usize, CoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM documents WHERE collection = ?1", params![collection])?;
        Ok(removed)
    }

    fn transfer(&self, from: &str, to: &str, key: &str, body: &Value) -> Result<bool, CoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM documents WHERE collection = ?1 AND key = ?2",
            params![from, key],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        upsert(&tx, to, key, body)?;
        tx.commit()?;
        Ok(true)
    }
}
