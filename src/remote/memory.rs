use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{Collection, Query, RemoteStore};
use crate::core::Row;
use crate::error::{Error, Result};

/// Store operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Insert,
    Update,
    Delete,
    DeleteWhere,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<Collection, Vec<Row>>,
    calls: HashMap<(Collection, StoreOp), usize>,
    fail_next: Vec<(Collection, StoreOp)>,
}

/// In-process table store with the same filter and ordering semantics as the
/// hosted one. Used by the offline mode of the binary and by tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before touching the tables.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `op` on `collection` fail with a 500.
    pub fn fail_next(&self, collection: Collection, op: StoreOp) {
        self.lock().fail_next.push((collection, op));
    }

    pub fn calls(&self, collection: Collection, op: StoreOp) -> usize {
        self.lock().calls.get(&(collection, op)).copied().unwrap_or(0)
    }

    /// Raw rows currently stored, in insertion order.
    pub fn rows(&self, collection: Collection) -> Vec<Row> {
        self.lock().rows.get(&collection).cloned().unwrap_or_default()
    }

    /// Seed a row directly, bypassing counters.
    pub fn seed(&self, collection: Collection, row: Row) {
        let row = with_defaults(collection, row);
        self.lock().rows.entry(collection).or_default().push(row);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, collection: Collection, op: StoreOp) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut tables = self.lock();
        *tables.calls.entry((collection, op)).or_default() += 1;
        if let Some(idx) = tables.fail_next.iter().position(|f| *f == (collection, op)) {
            tables.fail_next.remove(idx);
            log::debug!("memory store: injected failure for {:?} on {}", op, collection.table());
            return Err(Error::store(500, format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

fn with_defaults(collection: Collection, mut row: Row) -> Row {
    let now = json!(Utc::now().to_rfc3339());
    row.entry("id").or_insert_with(|| json!(Uuid::new_v4().to_string()));
    row.entry("created_at").or_insert_with(|| now.clone());
    row.entry("updated_at").or_insert(now);
    row.entry("due_date").or_insert(Value::Null);
    match collection {
        Collection::Notes => {
            row.entry("title").or_insert(Value::Null);
            row.entry("content").or_insert(Value::Null);
            row.entry("is_pinned").or_insert(json!(false));
            row.entry("bg_color").or_insert(json!("#ffffff"));
            row.entry("deleted_at").or_insert(Value::Null);
        }
        Collection::Tasks => {
            row.entry("is_completed").or_insert(json!(false));
            row.entry("position").or_insert(json!(0));
        }
    }
    row
}

fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list(&self, collection: Collection, query: &Query) -> Result<Vec<Row>> {
        self.enter(collection, StoreOp::List).await?;
        let tables = self.lock();
        let mut rows: Vec<Row> = tables
            .rows
            .get(&collection)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        query.sort(&mut rows);
        Ok(rows)
    }

    async fn insert(&self, collection: Collection, row: Row) -> Result<Row> {
        self.enter(collection, StoreOp::Insert).await?;
        let row = with_defaults(collection, row);
        self.lock().rows.entry(collection).or_default().push(row.clone());
        Ok(row)
    }

    async fn update(&self, collection: Collection, id: Uuid, patch: Row) -> Result<Row> {
        self.enter(collection, StoreOp::Update).await?;
        let id = id.to_string();
        let mut tables = self.lock();
        let row = tables
            .rows
            .get_mut(&collection)
            .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id.as_str())))
            .ok_or_else(|| Error::NotFound(format!("{} {}", collection.table(), id)))?;
        for (k, v) in patch {
            row.insert(k, v);
        }
        Ok(row.clone())
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<()> {
        self.enter(collection, StoreOp::Delete).await?;
        let id = id.to_string();
        let mut tables = self.lock();
        if let Some(rows) = tables.rows.get_mut(&collection) {
            rows.retain(|r| row_id(r) != Some(id.as_str()));
        }
        if collection == Collection::Notes {
            // Tasks belong to their note; the hosted store cascades the same way.
            if let Some(tasks) = tables.rows.get_mut(&Collection::Tasks) {
                tasks.retain(|t| t.get("note_id").and_then(Value::as_str) != Some(id.as_str()));
            }
        }
        Ok(())
    }

    async fn delete_where(&self, collection: Collection, query: &Query) -> Result<u64> {
        self.enter(collection, StoreOp::DeleteWhere).await?;
        let mut tables = self.lock();
        let Some(rows) = tables.rows.get_mut(&collection) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !query.matches(r));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_row(title: &str) -> Row {
        let Value::Object(map) = json!({ "title": title, "user_id": Uuid::nil().to_string() }) else {
            unreachable!()
        };
        map
    }

    #[tokio::test]
    async fn insert_fills_server_columns() {
        let store = MemoryStore::new();
        let row = store.insert(Collection::Notes, note_row("A")).await.unwrap();
        assert!(row.contains_key("id"));
        assert_eq!(row["bg_color"], json!("#ffffff"));
        assert_eq!(row["deleted_at"], Value::Null);
        assert_eq!(store.calls(Collection::Notes, StoreOp::Insert), 1);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let store = MemoryStore::new();
        store.fail_next(Collection::Notes, StoreOp::Insert);
        assert!(store.insert(Collection::Notes, note_row("A")).await.is_err());
        assert!(store.insert(Collection::Notes, note_row("A")).await.is_ok());
        assert_eq!(store.rows(Collection::Notes).len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update(Collection::Notes, Uuid::new_v4(), Row::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn deleting_a_note_cascades_to_its_tasks() {
        let store = MemoryStore::new();
        let note = store.insert(Collection::Notes, note_row("A")).await.unwrap();
        let note_id = note["id"].as_str().unwrap().to_string();
        let Value::Object(task) = json!({ "note_id": note_id, "content": "x" }) else { unreachable!() };
        store.insert(Collection::Tasks, task).await.unwrap();

        store.delete(Collection::Notes, Uuid::parse_str(&note_id).unwrap()).await.unwrap();
        assert!(store.rows(Collection::Tasks).is_empty());
    }
}
