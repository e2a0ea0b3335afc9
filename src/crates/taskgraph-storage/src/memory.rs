//! In-memory implementation of [`TabularStorage`] for testing and single-process use
//!
//! Rows live in a `HashMap` keyed by the encoded primary key; secondary indexes are
//! maintained eagerly on every write so partial-key searches go through the same
//! index-selection path a database-backed implementation would use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::trace;

use crate::error::{Result, StorageError};
use crate::table::{
    ChangeEvent, ChangeKind, ChangeListener, Key, Row, SubscribeOptions, Subscription,
    TableSchema, TabularStorage,
};

/// Encoded tuple of key-part values, used as a map key
type EncodedKey = String;

struct ListenerEntry {
    listener: ChangeListener,
    options: SubscribeOptions,
}

#[derive(Default)]
struct Tables {
    /// Primary rows by encoded primary key
    rows: HashMap<EncodedKey, Row>,
    /// Per-index postings: index position -> encoded prefix -> primary keys
    postings: HashMap<usize, HashMap<EncodedKey, Vec<EncodedKey>>>,
}

/// In-memory table
///
/// Provides the same semantics as a SQL-backed table: atomic writes, searches
/// answered through declared indexes, and change notification after commit.
/// Listeners run synchronously on the writer's thread, outside the row lock.
pub struct InMemoryTable {
    schema: TableSchema,
    tables: RwLock<Tables>,
    /// Behind an Arc so unsubscribe handles can reach the map without
    /// borrowing the table.
    listeners: Arc<Mutex<HashMap<u64, ListenerEntry>>>,
    next_listener_id: AtomicU64,
}

impl InMemoryTable {
    /// Create an empty table for `schema`
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            tables: RwLock::new(Tables::default()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Number of rows currently stored
    pub fn len(&self) -> usize {
        self.tables.read().rows.len()
    }

    /// Whether the table holds no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every row (for tests)
    pub fn clear(&self) {
        let mut tables = self.tables.write();
        tables.rows.clear();
        tables.postings.clear();
    }

    fn encode_values(values: &[&Value]) -> EncodedKey {
        // Unit separator keeps multi-column values unambiguous.
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    fn primary_key_of(&self, row: &Row) -> Result<EncodedKey> {
        let mut values = Vec::with_capacity(self.schema.primary_key.len());
        for column in &self.schema.primary_key {
            let value = row
                .get(column)
                .ok_or_else(|| StorageError::MissingKeyColumn {
                    table: self.schema.name.clone(),
                    column: column.clone(),
                })?;
            values.push(value);
        }
        Ok(Self::encode_values(&values))
    }

    fn encode_complete_key(&self, key: &Key) -> Result<EncodedKey> {
        let mut values = Vec::with_capacity(self.schema.primary_key.len());
        for column in &self.schema.primary_key {
            let value = key.get(column).ok_or_else(|| StorageError::MissingKeyColumn {
                table: self.schema.name.clone(),
                column: column.clone(),
            })?;
            values.push(value);
        }
        Ok(Self::encode_values(&values))
    }

    fn index_entries(&self, row: &Row) -> Vec<(usize, EncodedKey)> {
        // One posting per declared index per usable prefix length, so any prefix
        // lookup lands on a precomputed bucket.
        let mut entries = Vec::new();
        for (position, index) in self.schema.all_indexes().into_iter().enumerate() {
            let mut values: Vec<&Value> = Vec::new();
            for column in index {
                match row.get(column) {
                    Some(value) => {
                        values.push(value);
                        entries.push((position, Self::encode_values(&values)));
                    }
                    None => break,
                }
            }
        }
        entries
    }

    fn insert_row(tables: &mut Tables, pk: EncodedKey, row: Row, entries: Vec<(usize, EncodedKey)>) {
        for (position, encoded) in entries {
            let posting = tables
                .postings
                .entry(position)
                .or_default()
                .entry(encoded)
                .or_default();
            if !posting.contains(&pk) {
                posting.push(pk.clone());
            }
        }
        tables.rows.insert(pk, row);
    }

    fn remove_row(tables: &mut Tables, pk: &EncodedKey, entries: Vec<(usize, EncodedKey)>) {
        for (position, encoded) in entries {
            if let Some(buckets) = tables.postings.get_mut(&position) {
                if let Some(posting) = buckets.get_mut(&encoded) {
                    posting.retain(|candidate| candidate != pk);
                    if posting.is_empty() {
                        buckets.remove(&encoded);
                    }
                }
            }
        }
        tables.rows.remove(pk);
    }

    fn notify(&self, event: ChangeEvent) {
        // Snapshot listeners first so a listener may unsubscribe (or subscribe)
        // without deadlocking against this emission.
        let snapshot: Vec<(ChangeListener, SubscribeOptions)> = {
            let listeners = self.listeners.lock();
            listeners
                .values()
                .map(|entry| (Arc::clone(&entry.listener), entry.options.clone()))
                .collect()
        };
        for (listener, options) in snapshot {
            if let Some(kind) = options.kind {
                if kind != event.kind {
                    continue;
                }
            }
            if let Some(filter) = &options.filter {
                if !filter.matches(&event.row) {
                    continue;
                }
            }
            listener(&event);
        }
    }

    /// Search rows matching `partial` through the best index
    fn search_sync(&self, partial: &Key) -> Result<Vec<Row>> {
        self.schema.check_key(partial)?;
        let tables = self.tables.read();

        if partial.is_empty() {
            return Ok(tables.rows.values().cloned().collect());
        }

        let available = partial.columns();
        let (index, prefix_len) = self.schema.select_index(&available)?;
        trace!(
            table = %self.schema.name,
            index = ?index,
            prefix_len,
            "resolving partial-key search"
        );
        let position = self
            .schema
            .all_indexes()
            .iter()
            .position(|candidate| *candidate == index)
            .unwrap_or(0);

        let prefix_values: Vec<&Value> = index
            .iter()
            .take(prefix_len)
            .filter_map(|column| partial.get(column))
            .collect();
        let encoded = Self::encode_values(&prefix_values);

        let candidates = tables
            .postings
            .get(&position)
            .and_then(|buckets| buckets.get(&encoded))
            .cloned()
            .unwrap_or_default();

        // Residual columns not covered by the index prefix are filtered here.
        let rows = candidates
            .iter()
            .filter_map(|pk| tables.rows.get(pk))
            .filter(|row| partial.matches(row))
            .cloned()
            .collect();
        Ok(rows)
    }
}

#[async_trait]
impl TabularStorage for InMemoryTable {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, row: Row) -> Result<()> {
        if !row.is_object() {
            return Err(StorageError::Backend(format!(
                "rows for table '{}' must be JSON objects",
                self.schema.name
            )));
        }
        let pk = self.primary_key_of(&row)?;
        let entries = self.index_entries(&row);
        {
            let mut tables = self.tables.write();
            if let Some(previous) = tables.rows.get(&pk).cloned() {
                let stale = self.index_entries(&previous);
                Self::remove_row(&mut tables, &pk, stale);
            }
            Self::insert_row(&mut tables, pk, row.clone(), entries);
        }
        self.notify(ChangeEvent {
            table: self.schema.name.clone(),
            kind: ChangeKind::Put,
            row,
        });
        Ok(())
    }

    async fn get(&self, key: &Key) -> Result<Option<Row>> {
        self.schema.check_key(key)?;
        let pk = self.encode_complete_key(key)?;
        Ok(self.tables.read().rows.get(&pk).cloned())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.schema.check_key(key)?;
        let pk = self.encode_complete_key(key)?;
        let removed = {
            let mut tables = self.tables.write();
            match tables.rows.get(&pk).cloned() {
                Some(row) => {
                    let entries = self.index_entries(&row);
                    Self::remove_row(&mut tables, &pk, entries);
                    Some(row)
                }
                None => None,
            }
        };
        if let Some(row) = removed {
            self.notify(ChangeEvent {
                table: self.schema.name.clone(),
                kind: ChangeKind::Delete,
                row,
            });
        }
        Ok(())
    }

    async fn search(&self, partial: &Key) -> Result<Vec<Row>> {
        self.search_sync(partial)
    }

    async fn delete_search(&self, partial: &Key) -> Result<u64> {
        let rows = self.search_sync(partial)?;
        let mut removed = 0u64;
        for row in rows {
            let pk = self.primary_key_of(&row)?;
            let deleted = {
                let mut tables = self.tables.write();
                if tables.rows.contains_key(&pk) {
                    let entries = self.index_entries(&row);
                    Self::remove_row(&mut tables, &pk, entries);
                    true
                } else {
                    false
                }
            };
            if deleted {
                removed += 1;
                self.notify(ChangeEvent {
                    table: self.schema.name.clone(),
                    kind: ChangeKind::Delete,
                    row,
                });
            }
        }
        Ok(removed)
    }

    fn subscribe_to_changes(
        &self,
        listener: ChangeListener,
        options: SubscribeOptions,
    ) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .insert(id, ListenerEntry { listener, options });

        let listeners = Arc::clone(&self.listeners);
        Subscription::new(move || {
            listeners.lock().remove(&id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> InMemoryTable {
        InMemoryTable::new(
            TableSchema::new("jobs")
                .with_columns(["queue_name", "id", "status", "attempts"])
                .with_primary_key(["queue_name", "id"])
                .with_index(["queue_name", "status"]),
        )
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let t = table();
        let row = json!({"queue_name": "q", "id": "a", "status": "pending", "attempts": 0});
        t.put(row.clone()).await.unwrap();
        let key = Key::new()
            .with("queue_name", json!("q"))
            .with("id", json!("a"));
        assert_eq!(t.get(&key).await.unwrap(), Some(row));
    }

    #[tokio::test]
    async fn search_uses_secondary_index() {
        let t = table();
        for (id, status) in [("a", "pending"), ("b", "pending"), ("c", "done")] {
            t.put(json!({"queue_name": "q", "id": id, "status": status, "attempts": 0}))
                .await
                .unwrap();
        }
        let pending = t
            .search(
                &Key::new()
                    .with("queue_name", json!("q"))
                    .with("status", json!("pending")),
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn put_replaces_and_reindexes() {
        let t = table();
        t.put(json!({"queue_name": "q", "id": "a", "status": "pending", "attempts": 0}))
            .await
            .unwrap();
        t.put(json!({"queue_name": "q", "id": "a", "status": "done", "attempts": 1}))
            .await
            .unwrap();
        let pending = t
            .search(
                &Key::new()
                    .with("queue_name", json!("q"))
                    .with("status", json!("pending")),
            )
            .await
            .unwrap();
        assert!(pending.is_empty());
        assert_eq!(t.len(), 1);
    }

    #[tokio::test]
    async fn delete_search_removes_matches() {
        let t = table();
        for id in ["a", "b", "c"] {
            t.put(json!({"queue_name": "q", "id": id, "status": "pending", "attempts": 0}))
                .await
                .unwrap();
        }
        let removed = t
            .delete_search(&Key::new().with("queue_name", json!("q")))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert!(t.is_empty());
    }
}
