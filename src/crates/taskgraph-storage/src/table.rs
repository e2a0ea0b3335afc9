//! Table schema, composite keys, and the storage contract
//!
//! The [`TabularStorage`] trait is deliberately small: rows in, rows out, partial-key
//! search, and change notification. Everything the engine persists (job records,
//! rate-limit execution records, cached task outputs, checkpoints) goes through this
//! contract, so a single backend implementation serves all of them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, StorageError};

/// A stored row: a JSON object whose fields are the table's columns
pub type Row = Value;

/// Callback invoked for every change matching a subscription
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Kind of mutation that produced a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Row inserted or replaced
    Put,
    /// Row removed
    Delete,
}

/// Notification emitted after a mutation commits
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Table the change happened in
    pub table: String,
    /// Whether the row was written or removed
    pub kind: ChangeKind,
    /// The affected row (the new value for puts, the old value for deletes)
    pub row: Row,
}

/// Options narrowing which changes a subscription receives
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Only deliver events whose row matches this partial key
    pub filter: Option<Key>,
    /// Only deliver events of this kind
    pub kind: Option<ChangeKind>,
}

impl SubscribeOptions {
    /// Subscribe to every change on the table
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict delivery to rows matching `filter`
    pub fn with_filter(mut self, filter: Key) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Restrict delivery to one change kind
    pub fn with_kind(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Handle returned by [`TabularStorage::subscribe_to_changes`]
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`]
/// explicitly (or hold the handle for the lifetime of the consumer and let the
/// table itself be dropped).
pub struct Subscription {
    unsubscribe: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    /// Build a subscription from its teardown closure
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Box::new(unsubscribe),
        }
    }

    /// Remove the listener from the table
    pub fn unsubscribe(self) {
        (self.unsubscribe)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// A composite key: ordered `(column, value)` pairs
///
/// A key is *complete* for a schema when it covers every primary-key column,
/// and *partial* otherwise. Partial keys drive [`TabularStorage::search`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Key {
    parts: Vec<(String, Value)>,
}

impl Key {
    /// Create an empty key
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column constraint
    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.parts.push((column.into(), value));
        self
    }

    /// Column names in insertion order
    pub fn columns(&self) -> Vec<String> {
        self.parts.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Constrained value for `column`, if present
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.parts
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// The underlying `(column, value)` pairs
    pub fn parts(&self) -> &[(String, Value)] {
        &self.parts
    }

    /// Whether the key constrains no columns
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Whether `row` satisfies every constraint in this key
    pub fn matches(&self, row: &Row) -> bool {
        self.parts
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }

    /// Extract this key's columns from a row
    ///
    /// Fails if the row lacks one of the columns.
    pub fn from_row(columns: &[String], table: &str, row: &Row) -> Result<Self> {
        let mut key = Key::new();
        for column in columns {
            let value = row
                .get(column)
                .ok_or_else(|| StorageError::MissingKeyColumn {
                    table: table.to_string(),
                    column: column.clone(),
                })?;
            key = key.with(column.clone(), value.clone());
        }
        Ok(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|(c, v)| format!("{}={}", c, v))
            .collect();
        write!(f, "({})", rendered.join(", "))
    }
}

/// Declared shape of a table: columns, primary key, and secondary indexes
#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// All column names
    pub columns: Vec<String>,
    /// Primary key columns, in order
    pub primary_key: Vec<String>,
    /// Secondary indexes, in declaration order
    pub indexes: Vec<Vec<String>>,
}

impl TableSchema {
    /// Start a schema for `name` with no columns
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Declare the table's columns
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the primary key columns
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a secondary index
    pub fn with_index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `column` is declared
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Validate that every column a key names exists in the schema
    pub fn check_key(&self, key: &Key) -> Result<()> {
        for (column, _) in key.parts() {
            if !self.has_column(column) {
                return Err(StorageError::UnknownColumn {
                    table: self.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }

    /// All indexes in search order: primary key first, then secondary indexes
    pub fn all_indexes(&self) -> Vec<&Vec<String>> {
        std::iter::once(&self.primary_key)
            .chain(self.indexes.iter())
            .collect()
    }

    /// Select the best index for a partial key
    ///
    /// The best index is the one with the longest leading prefix of columns all
    /// present in `available`. Ties are broken by declaration order (primary key
    /// first). Returns the index's columns and the usable prefix length.
    pub fn select_index(&self, available: &[String]) -> Result<(&Vec<String>, usize)> {
        let mut best: Option<(&Vec<String>, usize)> = None;
        for index in self.all_indexes() {
            let prefix_len = index
                .iter()
                .take_while(|column| available.iter().any(|a| a == *column))
                .count();
            if prefix_len == 0 {
                continue;
            }
            match best {
                // Strictly longer prefix wins; equal prefix keeps the earlier index.
                Some((_, len)) if prefix_len <= len => {}
                _ => best = Some((index, prefix_len)),
            }
        }
        best.ok_or_else(|| StorageError::NoMatchingIndex {
            table: self.name.clone(),
            columns: available.to_vec(),
        })
    }
}

/// Async storage contract for one table
///
/// Implementations must be safe for concurrent use; every mutation is atomic
/// with respect to readers and emits a [`ChangeEvent`] after it commits.
#[async_trait]
pub trait TabularStorage: Send + Sync {
    /// The table's declared schema
    fn schema(&self) -> &TableSchema;

    /// Create backing structures (tables, indexes). Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Insert or replace the row identified by the row's primary-key columns
    async fn put(&self, row: Row) -> Result<()>;

    /// Fetch the row for a complete primary key
    async fn get(&self, key: &Key) -> Result<Option<Row>>;

    /// Remove the row for a complete primary key (no-op when absent)
    async fn delete(&self, key: &Key) -> Result<()>;

    /// All rows matching a partial key, resolved through the best index
    async fn search(&self, partial: &Key) -> Result<Vec<Row>>;

    /// Remove all rows matching a partial key; returns the number removed
    async fn delete_search(&self, partial: &Key) -> Result<u64>;

    /// Number of rows matching a partial key (empty key counts the table)
    async fn count(&self, partial: &Key) -> Result<u64> {
        Ok(self.search(partial).await?.len() as u64)
    }

    /// Register a change listener; the returned handle removes it
    fn subscribe_to_changes(
        &self,
        listener: ChangeListener,
        options: SubscribeOptions,
    ) -> Subscription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new("t")
            .with_columns(["tenant", "queue", "id", "status"])
            .with_primary_key(["tenant", "queue", "id"])
            .with_index(["tenant", "status"])
            .with_index(["queue"])
    }

    #[test]
    fn select_index_prefers_longest_prefix() {
        let s = schema();
        let (index, len) = s
            .select_index(&["tenant".into(), "queue".into()])
            .unwrap();
        assert_eq!(index, &vec!["tenant".to_string(), "queue".to_string(), "id".to_string()]);
        assert_eq!(len, 2);
    }

    #[test]
    fn select_index_ties_break_by_declaration_order() {
        let s = schema();
        // "tenant" alone is a length-1 prefix of both the primary key and the
        // first secondary index; the primary key is declared first.
        let (index, len) = s.select_index(&["tenant".into()]).unwrap();
        assert_eq!(index[0], "tenant");
        assert_eq!(index.len(), 3);
        assert_eq!(len, 1);
    }

    #[test]
    fn select_index_rejects_unindexed_columns() {
        let s = schema();
        let err = s.select_index(&["status".into()]).unwrap_err();
        assert!(matches!(err, StorageError::NoMatchingIndex { .. }));
    }

    #[test]
    fn key_matches_rows() {
        let key = Key::new().with("queue", json!("default"));
        assert!(key.matches(&json!({"queue": "default", "id": 1})));
        assert!(!key.matches(&json!({"queue": "other", "id": 1})));
    }

    #[test]
    fn key_from_row_requires_all_columns() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let row = json!({"a": 1});
        let err = Key::from_row(&columns, "t", &row).unwrap_err();
        assert!(matches!(err, StorageError::MissingKeyColumn { .. }));
    }
}
