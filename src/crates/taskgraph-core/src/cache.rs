//! Task-output cache keyed by input fingerprint
//!
//! For a cacheable task type, the cache maps
//! `fingerprint(task_type, canonicalized_input)` to the serialized output of a
//! prior successful `execute`. Two contracts matter here:
//!
//! - **Consulted before queueing**: a hit short-circuits the task straight to
//!   `COMPLETED` without touching the executor or the job queue.
//! - **Singleflight**: for a given key, `execute` runs at most once across
//!   concurrent callers; the others wait and share the result. Misses that
//!   fail do not poison the key - the next caller simply executes again.
//!
//! Writes happen only after a successful execute. Eviction belongs to the
//! storage backend; this layer relies solely on get/put/invalidate.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use taskgraph_storage::{Key, TableSchema, TabularStorage};

use crate::error::Result;
use crate::fingerprint::task_cache_key;

/// Table name used by [`TaskOutputCache::schema`]
pub const CACHE_TABLE: &str = "task_output_cache";

/// Fingerprint-keyed output cache with singleflight execution
pub struct TaskOutputCache {
    table: Arc<dyn TabularStorage>,
    /// One async mutex per in-flight fingerprint
    inflight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TaskOutputCache {
    /// Wrap a table created with [`TaskOutputCache::schema`]
    pub fn new(table: Arc<dyn TabularStorage>) -> Self {
        Self {
            table,
            inflight: AsyncMutex::new(HashMap::new()),
        }
    }

    /// The schema a backing table must be created with
    pub fn schema() -> TableSchema {
        TableSchema::new(CACHE_TABLE)
            .with_columns(["fingerprint", "task_type", "output", "created_at"])
            .with_primary_key(["fingerprint"])
            .with_index(["task_type"])
    }

    /// Cache key for a task execution
    pub fn key(task_type: &str, input: &Value) -> String {
        task_cache_key(task_type, input)
    }

    /// Look up a cached output
    pub async fn get(&self, fingerprint: &str) -> Result<Option<Value>> {
        let row = self
            .table
            .get(&Key::new().with("fingerprint", json!(fingerprint)))
            .await?;
        Ok(row.and_then(|row| row.get("output").cloned()))
    }

    /// Store the output of a successful execute
    pub async fn put(&self, fingerprint: &str, task_type: &str, output: &Value) -> Result<()> {
        self.table
            .put(json!({
                "fingerprint": fingerprint,
                "task_type": task_type,
                "output": output,
                "created_at": Utc::now().to_rfc3339(),
            }))
            .await?;
        Ok(())
    }

    /// Drop one cached entry
    pub async fn invalidate(&self, fingerprint: &str) -> Result<()> {
        self.table
            .delete(&Key::new().with("fingerprint", json!(fingerprint)))
            .await?;
        Ok(())
    }

    /// Drop every entry of a task type
    pub async fn invalidate_task_type(&self, task_type: &str) -> Result<u64> {
        Ok(self
            .table
            .delete_search(&Key::new().with("task_type", json!(task_type)))
            .await?)
    }

    /// Resolve through the cache with singleflight semantics
    ///
    /// On a hit, returns the cached output. On a miss, runs `execute` while
    /// holding the key's flight lock: concurrent callers for the same key
    /// wait, re-check the cache, and share the first caller's result. The
    /// value is written through only when `execute` succeeds.
    pub async fn get_or_execute<F, Fut>(
        &self,
        fingerprint: &str,
        task_type: &str,
        execute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        if let Some(hit) = self.get(fingerprint).await? {
            trace!(%fingerprint, task_type, "cache hit");
            return Ok(hit);
        }

        let flight = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(fingerprint.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let result = {
            let _guard = flight.lock().await;
            // A concurrent flight may have populated the cache while we waited.
            match self.get(fingerprint).await {
                Ok(Some(hit)) => {
                    trace!(%fingerprint, task_type, "cache hit after flight wait");
                    Ok(hit)
                }
                Ok(None) => {
                    debug!(%fingerprint, task_type, "cache miss, executing");
                    let result = execute().await;
                    if let Ok(output) = &result {
                        self.put(fingerprint, task_type, output).await?;
                    }
                    result
                }
                Err(err) => Err(err),
            }
        };

        // Drop the per-key entry once no other caller holds it (our local
        // clone plus the map itself account for two), keeping the flight map
        // bounded by concurrently contended keys.
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(entry) = inflight.get(fingerprint) {
                if Arc::strong_count(entry) <= 2 {
                    inflight.remove(fingerprint);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskGraphError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskgraph_storage::InMemoryTable;

    fn cache() -> Arc<TaskOutputCache> {
        Arc::new(TaskOutputCache::new(Arc::new(InMemoryTable::new(
            TaskOutputCache::schema(),
        ))))
    }

    #[tokio::test]
    async fn hit_after_put() {
        let cache = cache();
        let key = TaskOutputCache::key("upper", &json!({"text": "hi"}));
        assert!(cache.get(&key).await.unwrap().is_none());
        cache.put(&key, "upper", &json!({"text": "HI"})).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(json!({"text": "HI"})));

        cache.invalidate(&key).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn singleflight_executes_once() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = TaskOutputCache::key("slow", &json!({"n": 1}));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_execute(&key, "slow", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(json!({"n": 2}))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!({"n": 2}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_execute_is_not_cached() {
        let cache = cache();
        let key = TaskOutputCache::key("flaky", &json!({}));

        let err = cache
            .get_or_execute(&key, "flaky", || async {
                Err::<Value, _>(TaskGraphError::Transient("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Next caller executes again and can succeed.
        let value = cache
            .get_or_execute(&key, "flaky", || async { Ok(json!("ok")) })
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(cache.get(&key).await.unwrap(), Some(json!("ok")));
    }

    #[tokio::test]
    async fn invalidate_by_task_type() {
        let cache = cache();
        cache.put("fp1", "upper", &json!(1)).await.unwrap();
        cache.put("fp2", "upper", &json!(2)).await.unwrap();
        cache.put("fp3", "lower", &json!(3)).await.unwrap();
        assert_eq!(cache.invalidate_task_type("upper").await.unwrap(), 2);
        assert!(cache.get("fp1").await.unwrap().is_none());
        assert_eq!(cache.get("fp3").await.unwrap(), Some(json!(3)));
    }
}
