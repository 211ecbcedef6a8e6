//! Key-Value Store Adapter (C1).
//!
//! A thin typed wrapper over a networked key-value store, matching the shape of the session
//! persistence layer this crate is descended from (atomic writes, TTL-bounded state, namespace
//! partitioning) but modeled behind a trait so the in-process reference implementation can be
//! swapped for a real networked store without touching any stage code.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::debug;

use crate::error::KvError;

/// Partitions of task-scoped state within the persisted store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    BasicInfo,
    Progress,
    StageResult(crate::model::StageName),
    AssembledResult,
}

impl Namespace {
    fn key_part(self) -> String {
        match self {
            Namespace::BasicInfo => "basic_info".to_string(),
            Namespace::Progress => "progress".to_string(),
            Namespace::StageResult(stage) => format!("stage_result/{stage}"),
            Namespace::AssembledResult => "assembled_result".to_string(),
        }
    }
}

/// Operations exposed by the Key-Value Store Adapter. Values are JSON-serialized; failures are
/// surfaced to the caller, the adapter itself never retries.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(
        &self,
        namespace: Namespace,
        task_id: &str,
        field: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), KvError>;

    async fn get(
        &self,
        namespace: Namespace,
        task_id: &str,
        field: &str,
    ) -> Result<Option<serde_json::Value>, KvError>;

    async fn delete(&self, namespace: Namespace, task_id: &str) -> Result<(), KvError>;

    async fn scan(&self, namespace: Namespace) -> Result<Vec<String>, KvError>;
}

/// Typed helpers layered over the raw [`KvStore`] trait; every stage and the registry go
/// through these rather than hand-rolling `serde_json::to_value`/`from_value` at call sites.
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn put_typed<T: Serialize + Send + Sync>(
        &self,
        namespace: Namespace,
        task_id: &str,
        field: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), KvError> {
        let json = serde_json::to_value(value)?;
        self.put(namespace, task_id, field, json, ttl).await
    }

    async fn get_typed<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        task_id: &str,
        field: &str,
    ) -> Result<Option<T>, KvError> {
        match self.get(namespace, task_id, field).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }
}

impl<T: KvStore + ?Sized> KvStoreExt for T {}

#[derive(Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

type StoreKey = (String, String, String); // (namespace, task_id, field)

/// In-process reference implementation backed by `dashmap`, the same concurrent-map crate the
/// surrounding codebase already depends on for its other shared state. A background sweep task
/// removes expired entries, so expiry removes a task's keys atomically from the registry's
/// perspective without a real network round-trip.
pub struct DashMapKvStore {
    entries: Arc<DashMap<StoreKey, Entry>>,
}

impl DashMapKvStore {
    pub fn new(sweep_interval: Duration) -> Arc<Self> {
        let store = Arc::new(Self {
            entries: Arc::new(DashMap::new()),
        });
        let entries = store.entries.clone();
        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                let removed = before - entries.len();
                if removed > 0 {
                    debug!(removed, "kv store expiry sweep removed entries");
                }
            }
        });
        store
    }

    fn key(namespace: Namespace, task_id: &str, field: &str) -> StoreKey {
        (namespace.key_part(), task_id.to_string(), field.to_string())
    }
}

#[async_trait]
impl KvStore for DashMapKvStore {
    async fn put(
        &self,
        namespace: Namespace,
        task_id: &str,
        field: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), KvError> {
        let key = Self::key(namespace, task_id, field);
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(
        &self,
        namespace: Namespace,
        task_id: &str,
        field: &str,
    ) -> Result<Option<serde_json::Value>, KvError> {
        let key = Self::key(namespace, task_id, field);
        Ok(self
            .entries
            .get(&key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, namespace: Namespace, task_id: &str) -> Result<(), KvError> {
        let prefix = namespace.key_part();
        self.entries
            .retain(|(ns, tid, _), _| !(ns == &prefix && tid == task_id));
        Ok(())
    }

    async fn scan(&self, namespace: Namespace) -> Result<Vec<String>, KvError> {
        let prefix = namespace.key_part();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == prefix)
            .map(|entry| entry.key().1.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageName;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = DashMapKvStore::new(Duration::from_secs(60));
        store
            .put_typed(
                Namespace::BasicInfo,
                "t1",
                "file_name",
                &"spec.md".to_string(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let got: Option<String> = store
            .get_typed(Namespace::BasicInfo, "t1", "file_name")
            .await
            .unwrap();
        assert_eq!(got, Some("spec.md".to_string()));
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let store = DashMapKvStore::new(Duration::from_secs(3600));
        store
            .put(
                Namespace::Progress,
                "t1",
                "overall",
                serde_json::json!(10),
                Duration::from_millis(1),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // The sweep interval is an hour, so this entry is still physically present; get()
        // must still treat it as absent based on expires_at alone.
        let got = store.get(Namespace::Progress, "t1", "overall").await.unwrap();
        assert!(got.is_none());
        let keys = store.scan(Namespace::Progress).await.unwrap();
        assert!(keys.contains(&"t1".to_string()));
        store.delete(Namespace::Progress, "t1").await.unwrap();
        let keys = store.scan(Namespace::Progress).await.unwrap();
        assert!(!keys.contains(&"t1".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_only_matching_namespace() {
        let store = DashMapKvStore::new(Duration::from_secs(60));
        store
            .put(Namespace::BasicInfo, "t1", "a", serde_json::json!(1), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put(
                Namespace::StageResult(StageName::DocumentParsing),
                "t1",
                "result",
                serde_json::json!({}),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store.delete(Namespace::BasicInfo, "t1").await.unwrap();
        assert!(
            store
                .get(Namespace::BasicInfo, "t1", "a")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .get(Namespace::StageResult(StageName::DocumentParsing), "t1", "result")
                .await
                .unwrap()
                .is_some()
        );
    }
}
