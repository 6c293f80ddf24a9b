//! Remote record store seam + durable local key-value storage for sitecost.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sitecost-storage";

/// One remote document: a hierarchical path plus its raw fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: String,
    pub data: JsonValue,
}

/// Query shapes the engine needs; a field-equality collection-group read for
/// project records and a full read of the shared item catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordQuery {
    ProjectRecords { project_id: String },
    Items,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One push from a live subscription. Every snapshot is full and
/// self-consistent, never a delta.
#[derive(Debug, Clone)]
pub enum DocumentPush {
    Snapshot(Vec<Document>),
    /// The subscription failed; the stream ends after this event.
    Lost(String),
}

/// Receiving half of a live remote subscription. Dropping it detaches from
/// the store.
#[derive(Debug)]
pub struct DocumentSubscription {
    rx: mpsc::UnboundedReceiver<DocumentPush>,
}

impl DocumentSubscription {
    pub async fn next(&mut self) -> Option<DocumentPush> {
        self.rx.recv().await
    }
}

/// The remote document store: point and collection reads, live push
/// subscriptions, merge upserts, deletes, and batched writes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;
    async fn fetch(&self, query: &RecordQuery) -> Result<Vec<Document>, StoreError>;
    async fn subscribe(&self, query: &RecordQuery) -> Result<DocumentSubscription, StoreError>;
    /// Merge-semantics write: supplied fields overwrite, others survive.
    async fn upsert(&self, path: &str, data: JsonValue) -> Result<(), StoreError>;
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
    async fn batch_upsert(&self, writes: Vec<(String, JsonValue)>) -> Result<(), StoreError>;
}

/// Legacy flat layout: records grouped by calendar month only.
pub fn legacy_record_path(yyyy_mm: &str, id: &str) -> String {
    format!("expenses/{yyyy_mm}/records/{id}")
}

/// Newer client/project-nested layout.
pub fn nested_record_path(client_id: &str, project_id: &str, yyyy_mm: &str, id: &str) -> String {
    format!("clients/{client_id}/projects/{project_id}/expenses/{yyyy_mm}/records/{id}")
}

/// Path prefix that identifies nested-layout documents for a project scope.
pub fn nested_prefix(client_id: &str, project_id: &str) -> String {
    format!("clients/{client_id}/projects/{project_id}/")
}

pub fn item_path(id: &str) -> String {
    format!("items/{id}")
}

const ITEMS_PREFIX: &str = "items/";
const RECORDS_SEGMENT: &str = "/records/";

fn matches_query(query: &RecordQuery, path: &str, data: &JsonValue) -> bool {
    match query {
        RecordQuery::ProjectRecords { project_id } => {
            path.contains(RECORDS_SEGMENT)
                && data.get("projectId").and_then(JsonValue::as_str) == Some(project_id.as_str())
        }
        RecordQuery::Items => path.starts_with(ITEMS_PREFIX),
    }
}

struct Watcher {
    query: RecordQuery,
    tx: mpsc::UnboundedSender<DocumentPush>,
}

#[derive(Default)]
struct MemoryInner {
    documents: BTreeMap<String, JsonValue>,
    watchers: Vec<Watcher>,
    subscribe_calls: usize,
    fetch_calls: usize,
    fail_fetches: bool,
    fetch_delay: Option<std::time::Duration>,
}

/// In-process [`RecordStore`] with full-snapshot push on every write. Backs
/// the test suite and the CLI demo.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions whose receiver is still attached.
    pub async fn live_subscription_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Total `subscribe` calls ever made against this store.
    pub async fn subscribe_call_count(&self) -> usize {
        self.inner.lock().await.subscribe_calls
    }

    /// Total `fetch` calls ever made against this store.
    pub async fn fetch_call_count(&self) -> usize {
        self.inner.lock().await.fetch_calls
    }

    /// Make subsequent `fetch` calls fail with a transport error.
    pub async fn set_fail_fetches(&self, fail: bool) {
        self.inner.lock().await.fail_fetches = fail;
    }

    /// Delay `fetch` responses, for exercising overlapping reads.
    pub async fn set_fetch_delay(&self, delay: std::time::Duration) {
        self.inner.lock().await.fetch_delay = Some(delay);
    }

    /// Deliver a subscription-level failure to every watcher of a project.
    pub async fn emit_subscription_error(&self, project_id: &str, message: &str) {
        let inner = self.inner.lock().await;
        for watcher in &inner.watchers {
            if let RecordQuery::ProjectRecords { project_id: p } = &watcher.query {
                if p == project_id {
                    let _ = watcher.tx.send(DocumentPush::Lost(message.to_string()));
                }
            }
        }
    }

    fn snapshot_for(inner: &MemoryInner, query: &RecordQuery) -> Vec<Document> {
        inner
            .documents
            .iter()
            .filter(|(path, data)| matches_query(query, path, data))
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            })
            .collect()
    }

    fn notify_watchers(inner: &mut MemoryInner) {
        let watchers = std::mem::take(&mut inner.watchers);
        let mut kept = Vec::with_capacity(watchers.len());
        for watcher in watchers {
            if watcher.tx.is_closed() {
                continue;
            }
            let snapshot = Self::snapshot_for(inner, &watcher.query);
            if watcher.tx.send(DocumentPush::Snapshot(snapshot)).is_ok() {
                kept.push(watcher);
            }
        }
        inner.watchers = kept;
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.documents.get(path).map(|data| Document {
            path: path.to_string(),
            data: data.clone(),
        }))
    }

    async fn fetch(&self, query: &RecordQuery) -> Result<Vec<Document>, StoreError> {
        let delay = {
            let mut inner = self.inner.lock().await;
            inner.fetch_calls += 1;
            if inner.fail_fetches {
                return Err(StoreError::Transport("fetch unavailable".to_string()));
            }
            inner.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.inner.lock().await;
        Ok(Self::snapshot_for(&inner, query))
    }

    async fn subscribe(&self, query: &RecordQuery) -> Result<DocumentSubscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.subscribe_calls += 1;
        let initial = Self::snapshot_for(&inner, query);
        let _ = tx.send(DocumentPush::Snapshot(initial));
        inner.watchers.push(Watcher {
            query: query.clone(),
            tx,
        });
        Ok(DocumentSubscription { rx })
    }

    async fn upsert(&self, path: &str, data: JsonValue) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .documents
            .entry(path.to_string())
            .or_insert_with(|| JsonValue::Object(Default::default()));
        merge_fields(entry, data);
        Self::notify_watchers(&mut inner);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.documents.remove(path).is_none() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Self::notify_watchers(&mut inner);
        Ok(())
    }

    async fn batch_upsert(&self, writes: Vec<(String, JsonValue)>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for (path, data) in writes {
            let entry = inner
                .documents
                .entry(path)
                .or_insert_with(|| JsonValue::Object(Default::default()));
            merge_fields(entry, data);
        }
        Self::notify_watchers(&mut inner);
        Ok(())
    }
}

fn merge_fields(target: &mut JsonValue, incoming: JsonValue) {
    match (target, incoming) {
        (JsonValue::Object(existing), JsonValue::Object(fields)) => {
            for (key, value) in fields {
                existing.insert(key, value);
            }
        }
        (target, incoming) => *target = incoming,
    }
}

/// Durable local key-value storage. Best-effort: the engine stays usable
/// when only the in-memory fallback is available.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// File-backed [`LocalStore`]: one file per key, written via temp file and
/// atomic rename so a crashed write never leaves a torn value behind.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    root: PathBuf,
}

impl FileLocalStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating local store directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.key_path(key);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading local store key {}", path.display()))
            }
        }
    }

    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.key_path(key);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(value.as_bytes())
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.key_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing local store key {}", path.display()))
            }
        }
    }
}

/// Plain in-memory [`LocalStore`], the fallback when no durable backend is
/// usable. Contents survive only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    map: StdMutex<HashMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.map.lock().expect("local store lock").get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map
            .lock()
            .expect("local store lock")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.map.lock().expect("local store lock").remove(key);
        Ok(())
    }
}

/// Open the primary file backend, falling back to memory when the directory
/// cannot be used.
pub async fn open_local_store(root: impl AsRef<Path>) -> Arc<dyn LocalStore> {
    let root = root.as_ref();
    match FileLocalStore::open(root).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(root = %root.display(), error = %err, "local store unavailable, using in-memory fallback");
            Arc::new(MemoryLocalStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fetch_filters_by_project_field() {
        let store = MemoryRecordStore::new();
        store
            .upsert(
                &nested_record_path("acme", "proj-7", "202603", "r1"),
                json!({"projectId": "proj-7", "amount": 10.0}),
            )
            .await
            .expect("upsert");
        store
            .upsert(
                &legacy_record_path("202603", "r2"),
                json!({"projectId": "proj-9", "amount": 5.0}),
            )
            .await
            .expect("upsert");

        let docs = store
            .fetch(&RecordQuery::ProjectRecords {
                project_id: "proj-7".to_string(),
            })
            .await
            .expect("fetch");
        assert_eq!(docs.len(), 1);
        assert!(docs[0].path.starts_with("clients/acme/"));
    }

    #[tokio::test]
    async fn upsert_merges_fields_and_pushes_snapshots() {
        let store = MemoryRecordStore::new();
        let path = legacy_record_path("202603", "r1");
        store
            .upsert(&path, json!({"projectId": "proj-7", "amount": 10.0}))
            .await
            .expect("upsert");

        let query = RecordQuery::ProjectRecords {
            project_id: "proj-7".to_string(),
        };
        let mut sub = store.subscribe(&query).await.expect("subscribe");
        match sub.next().await {
            Some(DocumentPush::Snapshot(docs)) => assert_eq!(docs.len(), 1),
            other => panic!("expected initial snapshot, got {other:?}"),
        }

        store
            .upsert(&path, json!({"paid": true}))
            .await
            .expect("merge");
        match sub.next().await {
            Some(DocumentPush::Snapshot(docs)) => {
                assert_eq!(docs[0].data["amount"], json!(10.0));
                assert_eq!(docs[0].data["paid"], json!(true));
            }
            other => panic!("expected merged snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_subscription_detaches() {
        let store = MemoryRecordStore::new();
        let query = RecordQuery::ProjectRecords {
            project_id: "proj-7".to_string(),
        };
        let sub = store.subscribe(&query).await.expect("subscribe");
        assert_eq!(store.live_subscription_count().await, 1);
        drop(sub);
        assert_eq!(store.live_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn delete_removes_document_and_pushes_updated_snapshot() {
        let store = MemoryRecordStore::new();
        let path = legacy_record_path("202603", "r1");
        store
            .upsert(&path, json!({"projectId": "proj-7", "amount": 10.0}))
            .await
            .expect("upsert");

        let query = RecordQuery::ProjectRecords {
            project_id: "proj-7".to_string(),
        };
        let mut sub = store.subscribe(&query).await.expect("subscribe");
        sub.next().await; // initial snapshot

        store.delete(&path).await.expect("delete");
        match sub.next().await {
            Some(DocumentPush::Snapshot(docs)) => assert!(docs.is_empty()),
            other => panic!("expected empty snapshot, got {other:?}"),
        }
        assert!(matches!(
            store.delete(&path).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_store_round_trips_and_overwrites_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = FileLocalStore::open(dir.path()).await.expect("open");

        assert!(store.get("items").await.expect("get").is_none());
        store.put("items", "[1,2]").await.expect("put");
        store.put("items", "[1,2,3]").await.expect("overwrite");
        assert_eq!(store.get("items").await.expect("get").as_deref(), Some("[1,2,3]"));

        store.remove("items").await.expect("remove");
        assert!(store.get("items").await.expect("get").is_none());

        // No temp debris left behind after the rename dance.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn open_local_store_falls_back_when_root_is_unusable() {
        let dir = tempdir().expect("tempdir");
        let blocking_file = dir.path().join("occupied");
        std::fs::write(&blocking_file, b"not a directory").expect("write");

        let store = open_local_store(&blocking_file).await;
        store.put("k", "v").await.expect("fallback put");
        assert_eq!(store.get("k").await.expect("get").as_deref(), Some("v"));
    }
}
