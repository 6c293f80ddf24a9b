//! Client-side sync engine: subscription cache, aggregation inputs, the
//! local item dictionary, fuzzy matching, and auto-categorization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use anyhow::{anyhow, bail};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value as JsonValue};
use sitecost_core::{sort_by_payment_date, ExpenseRecord, ItemRecord, Scope, ScopeInput};
use sitecost_storage::{
    item_path, nested_prefix, Document, DocumentPush, LocalStore, RecordQuery, RecordStore,
};
use strsim::jaro_winkler;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sitecost-sync";

/// The `{data, loading, error}` triple the cache hands to readers.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub records: Vec<ExpenseRecord>,
    pub loading: bool,
    pub error: Option<String>,
}

type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;
type RefetchState = Option<Result<(), String>>;

#[derive(Default)]
struct ProjectEntry {
    records: Vec<ExpenseRecord>,
    loading: bool,
    error: Option<String>,
    has_data: bool,
    listeners: HashMap<u64, Listener>,
    /// Pump task owning the live remote subscription, at most one per key.
    pump: Option<JoinHandle<()>>,
    /// The scope the live subscription was opened under.
    opened_scope: Option<Scope>,
    /// In-flight forced refetch; concurrent callers share this completion.
    refetch: Option<watch::Receiver<RefetchState>>,
}

fn snapshot_of(entry: &ProjectEntry) -> Snapshot {
    Snapshot {
        records: entry.records.clone(),
        loading: entry.loading,
        error: entry.error.clone(),
    }
}

struct CacheInner {
    store: Arc<dyn RecordStore>,
    entries: StdMutex<HashMap<String, ProjectEntry>>,
    next_listener_id: AtomicU64,
}

/// Process-wide subscription cache for project expense records.
///
/// One entry per project id; every entry owns at most one live remote
/// subscription and at most one in-flight forced refetch, no matter how many
/// readers observe the project concurrently. Entry mutation happens under a
/// single lock acquisition with no suspension point inside, so interleaved
/// operations never lose updates; snapshot writes are last-wins.
pub struct ExpenseCache {
    inner: Arc<CacheInner>,
}

impl ExpenseCache {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                entries: StdMutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current snapshot for a scope, without side effects. Unknown or
    /// unresolvable scopes read as empty and non-loading.
    pub fn get(&self, scope: impl Into<ScopeInput>) -> Snapshot {
        let scope = Scope::resolve(scope);
        if !scope.has_project() {
            return Snapshot::default();
        }
        let entries = self.inner.entries.lock().expect("cache lock");
        entries
            .get(&scope.project_id)
            .map(snapshot_of)
            .unwrap_or_default()
    }

    /// Register a listener for a scope. Lazily opens the single live remote
    /// subscription for the project and triggers an initial fetch when the
    /// entry is cold. Dropping the returned guard detaches the listener; the
    /// last detach tears the remote subscription down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        scope: impl Into<ScopeInput>,
        listener: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> CacheSubscription {
        let scope = Scope::resolve(scope);
        if !scope.has_project() {
            return CacheSubscription { handle: None };
        }
        let listener: Listener = Arc::new(listener);
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let project_id = scope.project_id.clone();

        let cold = {
            let mut entries = self.inner.entries.lock().expect("cache lock");
            let entry = entries.entry(project_id.clone()).or_default();
            entry.listeners.insert(id, listener);
            if entry.pump.is_none() {
                debug!(project_id = %project_id, "opening live expense subscription");
                entry.pump = Some(tokio::spawn(run_subscription(
                    Arc::clone(&self.inner),
                    scope.clone(),
                )));
                entry.opened_scope = Some(scope.clone());
            }
            !entry.has_data && !entry.loading
        };

        if cold {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let _ = refetch_project(inner, scope).await;
            });
        }

        CacheSubscription {
            handle: Some((Arc::clone(&self.inner), project_id, id)),
        }
    }

    /// Forced full re-read bypassing the cache; the low-latency path after a
    /// write whose effects must be visible immediately.
    pub async fn refetch(&self, scope: impl Into<ScopeInput>) -> anyhow::Result<()> {
        let scope = Scope::resolve(scope);
        if !scope.has_project() {
            bail!("refetch requires a resolvable project id");
        }
        refetch_project(Arc::clone(&self.inner), scope).await
    }

    /// Ensure a live subscription exists, then force a refetch. Mutation call
    /// sites use this to guarantee read-your-writes without waiting on push
    /// propagation.
    pub async fn invalidate(&self, scope: impl Into<ScopeInput>) -> anyhow::Result<()> {
        let scope = Scope::resolve(scope);
        if !scope.has_project() {
            bail!("invalidate requires a resolvable project id");
        }
        {
            let mut entries = self.inner.entries.lock().expect("cache lock");
            let entry = entries.entry(scope.project_id.clone()).or_default();
            if entry.pump.is_none() {
                entry.pump = Some(tokio::spawn(run_subscription(
                    Arc::clone(&self.inner),
                    scope.clone(),
                )));
                entry.opened_scope = Some(scope.clone());
            }
        }
        refetch_project(Arc::clone(&self.inner), scope).await
    }
}

/// Listener registration handle. Dropping it unsubscribes.
pub struct CacheSubscription {
    handle: Option<(Arc<CacheInner>, String, u64)>,
}

impl CacheSubscription {
    /// False when the scope could not be resolved and nothing was registered.
    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        let Some((inner, project_id, id)) = self.handle.take() else {
            return;
        };
        let mut entries = inner.entries.lock().expect("cache lock");
        let Some(entry) = entries.get_mut(&project_id) else {
            return;
        };
        entry.listeners.remove(&id);
        if entry.listeners.is_empty() {
            if let Some(pump) = entry.pump.take() {
                pump.abort();
            }
            entry.opened_scope = None;
            debug!(project_id = %project_id, "last listener detached, closed live expense subscription");
        }
    }
}

async fn run_subscription(inner: Arc<CacheInner>, scope: Scope) {
    let query = RecordQuery::ProjectRecords {
        project_id: scope.project_id.clone(),
    };
    match inner.store.subscribe(&query).await {
        Ok(mut subscription) => {
            while let Some(push) = subscription.next().await {
                match push {
                    DocumentPush::Snapshot(documents) => inner.apply_snapshot(&scope, documents),
                    DocumentPush::Lost(message) => {
                        inner.apply_error(&scope.project_id, message, true);
                        return;
                    }
                }
            }
            inner.clear_pump(&scope.project_id);
        }
        Err(err) => inner.apply_error(&scope.project_id, err.to_string(), true),
    }
}

async fn refetch_project(inner: Arc<CacheInner>, scope: Scope) -> anyhow::Result<()> {
    enum Role {
        Runner(watch::Sender<RefetchState>, Scope),
        Waiter(watch::Receiver<RefetchState>),
    }

    let role = {
        let mut entries = inner.entries.lock().expect("cache lock");
        let entry = entries.entry(scope.project_id.clone()).or_default();
        if let Some(rx) = &entry.refetch {
            Role::Waiter(rx.clone())
        } else {
            let (tx, rx) = watch::channel(None);
            entry.refetch = Some(rx);
            entry.loading = true;
            // A bare-project refetch reuses the richer scope the live
            // subscription was opened under, if any.
            let effective = match &entry.opened_scope {
                Some(opened) if scope.client_id.is_empty() => opened.clone(),
                _ => scope.clone(),
            };
            Role::Runner(tx, effective)
        }
    };

    match role {
        Role::Waiter(mut rx) => loop {
            let state = rx.borrow().clone();
            if let Some(result) = state {
                return result.map_err(|message| anyhow!(message));
            }
            if rx.changed().await.is_err() {
                bail!("refetch aborted before completion");
            }
        },
        Role::Runner(tx, effective) => {
            let query = RecordQuery::ProjectRecords {
                project_id: effective.project_id.clone(),
            };
            let outcome = match inner.store.fetch(&query).await {
                Ok(documents) => {
                    inner.clear_refetch(&effective.project_id);
                    inner.apply_snapshot(&effective, documents);
                    Ok(())
                }
                Err(err) => {
                    let message = err.to_string();
                    inner.clear_refetch(&effective.project_id);
                    inner.apply_error(&effective.project_id, message.clone(), false);
                    Err(message)
                }
            };
            let _ = tx.send(Some(outcome.clone()));
            outcome.map_err(|message| anyhow!(message))
        }
    }
}

impl CacheInner {
    /// Replace the entry snapshot with records derived from a full document
    /// set and fan the result out to listeners. Last write wins.
    fn apply_snapshot(&self, scope: &Scope, documents: Vec<Document>) {
        let records = derive_records(scope, &documents);
        let notify = {
            let mut entries = self.entries.lock().expect("cache lock");
            let Some(entry) = entries.get_mut(&scope.project_id) else {
                return;
            };
            entry.records = records;
            entry.loading = false;
            entry.error = None;
            entry.has_data = true;
            let listeners: Vec<Listener> = entry.listeners.values().cloned().collect();
            (snapshot_of(entry), listeners)
        };
        let (snapshot, listeners) = notify;
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Record a scope-level failure. Cached data is preserved; stale data
    /// with an error indicator beats a blank view.
    fn apply_error(&self, project_id: &str, message: String, clear_pump: bool) {
        warn!(project_id = %project_id, error = %message, "expense subscription error");
        let notify = {
            let mut entries = self.entries.lock().expect("cache lock");
            let Some(entry) = entries.get_mut(project_id) else {
                return;
            };
            entry.error = Some(message);
            entry.loading = false;
            if clear_pump {
                entry.pump = None;
            }
            let listeners: Vec<Listener> = entry.listeners.values().cloned().collect();
            (snapshot_of(entry), listeners)
        };
        let (snapshot, listeners) = notify;
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn clear_pump(&self, project_id: &str) {
        let mut entries = self.entries.lock().expect("cache lock");
        if let Some(entry) = entries.get_mut(project_id) {
            entry.pump = None;
        }
    }

    fn clear_refetch(&self, project_id: &str) {
        let mut entries = self.entries.lock().expect("cache lock");
        if let Some(entry) = entries.get_mut(project_id) {
            entry.refetch = None;
        }
    }
}

/// Derive the record list for a scope from a raw document set: prefer
/// nested-layout documents, fall back to the legacy flat layout when none
/// exist, drop documents that fail validation, and sort by payment date.
fn derive_records(scope: &Scope, documents: &[Document]) -> Vec<ExpenseRecord> {
    let project_marker = format!("/projects/{}/", scope.project_id);
    let client_prefix = (!scope.client_id.is_empty())
        .then(|| nested_prefix(&scope.client_id, &scope.project_id));

    let nested: Vec<&Document> = documents
        .iter()
        .filter(|doc| {
            doc.path.contains(&project_marker)
                && client_prefix
                    .as_deref()
                    .map_or(true, |prefix| doc.path.starts_with(prefix))
        })
        .collect();
    let chosen: Vec<&Document> = if nested.is_empty() {
        documents.iter().collect()
    } else {
        nested
    };

    let mut records: Vec<ExpenseRecord> = chosen
        .into_iter()
        .filter_map(|doc| match ExpenseRecord::from_document(&doc.data, &scope.yyyy_mm) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(path = %doc.path, error = %err, "skipping malformed expense document");
                None
            }
        })
        .collect();
    sort_by_payment_date(&mut records);
    records
}

const ITEMS_KEY: &str = "items";
const MAINTENANCE_KEY: &str = "items.last-maintenance";

/// Retention and maintenance knobs for the local item dictionary.
#[derive(Debug, Clone)]
pub struct DictionaryConfig {
    pub retention_days: i64,
    pub maintenance_interval_days: i64,
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            maintenance_interval_days: 7,
        }
    }
}

impl DictionaryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retention_days: std::env::var("SITECOST_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retention_days),
            maintenance_interval_days: std::env::var("SITECOST_MAINTENANCE_INTERVAL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.maintenance_interval_days),
        }
    }
}

/// What changed in the dictionary; consumers react selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryEvent {
    Loaded,
    Saved,
    Used,
    Learned,
    Pruned,
}

/// Durable, possibly-stale local copy of the item catalog, kept usable
/// offline. Remote writes are best-effort; the local copy always updates.
pub struct ItemDictionary {
    store: Arc<dyn RecordStore>,
    local: Arc<dyn LocalStore>,
    config: DictionaryConfig,
    items: StdMutex<Option<Vec<ItemRecord>>>,
    events: broadcast::Sender<DictionaryEvent>,
}

impl ItemDictionary {
    pub fn new(
        store: Arc<dyn RecordStore>,
        local: Arc<dyn LocalStore>,
        config: DictionaryConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            store,
            local,
            config,
            items: StdMutex::new(None),
            events,
        }
    }

    /// Observer seam: every local mutation broadcasts an event here.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DictionaryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: DictionaryEvent) {
        let _ = self.events.send(event);
    }

    fn cached(&self) -> Option<Vec<ItemRecord>> {
        self.items.lock().expect("dictionary lock").clone()
    }

    fn set_cached(&self, items: Vec<ItemRecord>) {
        *self.items.lock().expect("dictionary lock") = Some(items);
    }

    /// Read the catalog from durable local storage. `None` when absent; a
    /// corrupt cached value reads as absent (with a warning), never an error.
    pub async fn load_local(&self) -> anyhow::Result<Option<Vec<ItemRecord>>> {
        if let Some(items) = self.cached() {
            return Ok(Some(items));
        }
        let Some(text) = self.local.get(ITEMS_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Vec<ItemRecord>>(&text) {
            Ok(items) => {
                self.set_cached(items.clone());
                self.notify(DictionaryEvent::Loaded);
                Ok(Some(items))
            }
            Err(err) => {
                warn!(error = %err, "discarding corrupt local item cache");
                Ok(None)
            }
        }
    }

    /// Local copy if present, else seed it from the remote store. A remote
    /// failure degrades to an empty (uncached) catalog so the engine keeps
    /// working offline.
    pub async fn ensure_loaded(&self) -> anyhow::Result<Vec<ItemRecord>> {
        if let Some(items) = self.load_local().await? {
            return Ok(items);
        }
        let documents = match self.store.fetch(&RecordQuery::Items).await {
            Ok(documents) => documents,
            Err(err) => {
                warn!(error = %err, "item catalog fetch failed, starting empty");
                return Ok(Vec::new());
            }
        };
        let items: Vec<ItemRecord> = documents
            .iter()
            .filter_map(|doc| match serde_json::from_value(doc.data.clone()) {
                Ok(item) => Some(item),
                Err(err) => {
                    warn!(path = %doc.path, error = %err, "skipping malformed item document");
                    None
                }
            })
            .collect();
        self.local
            .put(ITEMS_KEY, &serde_json::to_string(&items)?)
            .await?;
        self.set_cached(items.clone());
        self.notify(DictionaryEvent::Loaded);
        Ok(items)
    }

    /// Overwrite the durable local catalog.
    pub async fn save(&self, items: Vec<ItemRecord>) -> anyhow::Result<()> {
        self.local
            .put(ITEMS_KEY, &serde_json::to_string(&items)?)
            .await?;
        self.set_cached(items);
        self.notify(DictionaryEvent::Saved);
        Ok(())
    }

    /// Bump `lastUsedAt` for one item: locally right away, remotely
    /// best-effort (a failure is logged and swallowed).
    pub async fn mark_used(&self, id: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut items = self.ensure_loaded().await?;
        for item in &mut items {
            if item.id == id {
                item.last_used_at = Some(now);
            }
        }
        self.local
            .put(ITEMS_KEY, &serde_json::to_string(&items)?)
            .await?;
        self.set_cached(items);
        self.notify(DictionaryEvent::Used);

        if let Err(err) = self
            .store
            .upsert(&item_path(id), json!({ "lastUsedAt": now }))
            .await
        {
            warn!(item_id = %id, error = %err, "remote usage mark failed, local copy updated");
        }
        Ok(())
    }

    /// Merge a newly learned item into the catalog, replacing any existing
    /// entry with the same normalized name (last write wins).
    pub async fn learn(&self, item: ItemRecord) -> anyhow::Result<ItemRecord> {
        match serde_json::to_value(&item) {
            Ok(fields) => {
                if let Err(err) = self.store.upsert(&item_path(&item.id), fields).await {
                    warn!(item_id = %item.id, error = %err, "remote learn write failed, local copy updated");
                }
            }
            Err(err) => warn!(item_id = %item.id, error = %err, "item did not serialize for remote write"),
        }

        let mut items = self.load_local().await?.unwrap_or_default();
        items.retain(|existing| existing.name_lower != item.name_lower);
        items.push(item.clone());
        self.local
            .put(ITEMS_KEY, &serde_json::to_string(&items)?)
            .await?;
        self.set_cached(items);
        self.notify(DictionaryEvent::Learned);
        Ok(item)
    }

    /// Periodic upkeep, gated to once per maintenance interval by a persisted
    /// stamp. Returns false when skipped.
    ///
    /// Two passes: drop items unused past the retention window from the
    /// local copy only, then push cached `lastUsedAt` values upstream in one
    /// batch so the local cache is never the only place usage was recorded.
    pub async fn run_maintenance(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        if let Some(stamp) = self.local.get(MAINTENANCE_KEY).await? {
            if let Ok(last_run) = DateTime::parse_from_rfc3339(&stamp) {
                let age = now.signed_duration_since(last_run.with_timezone(&Utc));
                if age < Duration::days(self.config.maintenance_interval_days) {
                    return Ok(false);
                }
            }
        }

        let mut items = self.ensure_loaded().await?;
        let cutoff = now - Duration::days(self.config.retention_days);
        let before = items.len();
        items.retain(|item| item.last_used_at.unwrap_or(item.created_at) >= cutoff);
        let pruned = before - items.len();

        let writes: Vec<(String, JsonValue)> = items
            .iter()
            .filter(|item| item.last_used_at.is_some())
            .map(|item| (item_path(&item.id), json!({ "lastUsedAt": item.last_used_at })))
            .collect();
        if !writes.is_empty() {
            if let Err(err) = self.store.batch_upsert(writes).await {
                warn!(error = %err, "usage stamp upstream sync failed");
            }
        }

        self.local
            .put(ITEMS_KEY, &serde_json::to_string(&items)?)
            .await?;
        self.set_cached(items);
        if pruned > 0 {
            debug!(pruned, "retention sweep dropped stale items");
            self.notify(DictionaryEvent::Pruned);
        }
        self.local.put(MAINTENANCE_KEY, &now.to_rfc3339()).await?;
        Ok(true)
    }
}

/// Fall back to the full candidate set when the first-character bucket is
/// smaller than this.
const SMALL_BUCKET: usize = 24;

/// Tolerant-search capability, injected so the engine compiles and tests
/// without any particular scoring backend.
pub trait SimilaritySearch: Send + Sync {
    /// Index of the best-scoring candidate, or `None` below the threshold.
    fn search(&self, query: &str, candidates: &[&ItemRecord]) -> Option<(usize, f64)>;
}

/// Default scorer over Jaro-Winkler similarity.
#[derive(Debug, Clone, Copy)]
pub struct JaroWinklerSearch {
    pub threshold: f64,
}

impl Default for JaroWinklerSearch {
    fn default() -> Self {
        Self { threshold: 0.82 }
    }
}

impl SimilaritySearch for JaroWinklerSearch {
    fn search(&self, query: &str, candidates: &[&ItemRecord]) -> Option<(usize, f64)> {
        let query = query.trim().to_lowercase();
        let mut best: Option<(usize, f64)> = None;
        for (index, item) in candidates.iter().enumerate() {
            let score = jaro_winkler(&query, &item.name_lower);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((index, score));
            }
        }
        best.filter(|(_, score)| *score >= self.threshold)
    }
}

/// First pass: case-folded exact, then prefix, then substring, then
/// token-overlap count. First hit at the best tier wins; ties resolve to
/// dictionary order.
pub fn substring_match<'a>(items: &'a [ItemRecord], query: &str) -> Option<&'a ItemRecord> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }
    if let Some(hit) = items.iter().find(|item| item.name_lower == query) {
        return Some(hit);
    }
    if let Some(hit) = items.iter().find(|item| {
        item.name_lower.starts_with(&query) || query.starts_with(&item.name_lower)
    }) {
        return Some(hit);
    }
    if let Some(hit) = items.iter().find(|item| {
        item.name_lower.contains(&query) || query.contains(&item.name_lower)
    }) {
        return Some(hit);
    }

    let mut best: Option<(&ItemRecord, usize)> = None;
    for item in items {
        let overlap = query
            .split_whitespace()
            .filter(|word| item.name_lower.contains(*word))
            .count();
        if overlap > 0 && best.map_or(true, |(_, count)| overlap > count) {
            best = Some((item, overlap));
        }
    }
    best.map(|(item, _)| item)
}

/// Two-tier lookup: the substring pass always runs; the similarity pass is
/// lazily constructed and consulted only on a tolerant search, over a
/// first-character bucket of the candidates.
pub struct FuzzyMatcher {
    similarity: OnceLock<Arc<dyn SimilaritySearch>>,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzyMatcher {
    pub fn new() -> Self {
        Self {
            similarity: OnceLock::new(),
        }
    }

    pub fn with_similarity(search: Arc<dyn SimilaritySearch>) -> Self {
        let matcher = Self::new();
        let _ = matcher.similarity.set(search);
        matcher
    }

    pub fn find<'a>(
        &self,
        items: &'a [ItemRecord],
        query: &str,
        tolerant: bool,
    ) -> Option<&'a ItemRecord> {
        if let Some(hit) = substring_match(items, query) {
            return Some(hit);
        }
        if !tolerant {
            return None;
        }

        let query = query.trim().to_lowercase();
        let first = query.chars().next()?;
        let bucket: Vec<&ItemRecord> = items
            .iter()
            .filter(|item| item.name_lower.starts_with(first))
            .collect();
        let candidates: Vec<&ItemRecord> = if bucket.len() < SMALL_BUCKET {
            items.iter().collect()
        } else {
            bucket
        };

        let search = self
            .similarity
            .get_or_init(|| Arc::new(JaroWinklerSearch::default()));
        search
            .search(&query, &candidates)
            .map(|(index, _)| candidates[index])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub category: String,
    pub sub_category: String,
}

/// Outcome of a suggestion request. `learn` is present only on a miss; the
/// caller invokes it once a human has confirmed a classification, so the
/// dictionary learns the final answer rather than the machine's guess.
pub struct SuggestOutcome {
    pub suggestion: Option<Suggestion>,
    pub learn: Option<PendingLearn>,
}

/// Deferred write-side learning for one free-text description.
pub struct PendingLearn {
    dictionary: Arc<ItemDictionary>,
    details: String,
}

impl PendingLearn {
    /// Persist the confirmed mapping: id slugified from the description
    /// (random when the slug is unusable), remote write best-effort, local
    /// cache merged, change event broadcast.
    pub async fn commit(
        self,
        category: &str,
        sub_category: &str,
    ) -> anyhow::Result<ItemRecord> {
        let id = slugify(&self.details).unwrap_or_else(|| Uuid::new_v4().to_string());
        let item = ItemRecord::new(id, self.details.as_str(), category, sub_category);
        self.dictionary.learn(item).await
    }
}

fn slugify(input: &str) -> Option<String> {
    let slug: String = input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    (slug.len() >= 2).then_some(slug)
}

/// Read-side suggestion composed with decoupled write-side learning.
pub struct AutoCategorizer {
    dictionary: Arc<ItemDictionary>,
    matcher: FuzzyMatcher,
}

impl AutoCategorizer {
    pub fn new(dictionary: Arc<ItemDictionary>) -> Self {
        Self {
            dictionary,
            matcher: FuzzyMatcher::new(),
        }
    }

    pub fn with_matcher(dictionary: Arc<ItemDictionary>, matcher: FuzzyMatcher) -> Self {
        Self { dictionary, matcher }
    }

    /// Suggest a classification for free-text input. On a hit the item is
    /// marked used and its classification returned, unless it matches what
    /// the caller already has selected. On a miss the caller gets a
    /// [`PendingLearn`] to invoke after human confirmation. `tolerant`
    /// additionally enables the similarity pass.
    pub async fn suggest(
        &self,
        details: &str,
        current_category: &str,
        current_sub_category: &str,
        tolerant: bool,
    ) -> anyhow::Result<SuggestOutcome> {
        let details = details.trim();
        if details.is_empty() {
            return Ok(SuggestOutcome {
                suggestion: None,
                learn: None,
            });
        }

        let items = self.dictionary.ensure_loaded().await?;
        if let Some(hit) = self.matcher.find(&items, details, tolerant) {
            let (id, category, sub_category) =
                (hit.id.clone(), hit.category.clone(), hit.sub_category.clone());
            if let Err(err) = self.dictionary.mark_used(&id).await {
                warn!(item_id = %id, error = %err, "usage mark failed");
            }
            let suggestion = (category != current_category
                || sub_category != current_sub_category)
                .then_some(Suggestion {
                    category,
                    sub_category,
                });
            return Ok(SuggestOutcome {
                suggestion,
                learn: None,
            });
        }

        Ok(SuggestOutcome {
            suggestion: None,
            learn: Some(PendingLearn {
                dictionary: Arc::clone(&self.dictionary),
                details: details.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sitecost_storage::{
        legacy_record_path, nested_record_path, MemoryLocalStore, MemoryRecordStore,
    };
    use std::time::Duration as StdDuration;

    fn record_doc(id: &str, project_id: &str, date_paid: &str, amount: f64) -> JsonValue {
        json!({
            "id": id,
            "projectId": project_id,
            "yyyyMM": "",
            "category": "Materials",
            "subCategory": "Hardware Materials",
            "amount": amount,
            "datePaid": date_paid,
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        })
    }

    async fn settle() {
        tokio::time::sleep(StdDuration::from_millis(60)).await;
    }

    fn collector() -> (Arc<StdMutex<Vec<Snapshot>>>, impl Fn(&Snapshot) + Send + Sync) {
        let seen: Arc<StdMutex<Vec<Snapshot>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |snapshot: &Snapshot| {
            sink.lock().expect("collector lock").push(snapshot.clone())
        })
    }

    #[tokio::test]
    async fn concurrent_subscribers_share_one_remote_subscription() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        let subs: Vec<CacheSubscription> =
            (0..3).map(|_| cache.subscribe("proj-7", |_| {})).collect();
        settle().await;
        assert_eq!(store.subscribe_call_count().await, 1);
        assert_eq!(store.live_subscription_count().await, 1);

        drop(subs);
        settle().await;
        assert_eq!(store.live_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn unresolvable_scope_yields_inert_guard_and_empty_snapshot() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        let guard = cache.subscribe("   ", |_| {});
        assert!(!guard.is_attached());
        assert_eq!(store.subscribe_call_count().await, 0);

        let snapshot = cache.get("");
        assert!(snapshot.records.is_empty());
        assert!(!snapshot.loading);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn pushes_fan_out_and_stop_after_unsubscribe() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        let (seen_a, listener_a) = collector();
        let (seen_b, listener_b) = collector();
        let guard_a = cache.subscribe("proj-7", listener_a);
        let guard_b = cache.subscribe("proj-7", listener_b);
        settle().await;

        for (id, day) in [("r1", 20), ("r2", 5), ("r3", 12)] {
            store
                .upsert(
                    &legacy_record_path("202603", id),
                    record_doc(id, "proj-7", &format!("2026-03-{day:02}T00:00:00Z"), 10.0),
                )
                .await
                .expect("upsert");
        }
        settle().await;

        let last_a = seen_a.lock().expect("lock").last().cloned().expect("push seen");
        let last_b = seen_b.lock().expect("lock").last().cloned().expect("push seen");
        let ids_a: Vec<&str> = last_a.records.iter().map(|r| r.id.as_str()).collect();
        let ids_b: Vec<&str> = last_b.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids_a, vec!["r2", "r3", "r1"]); // payment-date order
        assert_eq!(ids_a, ids_b);

        drop(guard_a);
        let count_a = seen_a.lock().expect("lock").len();
        store
            .upsert(
                &legacy_record_path("202603", "r4"),
                record_doc("r4", "proj-7", "2026-03-25T00:00:00Z", 10.0),
            )
            .await
            .expect("upsert");
        settle().await;

        assert_eq!(seen_a.lock().expect("lock").len(), count_a);
        let last_b = seen_b.lock().expect("lock").last().cloned().expect("push seen");
        assert_eq!(last_b.records.len(), 4);
        assert_eq!(store.live_subscription_count().await, 1);

        drop(guard_b);
        settle().await;
        assert_eq!(store.live_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn invalidate_gives_read_your_writes() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        store
            .upsert(
                &legacy_record_path("202603", "r1"),
                record_doc("r1", "proj-7", "2026-03-02T00:00:00Z", 42.0),
            )
            .await
            .expect("upsert");

        cache.invalidate("proj-7").await.expect("invalidate");
        let snapshot = cache.get("proj-7");
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].amount, 42.0);
        assert!(!snapshot.loading);

        assert!(cache.invalidate("").await.is_err());
        assert!(cache.refetch("  ").await.is_err());
    }

    #[tokio::test]
    async fn refetch_failure_preserves_cached_data() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        store
            .upsert(
                &legacy_record_path("202603", "r1"),
                record_doc("r1", "proj-7", "2026-03-02T00:00:00Z", 42.0),
            )
            .await
            .expect("upsert");
        cache.refetch("proj-7").await.expect("warm refetch");

        store.set_fail_fetches(true).await;
        assert!(cache.refetch("proj-7").await.is_err());

        let snapshot = cache.get("proj-7");
        assert_eq!(snapshot.records.len(), 1);
        assert!(snapshot.error.as_deref().unwrap_or("").contains("transport"));
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn malformed_documents_are_isolated() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        store
            .upsert(
                &legacy_record_path("202603", "good-1"),
                record_doc("good-1", "proj-7", "2026-03-02T00:00:00Z", 10.0),
            )
            .await
            .expect("upsert");
        store
            .upsert(
                &legacy_record_path("202603", "bad"),
                json!({"projectId": "proj-7", "category": "Materials", "amount": -1.0}),
            )
            .await
            .expect("upsert");
        store
            .upsert(
                &legacy_record_path("202603", "good-2"),
                record_doc("good-2", "proj-7", "2026-03-09T00:00:00Z", 20.0),
            )
            .await
            .expect("upsert");

        cache.refetch("proj-7").await.expect("refetch");
        let snapshot = cache.get("proj-7");
        assert_eq!(snapshot.records.len(), 2);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn nested_layout_is_preferred_over_legacy() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        store
            .upsert(
                &legacy_record_path("202603", "legacy-1"),
                record_doc("legacy-1", "proj-7", "2026-03-02T00:00:00Z", 1.0),
            )
            .await
            .expect("upsert");
        cache.refetch("proj-7").await.expect("refetch");
        assert_eq!(cache.get("proj-7").records.len(), 1);

        store
            .upsert(
                &nested_record_path("acme", "proj-7", "202603", "nested-1"),
                record_doc("nested-1", "proj-7", "2026-03-05T00:00:00Z", 2.0),
            )
            .await
            .expect("upsert");
        cache.refetch("proj-7").await.expect("refetch");

        let snapshot = cache.get("proj-7");
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].id, "nested-1");
    }

    #[tokio::test]
    async fn concurrent_refetches_share_one_read() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());
        store.set_fetch_delay(StdDuration::from_millis(40)).await;

        let (first, second) = tokio::join!(cache.refetch("proj-7"), cache.refetch("proj-7"));
        first.expect("first refetch");
        second.expect("second refetch");
        assert_eq!(store.fetch_call_count().await, 1);
    }

    #[tokio::test]
    async fn subscription_error_keeps_stale_data() {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = ExpenseCache::new(store.clone());

        store
            .upsert(
                &legacy_record_path("202603", "r1"),
                record_doc("r1", "proj-7", "2026-03-02T00:00:00Z", 10.0),
            )
            .await
            .expect("upsert");

        let (seen, listener) = collector();
        let _guard = cache.subscribe("proj-7", listener);
        settle().await;

        store.emit_subscription_error("proj-7", "connection reset").await;
        settle().await;

        let snapshot = cache.get("proj-7");
        assert_eq!(snapshot.error.as_deref(), Some("connection reset"));
        assert_eq!(snapshot.records.len(), 1);
        let last = seen.lock().expect("lock").last().cloned().expect("error push");
        assert!(last.error.is_some());
    }

    fn aged_item(id: &str, name: &str, days_old: i64) -> ItemRecord {
        let mut item = ItemRecord::new(id, name, "Materials", "Hardware Materials");
        item.created_at = Utc::now() - Duration::days(days_old + 30);
        item.last_used_at = Some(Utc::now() - Duration::days(days_old));
        item
    }

    fn dictionary_over(store: Arc<MemoryRecordStore>) -> Arc<ItemDictionary> {
        Arc::new(ItemDictionary::new(
            store,
            Arc::new(MemoryLocalStore::new()),
            DictionaryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn retention_sweep_drops_only_expired_items() {
        let store = Arc::new(MemoryRecordStore::new());
        let dictionary = dictionary_over(store.clone());
        let mut events = dictionary.subscribe_changes();

        dictionary
            .save(vec![aged_item("old", "rusted rebar", 91), aged_item("fresh", "cement bags", 89)])
            .await
            .expect("save");

        assert!(dictionary.run_maintenance().await.expect("maintenance"));
        let items = dictionary.load_local().await.expect("load").expect("cached");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "fresh");

        let mut saw_pruned = false;
        while let Ok(event) = events.try_recv() {
            saw_pruned |= event == DictionaryEvent::Pruned;
        }
        assert!(saw_pruned);

        // Second run inside the interval is gated off by the stamp.
        assert!(!dictionary.run_maintenance().await.expect("maintenance"));
    }

    #[tokio::test]
    async fn maintenance_pushes_usage_stamps_upstream() {
        let store = Arc::new(MemoryRecordStore::new());
        let dictionary = dictionary_over(store.clone());

        dictionary
            .save(vec![aged_item("cement-bags", "cement bags", 10)])
            .await
            .expect("save");
        assert!(dictionary.run_maintenance().await.expect("maintenance"));

        let doc = store
            .get(&item_path("cement-bags"))
            .await
            .expect("get")
            .expect("remote stamp written");
        assert!(doc.data.get("lastUsedAt").is_some());
    }

    #[tokio::test]
    async fn mark_used_updates_local_and_remote() {
        let store = Arc::new(MemoryRecordStore::new());
        let dictionary = dictionary_over(store.clone());

        dictionary
            .save(vec![ItemRecord::new("it1", "cement bags", "Materials", "Hardware Materials")])
            .await
            .expect("save");
        dictionary.mark_used("it1").await.expect("mark used");

        let items = dictionary.ensure_loaded().await.expect("load");
        assert!(items[0].last_used_at.is_some());
        let doc = store.get(&item_path("it1")).await.expect("get").expect("doc");
        assert!(doc.data.get("lastUsedAt").is_some());
    }

    #[tokio::test]
    async fn dictionary_survives_process_restart_via_file_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryRecordStore::new());
        let local: Arc<dyn LocalStore> = Arc::new(
            sitecost_storage::FileLocalStore::open(dir.path())
                .await
                .expect("open"),
        );

        let first = ItemDictionary::new(store.clone(), Arc::clone(&local), DictionaryConfig::default());
        first
            .save(vec![ItemRecord::new("it1", "cement bags", "Materials", "Hardware Materials")])
            .await
            .expect("save");
        drop(first);

        // A fresh instance over the same directory sees the saved catalog
        // without touching the remote store.
        let second = ItemDictionary::new(store.clone(), local, DictionaryConfig::default());
        let items = second.load_local().await.expect("load").expect("persisted");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "it1");
        assert_eq!(store.fetch_call_count().await, 0);
    }

    #[tokio::test]
    async fn ensure_loaded_seeds_from_remote_once() {
        let store = Arc::new(MemoryRecordStore::new());
        let item = ItemRecord::new("it1", "cement bags", "Materials", "Hardware Materials");
        store
            .upsert(&item_path("it1"), serde_json::to_value(&item).expect("json"))
            .await
            .expect("upsert");

        let dictionary = dictionary_over(store.clone());
        let items = dictionary.ensure_loaded().await.expect("load");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name_lower, "cement bags");
        // Seeded into the durable local copy as well.
        assert!(dictionary.load_local().await.expect("load").is_some());
    }

    #[test]
    fn substring_tiers_rank_exact_prefix_substring_overlap() {
        let items = vec![
            ItemRecord::new("a", "cement bags extra", "Materials", "Bulk"),
            ItemRecord::new("b", "cement bags", "Materials", "Hardware Materials"),
            ItemRecord::new("c", "bags", "Packaging", "Misc"),
        ];

        assert_eq!(substring_match(&items, "Cement Bags").expect("hit").id, "b");
        assert_eq!(substring_match(&items, "cement bags ex").expect("hit").id, "a");
        assert_eq!(substring_match(&items, "ment ba").expect("hit").id, "a");
        // Token overlap: neither name contains the full query string.
        assert_eq!(substring_match(&items, "bags cement strong").expect("hit").id, "a");
        assert!(substring_match(&items, "steel rods").is_none());
        assert!(substring_match(&items, "   ").is_none());
    }

    #[test]
    fn tolerant_pass_catches_typos_below_exact_tiers() {
        let items = vec![
            ItemRecord::new("a", "cement bags", "Materials", "Hardware Materials"),
            ItemRecord::new("b", "steel rods", "Materials", "Steel"),
        ];
        let matcher = FuzzyMatcher::new();

        assert!(matcher.find(&items, "cemnt bgs", false).is_none());
        assert_eq!(matcher.find(&items, "cemnt bgs", true).expect("hit").id, "a");
        assert!(matcher.find(&items, "plumbing fixtures", true).is_none());
    }

    #[tokio::test]
    async fn learning_round_trip() {
        let store = Arc::new(MemoryRecordStore::new());
        let dictionary = dictionary_over(store.clone());
        let categorizer = AutoCategorizer::new(Arc::clone(&dictionary));

        let outcome = categorizer
            .suggest("Acme Cement 50kg", "", "", false)
            .await
            .expect("suggest");
        assert!(outcome.suggestion.is_none());
        let learn = outcome.learn.expect("pending learn");

        let item = learn
            .commit("Materials", "Hardware Materials")
            .await
            .expect("commit");
        assert_eq!(item.id, "acme-cement-50kg");
        assert!(store.get(&item_path(&item.id)).await.expect("get").is_some());

        let outcome = categorizer
            .suggest("acme cement", "", "", false)
            .await
            .expect("suggest");
        let suggestion = outcome.suggestion.expect("learned suggestion");
        assert_eq!(suggestion.category, "Materials");
        assert_eq!(suggestion.sub_category, "Hardware Materials");
        assert!(outcome.learn.is_none());
    }

    #[tokio::test]
    async fn suggestion_suppressed_when_already_selected() {
        let store = Arc::new(MemoryRecordStore::new());
        let dictionary = dictionary_over(store.clone());
        dictionary
            .save(vec![ItemRecord::new("it1", "cement bags", "Materials", "Hardware Materials")])
            .await
            .expect("save");
        let categorizer = AutoCategorizer::new(Arc::clone(&dictionary));

        let outcome = categorizer
            .suggest("cement bags", "Materials", "Hardware Materials", false)
            .await
            .expect("suggest");
        assert!(outcome.suggestion.is_none());
        assert!(outcome.learn.is_none()); // hit: nothing to learn

        // Usage still recorded on the suppressed hit.
        let items = dictionary.ensure_loaded().await.expect("load");
        assert!(items[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn empty_details_suggest_nothing_and_learn_nothing() {
        let store = Arc::new(MemoryRecordStore::new());
        let categorizer = AutoCategorizer::new(dictionary_over(store));
        let outcome = categorizer.suggest("   ", "", "", true).await.expect("suggest");
        assert!(outcome.suggestion.is_none());
        assert!(outcome.learn.is_none());
    }

    #[tokio::test]
    async fn unusable_slug_falls_back_to_random_id() {
        let store = Arc::new(MemoryRecordStore::new());
        let dictionary = dictionary_over(store.clone());
        let categorizer = AutoCategorizer::new(Arc::clone(&dictionary));

        let outcome = categorizer.suggest("##", "", "", false).await.expect("suggest");
        let item = outcome
            .learn
            .expect("pending learn")
            .commit("Misc", "Other")
            .await
            .expect("commit");
        assert!(Uuid::parse_str(&item.id).is_ok());
    }

    #[test]
    fn slugify_collapses_and_rejects_unusable_input() {
        assert_eq!(slugify("Acme Cement 50kg"), Some("acme-cement-50kg".to_string()));
        assert_eq!(slugify("  A--B  "), Some("a-b".to_string()));
        assert_eq!(slugify("#!"), None);
    }

    #[test]
    fn dictionary_config_defaults() {
        let config = DictionaryConfig::default();
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.maintenance_interval_days, 7);
    }
}
