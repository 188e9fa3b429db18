//! Test utilities for the client crate.
//!
//! Shared doubles for unit tests (in `src/`) and integration tests (in
//! `tests/`). Compiled for tests and with the `test-support` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use mockable::Clock;
use serde_json::{Map, Value, json};

use crate::domain::ports::{
    ChangeBatch, ChangeFeedSource, ChangeRecord, DocumentStore, DocumentStoreError, FeedName,
    IdentityProvider, IdentityProviderError, LocalChange, ProfileDirectory, RemoteCallError,
    RemoteDocumentStore, RemoteInfo, ReplicatedWrite, TenantDirectory, TokenRequest,
};
use crate::domain::{
    Document, DocumentId, IdentityToken, KeyRange, Revision, Sleeper, TenantId, UserKey,
};
use crate::outbound::persistence::{MemoryDocumentStore, ROADY_PARTITION, SqliteDocumentStore};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fixed instant used as "now" across tests.
pub fn fixed_now() -> DateTime<Utc> {
    match Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0) {
        chrono::LocalResult::Single(now) => now,
        _ => panic!("fixed test instant is valid"),
    }
}

/// SQLite store in a fresh temporary directory, bound to the `roady`
/// partition. The directory lives as long as the returned guard.
///
/// # Panics
///
/// When the directory or database cannot be created.
pub fn temp_sqlite_store() -> (tempfile::TempDir, SqliteDocumentStore) {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(error) => panic!("temporary directory: {error}"),
    };
    match SqliteDocumentStore::open(&dir.path().join("roady.sqlite3"), ROADY_PARTITION) {
        Ok(store) => (dir, store),
        Err(error) => panic!("sqlite store opens: {error}"),
    }
}

/// Unwrap a JSON object literal.
///
/// # Panics
///
/// When `value` is not an object.
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Three-part token with the given payload and a dummy signature.
pub fn unsigned_token(payload: &Value) -> IdentityToken {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    IdentityToken::new(format!("{header}.{body}.signature"))
}

/// Settable clock.
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    /// Clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    /// Move the clock forward.
    pub fn advance(&self, delta: Duration) {
        let delta = match TimeDelta::from_std(delta) {
            Ok(delta) => delta,
            Err(error) => {
                panic!("failed to convert Duration to TimeDelta: {error}; delta={delta:?}")
            }
        };
        *locked(&self.0) += delta;
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *locked(&self.0)
    }
}

/// Sleeper that returns at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateSleeper;

#[async_trait]
impl Sleeper for ImmediateSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Sleeper that records requested delays and returns at once.
#[derive(Default)]
pub struct RecordingSleeper(Mutex<Vec<Duration>>);

impl RecordingSleeper {
    /// Delays requested so far.
    pub fn recorded(&self) -> Vec<Duration> {
        locked(&self.0).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        locked(&self.0).push(duration);
    }
}

/// Identity provider with a current token and a queue of reissued tokens.
///
/// A forced refresh pops the next queued token and makes it current; with an
/// empty queue the current token is returned again.
#[derive(Default)]
pub struct FakeIdentityProvider {
    current: Mutex<Option<IdentityToken>>,
    reissued: Mutex<VecDeque<IdentityToken>>,
    refreshes: AtomicUsize,
}

impl FakeIdentityProvider {
    /// Signed in with `payload` as the token claims.
    pub fn signed_in(payload: &Value) -> Self {
        let provider = Self::default();
        *locked(&provider.current) = Some(unsigned_token(payload));
        provider
    }

    /// No session.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Queue a token that the next forced refresh returns.
    #[must_use]
    pub fn then_reissue(self, payload: &Value) -> Self {
        locked(&self.reissued).push_back(unsigned_token(payload));
        self
    }

    /// Forced refreshes so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn signed_token(
        &self,
        request: TokenRequest,
    ) -> Result<Option<IdentityToken>, IdentityProviderError> {
        if request == TokenRequest::ForceRefresh {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = locked(&self.reissued).pop_front() {
                *locked(&self.current) = Some(next);
            }
        }
        Ok(locked(&self.current).clone())
    }

    fn user_identifier(&self) -> Option<String> {
        locked(&self.current)
            .as_ref()
            .and_then(|token| token.claims().ok())
            .and_then(|claims| claims.subject)
    }
}

fn offline() -> RemoteCallError {
    RemoteCallError::transport("connection refused")
}

/// Remote `/__users` and `/choose-tenant` endpoints held in memory.
pub struct FakeProfileDirectory {
    online: AtomicBool,
    profiles: Mutex<HashMap<String, Map<String, Value>>>,
    updates: Mutex<Vec<(String, TenantId)>>,
    chosen: Mutex<Vec<TenantId>>,
    fetches: AtomicUsize,
}

impl Default for FakeProfileDirectory {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
            profiles: Mutex::default(),
            updates: Mutex::default(),
            chosen: Mutex::default(),
            fetches: AtomicUsize::new(0),
        }
    }
}

impl FakeProfileDirectory {
    /// Online directory without profiles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the remote profile of `user_key`.
    #[must_use]
    pub fn with_profile(self, user_key: &UserKey, body: Value) -> Self {
        locked(&self.profiles).insert(user_key.as_str().to_owned(), object(body));
        self
    }

    /// Toggle reachability.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Successful `PUT /__users/{key}` calls.
    pub fn updates(&self) -> Vec<(String, TenantId)> {
        locked(&self.updates).clone()
    }

    /// Successful `POST /choose-tenant` calls.
    pub fn chosen(&self) -> Vec<TenantId> {
        locked(&self.chosen).clone()
    }

    /// Profile fetch attempts.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Remote active-tenant pointer of `user_key`.
    pub fn remote_active_tenant(&self, user_key: &UserKey) -> Option<String> {
        locked(&self.profiles)
            .get(user_key.as_str())
            .and_then(|profile| profile.get("active_tenant_id"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    fn ensure_online(&self) -> Result<(), RemoteCallError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(offline())
        }
    }
}

#[async_trait]
impl ProfileDirectory for FakeProfileDirectory {
    async fn fetch_profile(
        &self,
        user_key: &UserKey,
    ) -> Result<Option<Map<String, Value>>, RemoteCallError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        Ok(locked(&self.profiles).get(user_key.as_str()).cloned())
    }

    async fn update_active_tenant(
        &self,
        user_key: &UserKey,
        tenant: &TenantId,
    ) -> Result<(), RemoteCallError> {
        self.ensure_online()?;
        locked(&self.profiles)
            .entry(user_key.as_str().to_owned())
            .or_insert_with(|| object(json!({ "type": "user" })))
            .insert("active_tenant_id".to_owned(), Value::from(tenant.as_str()));
        locked(&self.updates).push((user_key.as_str().to_owned(), tenant.clone()));
        Ok(())
    }

    async fn choose_tenant(&self, tenant: &TenantId) -> Result<(), RemoteCallError> {
        self.ensure_online()?;
        locked(&self.chosen).push(tenant.clone());
        Ok(())
    }
}

/// Remote `/__tenants` endpoint held in memory.
pub struct FakeTenantDirectory {
    online: AtomicBool,
    tenants: Mutex<Vec<Map<String, Value>>>,
    calls: AtomicUsize,
}

impl FakeTenantDirectory {
    /// Online directory listing `tenants`.
    pub fn new(tenants: Vec<Value>) -> Self {
        Self {
            online: AtomicBool::new(true),
            tenants: Mutex::new(tenants.into_iter().map(object).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Toggle reachability.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Replace the listed tenants.
    pub fn set_tenants(&self, tenants: Vec<Value>) {
        *locked(&self.tenants) = tenants.into_iter().map(object).collect();
    }

    /// Listing attempts.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantDirectory for FakeTenantDirectory {
    async fn list_tenants(&self) -> Result<Vec<Map<String, Value>>, RemoteCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(offline());
        }
        Ok(locked(&self.tenants).clone())
    }
}

/// Change feeds answering from per-feed scripts.
///
/// Each fetch pops the next scripted response for its feed; an exhausted
/// script answers with an empty batch.
#[derive(Default)]
pub struct FakeChangeFeed {
    scripts: Mutex<HashMap<FeedName, VecDeque<Result<ChangeBatch, RemoteCallError>>>>,
    requests: Mutex<Vec<(FeedName, u64)>>,
}

impl FakeChangeFeed {
    /// Feeds with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch for `feed`.
    pub fn push_batch(&self, feed: FeedName, batch: ChangeBatch) {
        locked(&self.scripts)
            .entry(feed)
            .or_default()
            .push_back(Ok(batch));
    }

    /// Queue a failure for `feed`.
    pub fn push_failure(&self, feed: FeedName, error: RemoteCallError) {
        locked(&self.scripts)
            .entry(feed)
            .or_default()
            .push_back(Err(error));
    }

    /// `(feed, since)` of every fetch so far.
    pub fn requests(&self) -> Vec<(FeedName, u64)> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl ChangeFeedSource for FakeChangeFeed {
    async fn fetch_changes(
        &self,
        feed: FeedName,
        since: u64,
    ) -> Result<ChangeBatch, RemoteCallError> {
        locked(&self.requests).push((feed, since));
        locked(&self.scripts)
            .get_mut(&feed)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(ChangeBatch::default()))
    }
}

/// Change carrying a document.
pub fn change(sequence: u64, doc: Value) -> ChangeRecord {
    let doc = object(doc);
    ChangeRecord {
        sequence,
        id: doc.get("_id").and_then(Value::as_str).map(str::to_owned),
        deleted: false,
        doc: Some(doc),
    }
}

/// Deletion change for `id`.
pub fn deletion(sequence: u64, id: &str) -> ChangeRecord {
    ChangeRecord {
        sequence,
        id: Some(id.to_owned()),
        deleted: true,
        doc: None,
    }
}

/// Batch of changes with an optional feed-reported last sequence.
pub fn batch(results: Vec<ChangeRecord>, last_sequence: Option<u64>) -> ChangeBatch {
    ChangeBatch {
        results,
        last_sequence,
    }
}

/// Store wrapper that injects write conflicts and failures.
pub struct FaultInjectingStore<S> {
    inner: S,
    conflicts_left: AtomicUsize,
    failing_ids: Mutex<Vec<String>>,
    puts: AtomicUsize,
}

impl<S: DocumentStore> FaultInjectingStore<S> {
    /// Pass-through wrapper.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            conflicts_left: AtomicUsize::new(0),
            failing_ids: Mutex::default(),
            puts: AtomicUsize::new(0),
        }
    }

    /// Report a conflict for the next `count` writes.
    #[must_use]
    pub fn with_conflicts(self, count: usize) -> Self {
        self.conflicts_left.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every write to `id` with a storage error.
    #[must_use]
    pub fn fail_writes_to(self, id: &str) -> Self {
        locked(&self.failing_ids).push(id.to_owned());
        self
    }

    /// Stop failing writes.
    pub fn heal(&self) {
        locked(&self.failing_ids).clear();
        self.conflicts_left.store(0, Ordering::SeqCst);
    }

    /// `put` calls observed, including injected failures.
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn injected_failure(&self, id: &DocumentId) -> Option<DocumentStoreError> {
        if locked(&self.failing_ids)
            .iter()
            .any(|failing| failing == id.as_str())
        {
            return Some(DocumentStoreError::storage("injected write failure"));
        }
        let claimed = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        claimed.then(|| DocumentStoreError::conflict(id.as_str()))
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for FaultInjectingStore<S> {
    async fn get(&self, id: &DocumentId) -> Result<Document, DocumentStoreError> {
        self.inner.get(id).await
    }

    async fn put(&self, document: &Document) -> Result<Revision, DocumentStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.injected_failure(&document.id) {
            return Err(error);
        }
        self.inner.put(document).await
    }

    async fn scan_page(
        &self,
        range: &KeyRange,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        self.inner.scan_page(range, after, limit).await
    }

    async fn changes_since(
        &self,
        sequence: u64,
        limit: usize,
    ) -> Result<Vec<LocalChange>, DocumentStoreError> {
        self.inner.changes_since(sequence, limit).await
    }

    async fn apply_replicated(
        &self,
        document: &Document,
    ) -> Result<ReplicatedWrite, DocumentStoreError> {
        if let Some(error) = self.injected_failure(&document.id) {
            return Err(error);
        }
        self.inner.apply_replicated(document).await
    }
}

/// Replication target backed by an in-memory store.
pub struct FakeRemoteDocumentStore {
    database: String,
    store: MemoryDocumentStore,
    reachable: AtomicBool,
    denied: AtomicBool,
    bulk_writes: AtomicUsize,
}

impl FakeRemoteDocumentStore {
    /// Reachable, authorised remote database.
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_owned(),
            store: MemoryDocumentStore::new(),
            reachable: AtomicBool::new(true),
            denied: AtomicBool::new(false),
            bulk_writes: AtomicUsize::new(0),
        }
    }

    /// Toggle reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Reject every request as unauthorised.
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Remote contents.
    pub fn store(&self) -> &MemoryDocumentStore {
        &self.store
    }

    /// Non-empty bulk writes received.
    pub fn bulk_write_count(&self) -> usize {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    fn check_access(&self) -> Result<(), RemoteCallError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(RemoteCallError::unauthorized("status 401"));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(offline());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteDocumentStore for FakeRemoteDocumentStore {
    async fn info(&self) -> Result<RemoteInfo, RemoteCallError> {
        self.check_access()?;
        let update_sequence = self
            .store
            .changes_since(0, usize::MAX)
            .await
            .map_err(|error| RemoteCallError::status(500_u16, error.to_string()))?
            .last()
            .map(|change| change.sequence);
        Ok(RemoteInfo {
            database: self.database.clone(),
            update_sequence,
        })
    }

    async fn changes_since(
        &self,
        since: u64,
        limit: usize,
    ) -> Result<ChangeBatch, RemoteCallError> {
        self.check_access()?;
        let changes = self
            .store
            .changes_since(since, limit)
            .await
            .map_err(|error| RemoteCallError::status(500_u16, error.to_string()))?;
        let last_sequence = changes.last().map(|change| change.sequence);
        let results = changes
            .into_iter()
            .map(|LocalChange { sequence, document }| ChangeRecord {
                sequence,
                id: Some(document.id.to_string()),
                deleted: false,
                doc: match document.to_json() {
                    Value::Object(doc) => Some(doc),
                    _ => None,
                },
            })
            .collect();
        Ok(ChangeBatch {
            results,
            last_sequence,
        })
    }

    async fn bulk_write(&self, documents: &[Document]) -> Result<(), RemoteCallError> {
        self.check_access()?;
        if documents.is_empty() {
            return Ok(());
        }
        self.bulk_writes.fetch_add(1, Ordering::SeqCst);
        for document in documents {
            self.store
                .apply_replicated(document)
                .await
                .map_err(|error| RemoteCallError::status(500_u16, error.to_string()))?;
        }
        Ok(())
    }
}
