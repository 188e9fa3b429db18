//! Business-document replication between the local store and the remote
//! database.
//!
//! A replication session pulls remote changes into the local store, pushes
//! local writes to the remote, and in live mode repeats forever with capped
//! exponential backoff after failures. Tenant and profile documents are left
//! to the change feeds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::Error;
use super::document::Document;
use super::ports::{
    ChangeRecord, DocumentStore, RemoteCallError, RemoteDocumentStore, ReplicatedWrite,
};
use super::retry::RetryPolicy;

/// Documents per page in either direction.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Pause between live cycles once caught up.
pub const DEFAULT_LIVE_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 128;

/// Replication status as seen by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// Not running.
    Idle,
    /// Moving documents.
    Active,
    /// Caught up, waiting for more work.
    Paused,
    /// The last attempt failed; retrying in the background.
    Error,
    /// A one-off pass finished.
    Complete,
}

/// Which way documents moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

/// Observable replication events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// Documents moved.
    Change {
        /// Direction of the move.
        direction: Direction,
        /// Documents in the page.
        count: usize,
    },
    /// Caught up, or stalled with the given error.
    Paused {
        /// Failure that stalled the session, if any.
        error: Option<String>,
    },
    /// Work resumed.
    Active,
    /// The remote rejected the credentials.
    Denied {
        /// Remote message.
        message: String,
    },
    /// The remote could not be reached or failed.
    Error {
        /// Failure description.
        message: String,
    },
    /// A one-off pass finished.
    Complete,
}

/// Documents moved by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Remote documents applied locally.
    pub pulled: usize,
    /// Local documents sent to the remote.
    pub pushed: usize,
}

/// Tunables for [`ReplicationEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Page size for changes and bulk writes.
    pub batch_size: usize,
    /// Pause between live cycles when caught up.
    pub live_interval: Duration,
    /// Delay schedule after failed cycles; the attempt budget is ignored.
    pub backoff: RetryPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            live_interval: DEFAULT_LIVE_INTERVAL,
            backoff: RetryPolicy::exponential(
                u32::MAX,
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
        }
    }
}

/// Session-local progress. Pulled revisions are remembered so the push
/// direction does not echo them back.
#[derive(Debug, Default)]
struct Checkpoint {
    pulled: u64,
    pushed: u64,
    echoes: HashSet<(String, String)>,
}

fn revision_key(document: &Document) -> Option<(String, String)> {
    document
        .revision
        .as_ref()
        .map(|revision| (document.id.to_string(), revision.to_string()))
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ReplicationConfig,
    status: watch::Sender<ReplicationStatus>,
    events: broadcast::Sender<ReplicationEvent>,
    running: StdMutex<Option<Running>>,
}

/// Replicates business documents in both directions.
#[derive(Clone)]
pub struct ReplicationEngine {
    inner: Arc<Inner>,
}

impl ReplicationEngine {
    /// Idle engine.
    pub fn new(config: ReplicationConfig) -> Self {
        let (status, _) = watch::channel(ReplicationStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                status,
                events,
                running: StdMutex::new(None),
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> ReplicationStatus {
        *self.inner.status.borrow()
    }

    /// Observe status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ReplicationStatus> {
        self.inner.status.subscribe()
    }

    /// Receive replication events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.inner.events.subscribe()
    }

    /// Probe the remote, then start live replication in the background.
    ///
    /// Returns whether the probe succeeded. The live loop starts either way
    /// and keeps retrying until [`Self::stop`]. A running session is stopped
    /// first.
    pub async fn start(
        &self,
        local: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteDocumentStore>,
    ) -> bool {
        self.stop().await;
        let session = Uuid::new_v4();
        let span = info_span!("replication", %session);
        let reachable = self.probe(remote.as_ref()).instrument(span.clone()).await;

        let (stop, stop_rx) = watch::channel(false);
        let engine = self.clone();
        let handle = tokio::spawn(engine.run_live(local, remote, stop_rx).instrument(span));
        let mut running = match self.inner.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        };
        *running = Some(Running { stop, handle });
        reachable
    }

    /// Cancel the session, including any in-flight cycle, and return to
    /// [`ReplicationStatus::Idle`]. Safe to call repeatedly or before start.
    pub async fn stop(&self) {
        let running = match self.inner.running.lock() {
            Ok(mut running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(Running { stop, handle }) = running {
            stop.send_replace(true);
            if let Err(error) = handle.await {
                warn!(%error, "replication task ended abnormally");
            }
            info!("replication stopped");
        }
        self.inner.status.send_replace(ReplicationStatus::Idle);
    }

    /// One pull and push pass until both directions are caught up.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unauthorized`](super::ErrorCode::Unauthorized) when the
    /// remote denies access, [`ErrorCode::Unreachable`](super::ErrorCode::Unreachable)
    /// on transport failures, and storage errors from the local store.
    pub async fn replicate_once(
        &self,
        local: &dyn DocumentStore,
        remote: &dyn RemoteDocumentStore,
    ) -> Result<ReplicationSummary, Error> {
        if let Err(error) = remote.info().await {
            self.report_failure(&error);
            return Err(error.into());
        }
        let mut checkpoint = Checkpoint::default();
        match self.cycle(local, remote, &mut checkpoint).await {
            Ok(summary) => {
                self.transition(ReplicationStatus::Complete);
                self.emit(ReplicationEvent::Complete);
                info!(pulled = summary.pulled, pushed = summary.pushed, "replication pass complete");
                Ok(summary)
            }
            Err(failure) => {
                let error = self.report_cycle_failure(failure);
                Err(error)
            }
        }
    }

    async fn probe(&self, remote: &dyn RemoteDocumentStore) -> bool {
        match remote.info().await {
            Ok(info) => {
                info!(
                    database = %info.database,
                    update_sequence = ?info.update_sequence,
                    "replication target reachable"
                );
                true
            }
            Err(error) => {
                warn!(%error, "replication target unreachable; retrying in background");
                self.report_failure(&error);
                false
            }
        }
    }

    async fn run_live(
        self,
        local: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteDocumentStore>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut checkpoint = Checkpoint::default();
        let mut failures: u32 = 0;
        loop {
            let pause = tokio::select! {
                _ = stop.changed() => break,
                result = self.cycle(local.as_ref(), remote.as_ref(), &mut checkpoint) => {
                    match result {
                        Ok(_) => {
                            failures = 0;
                            if self.transition(ReplicationStatus::Paused) {
                                self.emit(ReplicationEvent::Paused { error: None });
                            }
                            self.inner.config.live_interval
                        }
                        Err(failure) => {
                            failures = failures.saturating_add(1);
                            let error = self.report_cycle_failure(failure);
                            let delay = self.inner.config.backoff.delay_after(failures);
                            debug!(%error, failures, delay_ms = delay.as_millis(), "backing off");
                            delay
                        }
                    }
                }
            };
            tokio::select! {
                _ = stop.changed() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn cycle(
        &self,
        local: &dyn DocumentStore,
        remote: &dyn RemoteDocumentStore,
        checkpoint: &mut Checkpoint,
    ) -> Result<ReplicationSummary, CycleFailure> {
        let pulled = self.pull(local, remote, checkpoint).await?;
        let pushed = self.push(local, remote, checkpoint).await?;
        Ok(ReplicationSummary { pulled, pushed })
    }

    async fn pull(
        &self,
        local: &dyn DocumentStore,
        remote: &dyn RemoteDocumentStore,
        checkpoint: &mut Checkpoint,
    ) -> Result<usize, CycleFailure> {
        let batch_size = self.inner.config.batch_size.max(1);
        let mut total = 0;
        loop {
            let batch = remote
                .changes_since(checkpoint.pulled, batch_size)
                .await
                .map_err(CycleFailure::Remote)?;
            let mut applied = 0;
            for change in &batch.results {
                let Some(document) = replicable_remote(change) else {
                    continue;
                };
                let write = local
                    .apply_replicated(&document)
                    .await
                    .map_err(|error| CycleFailure::Local(error.into()))?;
                if write == ReplicatedWrite::Applied {
                    applied += 1;
                    if let Some(key) = revision_key(&document) {
                        checkpoint.echoes.insert(key);
                    }
                }
            }
            let next = batch.highest_sequence().unwrap_or(checkpoint.pulled);
            let advanced = next > checkpoint.pulled;
            checkpoint.pulled = checkpoint.pulled.max(next);
            if applied > 0 {
                self.announce_change(Direction::Pull, applied);
                total += applied;
            }
            if !advanced || batch.results.len() < batch_size {
                return Ok(total);
            }
        }
    }

    async fn push(
        &self,
        local: &dyn DocumentStore,
        remote: &dyn RemoteDocumentStore,
        checkpoint: &mut Checkpoint,
    ) -> Result<usize, CycleFailure> {
        let batch_size = self.inner.config.batch_size.max(1);
        let mut total = 0;
        loop {
            let changes = local
                .changes_since(checkpoint.pushed, batch_size)
                .await
                .map_err(|error| CycleFailure::Local(error.into()))?;
            let Some(last) = changes.last().map(|change| change.sequence) else {
                return Ok(total);
            };
            let documents: Vec<Document> = changes
                .iter()
                .map(|change| &change.document)
                .filter(|document| is_replicable(document))
                .filter(|document| {
                    revision_key(document).is_none_or(|key| !checkpoint.echoes.remove(&key))
                })
                .cloned()
                .collect();
            if !documents.is_empty() {
                remote
                    .bulk_write(&documents)
                    .await
                    .map_err(CycleFailure::Remote)?;
                self.announce_change(Direction::Push, documents.len());
                total += documents.len();
            }
            checkpoint.pushed = checkpoint.pushed.max(last);
            if changes.len() < batch_size {
                return Ok(total);
            }
        }
    }

    fn announce_change(&self, direction: Direction, count: usize) {
        if self.transition(ReplicationStatus::Active) {
            self.emit(ReplicationEvent::Active);
        }
        debug!(?direction, count, "replicated documents");
        self.emit(ReplicationEvent::Change { direction, count });
    }

    fn report_cycle_failure(&self, failure: CycleFailure) -> Error {
        match failure {
            CycleFailure::Remote(error) => {
                self.report_failure(&error);
                error.into()
            }
            CycleFailure::Local(error) => {
                warn!(%error, "local store failed during replication");
                self.transition(ReplicationStatus::Error);
                self.emit(ReplicationEvent::Paused {
                    error: Some(error.to_string()),
                });
                error
            }
        }
    }

    fn report_failure(&self, error: &RemoteCallError) {
        self.transition(ReplicationStatus::Error);
        if error.is_auth_failure() {
            warn!(%error, "replication denied");
            self.emit(ReplicationEvent::Denied {
                message: error.to_string(),
            });
        } else {
            warn!(%error, "replication failed");
            self.emit(ReplicationEvent::Error {
                message: error.to_string(),
            });
        }
    }

    /// Set the status; returns whether it changed.
    fn transition(&self, status: ReplicationStatus) -> bool {
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        })
    }

    fn emit(&self, event: ReplicationEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("no replication subscribers");
        }
    }
}

enum CycleFailure {
    Remote(RemoteCallError),
    Local(Error),
}

fn is_replicable(document: &Document) -> bool {
    document.kind().is_some_and(|kind| kind.is_business())
}

fn replicable_remote(change: &ChangeRecord) -> Option<Document> {
    if change.deleted {
        return None;
    }
    let doc = change.doc.clone()?;
    match Document::from_json(Value::Object(doc)) {
        Ok(document) if is_replicable(&document) && document.revision.is_some() => Some(document),
        Ok(_) => None,
        Err(error) => {
            debug!(sequence = change.sequence, %error, "skipping unreadable remote change");
            None
        }
    }
}
