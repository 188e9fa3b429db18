//! Change-feed polling.
//!
//! One [`ChangeFeedPoller`] follows one remote feed. Each poller owns its
//! cursor, runs on its own cancellable task, and announces cycles that
//! changed local content on a broadcast channel.

mod cursor;
mod merge;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

pub use cursor::ChangeCursor;
pub use merge::{FeedMerger, ProfileFeedMerger, TenantFeedMerger};

use super::Error;
use super::ports::{ChangeFeedSource, FeedName};

/// Default pause between polling cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const NOTIFICATION_CAPACITY: usize = 64;

/// Lifecycle of a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// No task is running.
    Stopped,
    /// The polling task is running.
    Polling,
}

/// Published after a cycle that changed at least one local document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedNotification {
    /// Feed that produced the changes.
    pub feed: FeedName,
    /// Documents whose local content changed.
    pub changed: usize,
    /// Cursor after the cycle.
    pub sequence: u64,
}

/// Summary of one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Changes read from the feed.
    pub received: usize,
    /// Changes that altered local content.
    pub changed: usize,
    /// Cursor after the cycle.
    pub sequence: u64,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    source: Arc<dyn ChangeFeedSource>,
    merger: Arc<dyn FeedMerger>,
    interval: Duration,
    cursor: Mutex<ChangeCursor>,
    notifications: broadcast::Sender<FeedNotification>,
    state: watch::Sender<PollerState>,
    running: StdMutex<Option<Running>>,
}

/// Polls one change feed and merges what it finds.
#[derive(Clone)]
pub struct ChangeFeedPoller {
    inner: Arc<Inner>,
}

impl ChangeFeedPoller {
    /// Poller for the merger's feed, with its own notification channel.
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        merger: Arc<dyn FeedMerger>,
        interval: Duration,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self::with_notifications(source, merger, interval, notifications)
    }

    /// Poller publishing on an existing channel, so several feeds can share
    /// one subscriber.
    pub fn with_notifications(
        source: Arc<dyn ChangeFeedSource>,
        merger: Arc<dyn FeedMerger>,
        interval: Duration,
        notifications: broadcast::Sender<FeedNotification>,
    ) -> Self {
        let feed = merger.feed();
        let (state, _) = watch::channel(PollerState::Stopped);
        Self {
            inner: Arc::new(Inner {
                source,
                merger,
                interval,
                cursor: Mutex::new(ChangeCursor::new(feed)),
                notifications,
                state,
                running: StdMutex::new(None),
            }),
        }
    }

    /// Feed this poller follows.
    pub fn feed(&self) -> FeedName {
        self.inner.merger.feed()
    }

    /// Receive a [`FeedNotification`] after every cycle that changed data.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedNotification> {
        self.inner.notifications.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PollerState {
        *self.inner.state.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<PollerState> {
        self.inner.state.subscribe()
    }

    /// Last processed sequence.
    pub async fn cursor(&self) -> u64 {
        self.inner.cursor.lock().await.sequence()
    }

    /// Start polling: one cycle now, then one per interval.
    ///
    /// Returns `false` when the poller is already running.
    pub fn start(&self) -> bool {
        let mut running = match self.inner.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.is_some() {
            return false;
        }
        let (stop, stop_rx) = watch::channel(false);
        let span = info_span!("change_feed", feed = %self.feed());
        let poller = self.clone();
        let handle = tokio::spawn(poller.run(stop_rx).instrument(span));
        *running = Some(Running { stop, handle });
        self.inner.state.send_replace(PollerState::Polling);
        info!(feed = %self.feed(), "change feed poller started");
        true
    }

    /// Stop polling. An in-flight cycle completes first. Safe to call when
    /// not running.
    pub async fn stop(&self) {
        let running = match self.inner.running.lock() {
            Ok(mut running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(Running { stop, handle }) = running else {
            return;
        };
        stop.send_replace(true);
        if let Err(error) = handle.await {
            warn!(feed = %self.feed(), %error, "change feed task ended abnormally");
        }
        self.inner.state.send_replace(PollerState::Stopped);
        info!(feed = %self.feed(), "change feed poller stopped");
    }

    /// Run one cycle: prepare, fetch after the cursor, merge in feed order,
    /// advance the cursor and notify when something changed.
    ///
    /// # Errors
    ///
    /// Fetch failures leave the cursor untouched. A merge failure stops the
    /// cycle; the cursor keeps the last change merged before it, and the
    /// error is returned after any notification for earlier changes.
    pub async fn poll_once(&self) -> Result<PollOutcome, Error> {
        let feed = self.feed();
        if let Err(error) = self.inner.merger.prepare().await {
            warn!(%feed, %error, "feed preparation failed");
        }

        let mut cursor = self.inner.cursor.lock().await;
        let since = cursor.sequence();
        let batch = self
            .inner
            .source
            .fetch_changes(feed, since)
            .await?;

        let mut changed = 0;
        let mut merged_up_to = since;
        let mut failure = None;
        for change in &batch.results {
            match self.inner.merger.merge(change).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(%feed, sequence = change.sequence, %error, "merge failed; holding cursor");
                    failure = Some(error);
                    break;
                }
            }
            merged_up_to = merged_up_to.max(change.sequence);
        }
        let target = match failure {
            Some(_) => merged_up_to,
            None => batch.highest_sequence().unwrap_or(since),
        };
        cursor.advance(target);
        let outcome = PollOutcome {
            received: batch.results.len(),
            changed,
            sequence: cursor.sequence(),
        };
        drop(cursor);

        if changed > 0 {
            let notification = FeedNotification {
                feed,
                changed,
                sequence: outcome.sequence,
            };
            if self.inner.notifications.send(notification).is_err() {
                debug!(%feed, "no feed subscribers");
            }
        }
        debug!(%feed, received = outcome.received, changed, cursor = outcome.sequence, "poll cycle done");
        match failure {
            Some(error) => Err(error),
            None => Ok(outcome),
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            if let Err(error) = self.poll_once().await {
                warn!(%error, "poll cycle failed; retrying next interval");
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.inner.interval) => {}
            }
        }
    }
}
