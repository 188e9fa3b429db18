//! Driven port for the remote change feeds.

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::RemoteCallError;

/// Feeds the poller can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedName {
    /// `/__users/_changes`.
    UserProfiles,
    /// `/__tenants/_changes`.
    TenantDirectory,
}

impl FeedName {
    /// Label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserProfiles => "user_profiles",
            Self::TenantDirectory => "tenant_directory",
        }
    }
}

impl fmt::Display for FeedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Sequence number of the change.
    pub sequence: u64,
    /// Document key, when the feed reports one.
    pub id: Option<String>,
    /// Whether the change is a deletion.
    pub deleted: bool,
    /// Included document body, CouchDB metadata fields intact.
    pub doc: Option<Map<String, Value>>,
}

/// A page of changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Changes in feed order.
    pub results: Vec<ChangeRecord>,
    /// Feed-reported last sequence, if any.
    pub last_sequence: Option<u64>,
}

impl ChangeBatch {
    /// Highest sequence mentioned anywhere in the batch.
    pub fn highest_sequence(&self) -> Option<u64> {
        self.results
            .iter()
            .map(|change| change.sequence)
            .chain(self.last_sequence)
            .max()
    }
}

/// Port for reading change feeds incrementally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Fetch changes with a sequence strictly after `since`, documents included.
    async fn fetch_changes(
        &self,
        feed: FeedName,
        since: u64,
    ) -> Result<ChangeBatch, RemoteCallError>;
}
