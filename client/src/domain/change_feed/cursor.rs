//! Per-feed sequence cursor.

use crate::domain::ports::FeedName;

/// Last sequence processed for one feed. Starts at the feed origin and never
/// moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeCursor {
    feed: FeedName,
    sequence: u64,
}

impl ChangeCursor {
    /// Cursor at the origin of `feed`.
    pub fn new(feed: FeedName) -> Self {
        Self { feed, sequence: 0 }
    }

    /// Feed the cursor belongs to.
    pub fn feed(&self) -> FeedName {
        self.feed
    }

    /// Last processed sequence.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Move forward to `sequence`; returns `false` when that would not advance.
    pub fn advance(&mut self, sequence: u64) -> bool {
        if sequence <= self.sequence {
            return false;
        }
        self.sequence = sequence;
        true
    }
}
