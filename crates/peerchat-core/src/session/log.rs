//! Ordered message log.
//!
//! New messages are staged unsorted. [`MessageLog::flush`] stably sorts the
//! staged batch by timestamp and appends it, so messages that arrive out of
//! order within one batch still read in send order.

use crate::protocol::PeerId;
use chrono::{DateTime, Local, Utc};
use std::fmt;

/// One log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Who wrote it (`sys` for notices).
    pub source: PeerId,
    /// Ordering key.
    pub timestamp: DateTime<Utc>,
    /// Text shown to the user.
    pub body: String,
}

impl Message {
    /// Build a message.
    pub fn new(source: PeerId, timestamp: DateTime<Utc>, body: impl Into<String>) -> Self {
        Self {
            source,
            timestamp,
            body: body.into(),
        }
    }

    /// A `sys` notice stamped now.
    pub fn notice(body: impl Into<String>) -> Self {
        Self::new(PeerId::system(), Utc::now(), body)
    }
}

impl fmt::Display for Message {
    /// `[source][HH:MM]: body`, time in the local zone.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][{}]: {}",
            self.source,
            self.timestamp.with_timezone(&Local).format("%H:%M"),
            self.body
        )
    }
}

/// Append-only log with a staging buffer.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    staged: Vec<Message>,
    entries: Vec<Message>,
}

impl MessageLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for the next flush.
    pub fn stage(&mut self, message: Message) {
        self.staged.push(message);
    }

    /// Sort the staged batch by timestamp and append it.
    pub fn flush(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let mut batch = std::mem::take(&mut self.staged);
        sort_batch(&mut batch);
        self.entries.append(&mut batch);
    }

    /// Every flushed entry, oldest first.
    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    /// The newest `size` flushed entries.
    pub fn window(&self, size: usize) -> &[Message] {
        let start = self.entries.len().saturating_sub(size);
        &self.entries[start..]
    }

    /// Messages staged but not yet flushed.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Number of flushed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been flushed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every flushed entry. Staged messages survive.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Remove and return the newest `n` flushed entries, newest first.
    pub fn pop(&mut self, n: usize) -> Vec<Message> {
        let keep = self.entries.len().saturating_sub(n);
        let mut popped = self.entries.split_off(keep);
        popped.reverse();
        popped
    }
}

/// Stable sort by timestamp.
pub fn sort_batch(batch: &mut [Message]) {
    batch.sort_by_key(|m| m.timestamp);
}
