//! # Per-Connection Message Queue
//!
//! Ordered inbound storage for one connection. Entries are keyed by
//! `(priority descending, arrival ascending)`, so iteration order equals
//! delivery order: higher priority first, FIFO within equal priority.
//! Each entry references a slice in the owning connection's pool carrying
//! the serialized message.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::SliceHandle;
use crate::reply::ReplyTracker;

/// Stable queue position of an entry: priority-descending, then arrival.
pub type EntryKey = (Reverse<i64>, u64);

/// A pending inbound message.
#[derive(Debug)]
pub struct QueueEntry {
    /// Slice in the receiver's pool holding the serialized message.
    pub slice: SliceHandle,
    pub src_id: u64,
    /// Sender uid, for the per-user queue quota accounting.
    pub sender_uid: u32,
    pub cookie: u64,
    pub priority: i64,
    /// Arrival order, from the domain sequence counter.
    pub seq: u64,
    /// Registry id of the destination name, zero when addressed by id.
    pub dst_name_id: u64,
    /// Transferable handle tokens installed at receive time.
    pub fds: Vec<u64>,
    /// Back-pointer to the reply tracker that authorized this entry, when
    /// the message expects a reply. Non-owning in spirit: dropping the
    /// entry must resolve the tracker, never leak it.
    pub reply: Option<Arc<ReplyTracker>>,
}

impl QueueEntry {
    pub fn key(&self) -> EntryKey {
        (Reverse(self.priority), self.seq)
    }
}

/// Priority-ordered inbound entries for one connection.
#[derive(Debug, Default)]
pub struct MsgQueue {
    entries: BTreeMap<EntryKey, QueueEntry>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry at its priority/arrival position.
    pub fn add(&mut self, entry: QueueEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Find the next entry to deliver.
    ///
    /// Without `use_priority`, the queue head (oldest entry of the highest
    /// priority band). With it, the head only qualifies when its priority
    /// is at least `priority`.
    pub fn peek(&self, priority: i64, use_priority: bool) -> Result<EntryKey> {
        let (key, entry) = self.entries.iter().next().ok_or(Error::Empty)?;
        if use_priority && entry.priority < priority {
            return Err(Error::Empty);
        }
        Ok(*key)
    }

    pub fn get(&self, key: EntryKey) -> Option<&QueueEntry> {
        self.entries.get(&key)
    }

    /// Unlink a specific entry.
    pub fn remove(&mut self, key: EntryKey) -> Option<QueueEntry> {
        self.entries.remove(&key)
    }

    /// Unlink the queue head, delivery order.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        let key = *self.entries.keys().next()?;
        self.entries.remove(&key)
    }

    /// Iterate entries in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }
}
