//! The ordered, deduplicated message sequence of one conversation.
//!
//! History pages arrive newest-first and are merged at the front, live frames
//! arrive at the tail, and optimistic local sends sit at the tail as pending
//! entries until their server copy shows up. Every path goes through the same
//! id index, so a message delivered by more than one source occupies exactly
//! one slot, and every insertion keeps entries non-decreasing by `sent_at`.

use crate::types::{ChatMessage, GroupId, MessageId, Sender};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Shown locally, server copy not seen yet.
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    pub state: DeliveryState,
}

impl TimelineEntry {
    fn confirmed(message: ChatMessage) -> Self {
        Self {
            message,
            state: DeliveryState::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }
}

/// What a mutation did to the sequence. Indices refer to the sequence right
/// after the change was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineChange {
    Unchanged,
    /// `count` entries were inserted in front of the previous head.
    Prepended { count: usize },
    /// `count` entries were added after the previous tail.
    Appended { count: usize },
    /// One entry landed between existing entries.
    Inserted { index: usize },
    /// A pending entry was replaced by its server copy.
    Reconciled { from: usize, to: usize },
}

/// How a server copy is matched to a pending local entry.
///
/// There is no correlation id on the wire, so a copy matches the oldest
/// pending entry with the same sender and text whose local timestamp lies in
/// `[server - window, server + clock_skew]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub window: Duration,
    pub clock_skew: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            window: Duration::minutes(5),
            clock_skew: Duration::seconds(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct Timeline {
    entries: VecDeque<TimelineEntry>,
    ids: HashSet<MessageId>,
    pending: usize,
    next_local_id: u64,
    policy: ReconcilePolicy,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: ReconcilePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TimelineEntry> {
        self.entries.get(index)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Ascending copy of the current sequence.
    pub fn snapshot(&self) -> Vec<TimelineEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Adds an optimistic entry for a message the local user just sent.
    pub fn push_local(
        &mut self,
        sender: Sender,
        group_id: GroupId,
        text: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> (MessageId, TimelineChange) {
        let id = MessageId::Local(self.next_local_id);
        self.next_local_id += 1;

        let entry = TimelineEntry {
            message: ChatMessage {
                id,
                group_id,
                sender,
                text: text.into(),
                sent_at,
            },
            state: DeliveryState::Pending,
        };
        self.pending += 1;
        let index = self.insert_sorted(entry);
        (id, self.placement(index, 1))
    }

    /// Merges one message received on the live channel.
    pub fn merge_live(&mut self, message: ChatMessage) -> TimelineChange {
        if self.ids.contains(&message.id) {
            debug!("Dropping duplicate message {}", message.id);
            return TimelineChange::Unchanged;
        }
        if let Some(from) = self.find_pending_match(&message) {
            return self.reconcile(from, message);
        }
        let index = self.insert_sorted(TimelineEntry::confirmed(message));
        self.placement(index, 1)
    }

    /// Merges one history page (newest first) in front of the sequence.
    ///
    /// The page is reversed and, apart from duplicates and reconciled sends,
    /// lands as one block before the current head. Messages newer than the
    /// head, which show up when live traffic shifted the page offsets, are
    /// placed individually at their sorted position.
    pub fn merge_page(&mut self, newest_first: Vec<ChatMessage>) -> Vec<TimelineChange> {
        let head_at = self.entries.front().map(|e| e.message.sent_at);
        let mut seen = HashSet::with_capacity(newest_first.len());
        let mut front = Vec::with_capacity(newest_first.len());
        let mut rest = Vec::new();

        for message in newest_first.into_iter().rev() {
            if self.ids.contains(&message.id) || !seen.insert(message.id) {
                debug!("Dropping duplicate message {} from page", message.id);
                continue;
            }
            let before_head = head_at.is_none_or(|head| message.sent_at <= head);
            if before_head && self.find_pending_match(&message).is_none() {
                front.push(message);
            } else {
                rest.push(message);
            }
        }

        // Pages are ordered by id; keep that order among equal timestamps.
        front.sort_by_key(|m| m.sent_at);

        let mut changes = Vec::with_capacity(1 + rest.len());
        if !front.is_empty() {
            let count = front.len();
            for message in front.into_iter().rev() {
                self.ids.insert(message.id);
                self.entries.push_front(TimelineEntry::confirmed(message));
            }
            changes.push(TimelineChange::Prepended { count });
        }
        for message in rest {
            let change = self.merge_live(message);
            if change != TimelineChange::Unchanged {
                changes.push(change);
            }
        }
        changes
    }

    fn find_pending_match(&self, message: &ChatMessage) -> Option<usize> {
        if self.pending == 0 || message.id.is_local() {
            return None;
        }
        let earliest = message.sent_at - self.policy.window;
        let latest = message.sent_at + self.policy.clock_skew;
        self.entries.iter().position(|entry| {
            entry.is_pending()
                && entry.message.sender.id == message.sender.id
                && entry.message.text == message.text
                && entry.message.sent_at >= earliest
                && entry.message.sent_at <= latest
        })
    }

    fn reconcile(&mut self, from: usize, message: ChatMessage) -> TimelineChange {
        let Some(local) = self.entries.remove(from) else {
            return TimelineChange::Unchanged;
        };
        self.ids.remove(&local.message.id);
        self.pending -= 1;
        debug!("Reconciled {} with server copy {}", local.message.id, message.id);
        let to = self.insert_sorted(TimelineEntry::confirmed(message));
        TimelineChange::Reconciled { from, to }
    }

    /// Inserts after any entries with an equal timestamp and returns the index.
    fn insert_sorted(&mut self, entry: TimelineEntry) -> usize {
        self.ids.insert(entry.message.id);
        let at = entry.message.sent_at;

        let front_at = self.entries.front().map(|e| e.message.sent_at);
        let back_at = self.entries.back().map(|e| e.message.sent_at);
        match (front_at, back_at) {
            (_, None) => {
                self.entries.push_back(entry);
                0
            }
            (_, Some(back)) if at >= back => {
                self.entries.push_back(entry);
                self.entries.len() - 1
            }
            (Some(front), _) if at < front => {
                self.entries.push_front(entry);
                0
            }
            _ => {
                let index = self.entries.partition_point(|e| e.message.sent_at <= at);
                self.entries.insert(index, entry);
                index
            }
        }
    }

    fn placement(&self, index: usize, count: usize) -> TimelineChange {
        if index + 1 == self.entries.len() {
            TimelineChange::Appended { count }
        } else if index == 0 {
            TimelineChange::Prepended { count }
        } else {
            TimelineChange::Inserted { index }
        }
    }
}
