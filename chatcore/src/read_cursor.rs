use crate::types::{ChatMessage, MemberId, ReadCursor};
use chrono::{DateTime, Utc};
use log::trace;
use std::collections::HashMap;

/// Per-member last-read timestamps for one conversation.
///
/// Cursors only move forward: an advance that is not strictly newer than the
/// stored value is discarded, which keeps the tracker correct under
/// out-of-order or repeated delivery.
#[derive(Debug, Default, Clone)]
pub struct ReadCursorTracker {
    cursors: HashMap<MemberId, DateTime<Utc>>,
}

impl ReadCursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the tracker from the upfront cursor fetch. Members that never
    /// read the conversation start at the beginning of time.
    pub fn from_cursors(cursors: impl IntoIterator<Item = ReadCursor>) -> Self {
        let mut tracker = Self::new();
        for cursor in cursors {
            tracker.advance(cursor.member_id, cursor.read_at.unwrap_or(DateTime::<Utc>::MIN_UTC));
        }
        tracker
    }

    /// Registers members that have no cursor yet.
    pub fn seed_members(&mut self, members: impl IntoIterator<Item = MemberId>) {
        for member in members {
            self.cursors.entry(member).or_insert(DateTime::<Utc>::MIN_UTC);
        }
    }

    /// Returns `true` when the stored cursor moved.
    pub fn advance(&mut self, member: MemberId, read_at: DateTime<Utc>) -> bool {
        match self.cursors.get_mut(&member) {
            Some(current) if read_at <= *current => {
                trace!("Ignoring stale cursor for member {member}: {read_at} <= {current}");
                false
            }
            Some(current) => {
                *current = read_at;
                true
            }
            None => {
                self.cursors.insert(member, read_at);
                true
            }
        }
    }

    pub fn get(&self, member: MemberId) -> Option<DateTime<Utc>> {
        self.cursors.get(&member).copied()
    }

    /// Number of members other than the sender who have not read `message`.
    pub fn unread_count(&self, message: &ChatMessage) -> usize {
        self.cursors
            .iter()
            .filter(|(member, read_at)| **member != message.sender.id && **read_at < message.sent_at)
            .count()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
