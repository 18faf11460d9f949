//! Header and timestamp visibility for runs of messages.
//!
//! A run is a maximal sequence of messages by the same sender inside the same
//! minute. The first message of a run shows the sender header and the last one
//! shows the timestamp. Flags depend on neighbours, so they are recomputed from
//! the current snapshot after every change and never stored on a message.

use crate::types::ChatMessage;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupingFlags {
    pub show_header: bool,
    pub show_timestamp: bool,
}

pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

fn same_run(a: &ChatMessage, b: &ChatMessage) -> bool {
    a.sender.id == b.sender.id && minute_bucket(a.sent_at) == minute_bucket(b.sent_at)
}

pub fn grouping(
    prev: Option<&ChatMessage>,
    current: &ChatMessage,
    next: Option<&ChatMessage>,
) -> GroupingFlags {
    GroupingFlags {
        show_header: prev.is_none_or(|prev| !same_run(prev, current)),
        show_timestamp: next.is_none_or(|next| !same_run(current, next)),
    }
}

/// Flags for every message of an ascending snapshot.
pub fn layout<'a, I>(messages: I) -> Vec<GroupingFlags>
where
    I: IntoIterator<Item = &'a ChatMessage>,
{
    let messages: Vec<&ChatMessage> = messages.into_iter().collect();
    (0..messages.len())
        .map(|i| {
            let prev = i.checked_sub(1).map(|p| messages[p]);
            let next = messages.get(i + 1).copied();
            grouping(prev, messages[i], next)
        })
        .collect()
}
