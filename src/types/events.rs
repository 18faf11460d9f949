use crate::connection::{ConnectionState, TransportError};
use chatcore::frame::FrameError;
use chatcore::timeline::TimelineChange;
use chatcore::types::MemberId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// How a renderer should treat its scroll position after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportHint {
    /// Content was inserted above; shift the offset by `inserted` rows.
    KeepOffset { inserted: usize },
    /// New content at the bottom.
    StickToBottom,
    Preserve,
}

impl ViewportHint {
    pub fn for_change(change: TimelineChange) -> Self {
        match change {
            TimelineChange::Prepended { count } => ViewportHint::KeepOffset { inserted: count },
            TimelineChange::Appended { .. } => ViewportHint::StickToBottom,
            TimelineChange::Inserted { .. }
            | TimelineChange::Reconciled { .. }
            | TimelineChange::Unchanged => ViewportHint::Preserve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineUpdate {
    pub change: TimelineChange,
    pub hint: ViewportHint,
}

impl From<TimelineChange> for TimelineUpdate {
    fn from(change: TimelineChange) -> Self {
        Self {
            change,
            hint: ViewportHint::for_change(change),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorUpdate {
    pub member_id: MemberId,
    pub read_at: DateTime<Utc>,
}

/// Non-fatal problems a session reports while it keeps running.
#[derive(Debug)]
pub enum SessionFailure {
    Connection(TransportError),
    History { page_index: u32, reason: String },
    MalformedFrame(FrameError),
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event kind.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }

            pub fn subscribe(&self) -> EventReceivers {
                EventReceivers {
                    $(
                        $field: self.$field.subscribe(),
                    )*
                }
            }
        }

        /// Receiving ends of every channel of an [`EventBus`].
        #[derive(Debug)]
        pub struct EventReceivers {
            $(
                pub $field: broadcast::Receiver<$type>,
            )*
        }
    };
}

define_event_bus! {
    (timeline, TimelineUpdate),
    (read_cursor, CursorUpdate),
    (connection_state, ConnectionState),
    (failure, Arc<SessionFailure>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
