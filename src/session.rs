//! One open conversation: history, live traffic and read state behind a
//! single handle.
//!
//! Opening fetches members and read cursors, then the newest history page,
//! then starts the live connection. A pump task applies connection events to
//! the timeline and the cursor tracker and republishes them on the
//! [`EventBus`].

use crate::api::ChatApi;
use crate::config::{Credential, SessionConfig};
use crate::connection::{Connection, ConnectionEvent, ConnectionState, shutdown_signalled};
use crate::pager::{HistoryPager, PageFetch, PaginationError};
use crate::transport::TransportFactory;
use crate::types::events::{
    CursorUpdate, EventBus, EventReceivers, SessionFailure, TimelineUpdate,
};
use bytes::Bytes;
use chatcore::frame::{InboundFrame, PostMessage};
use chatcore::grouping::{self, GroupingFlags};
use chatcore::net::HttpClient;
use chatcore::read_cursor::ReadCursorTracker;
use chatcore::rest::ApiError;
use chatcore::timeline::{Timeline, TimelineChange, TimelineEntry};
use chatcore::topics::Destinations;
use chatcore::types::{GroupId, Member, MemberId, MessageId, Sender};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to load conversation: {0}")]
    Api(#[from] ApiError),
    #[error("Current user is not a member of group {group_id}")]
    NotAMember { group_id: GroupId },
    #[error("Message text is empty")]
    EmptyMessage,
    #[error("Session is closed")]
    Closed,
}

/// A timeline entry with everything a renderer needs to draw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub entry: TimelineEntry,
    pub unread_count: usize,
    pub flags: GroupingFlags,
}

pub struct ChatSession {
    group_id: GroupId,
    me: Sender,
    members: Vec<Member>,
    destinations: Destinations,

    timeline: Mutex<Timeline>,
    cursors: Mutex<ReadCursorTracker>,
    connection: Arc<Connection>,
    pager: HistoryPager,

    view_active: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    event_bus: EventBus,
}

impl ChatSession {
    pub async fn open(
        group_id: GroupId,
        credential: Credential,
        config: SessionConfig,
        transport_factory: Arc<dyn TransportFactory>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Arc<Self>, SessionError> {
        info!(target: "Session", "Opening conversation {group_id}");
        let api = Arc::new(ChatApi::new(
            http_client,
            config.api_base_url.clone(),
            credential.clone(),
        ));

        let (members, cursors) = tokio::try_join!(
            api.fetch_members(group_id),
            api.fetch_read_cursors(group_id)
        )?;
        let me = members
            .iter()
            .find(|m| m.is_me)
            .map(|m| Sender {
                id: m.id,
                nickname: m.nickname.clone(),
                image_url: m.image_url.clone(),
            })
            .ok_or(SessionError::NotAMember { group_id })?;

        let mut tracker = ReadCursorTracker::from_cursors(cursors);
        tracker.seed_members(members.iter().map(|m| m.id));
        debug!(target: "Session", "Loaded {} members, {} cursors", members.len(), tracker.len());

        let destinations = Destinations::for_group(group_id);
        let (connection, connection_events) = Connection::new(
            transport_factory,
            config.clone(),
            credential,
            destinations.topic.clone(),
        );
        let pager = HistoryPager::new(api, group_id, config.page_size, config.request_timeout);
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            group_id,
            me,
            members,
            destinations,
            timeline: Mutex::new(Timeline::with_policy(config.reconcile)),
            cursors: Mutex::new(tracker),
            connection,
            pager,
            view_active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            shutdown,
            event_bus: EventBus::new(),
        });

        // A failed first page leaves the pager on page 0 for the next load_older.
        if let Err(e) = session.load_older().await {
            warn!(target: "Session", "Initial history fetch failed: {e}");
        }

        let connection = session.connection.clone();
        tokio::spawn(async move { connection.run().await });

        let pump = session.clone();
        tokio::spawn(async move { pump.pump_connection_events(connection_events).await });

        Ok(session)
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn me(&self) -> &Sender {
        &self.me
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn has_more_history(&self) -> bool {
        self.pager.has_more()
    }

    pub fn events(&self) -> EventReceivers {
        self.event_bus.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().await.snapshot()
    }

    pub async fn pending_count(&self) -> usize {
        self.timeline.lock().await.pending_count()
    }

    pub async fn rows(&self) -> Vec<MessageRow> {
        let timeline = self.timeline.lock().await;
        let cursors = self.cursors.lock().await;
        let flags = grouping::layout(timeline.messages());
        timeline
            .iter()
            .zip(flags)
            .map(|(entry, flags)| MessageRow {
                unread_count: cursors.unread_count(&entry.message),
                entry: entry.clone(),
                flags,
            })
            .collect()
    }

    pub async fn unread_count(&self, id: MessageId) -> Option<usize> {
        let timeline = self.timeline.lock().await;
        let message = timeline.messages().find(|m| m.id == id)?.clone();
        drop(timeline);
        Some(self.cursors.lock().await.unread_count(&message))
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn publish(&self, change: TimelineChange) {
        if change != TimelineChange::Unchanged {
            let _ = self.event_bus.timeline.send(TimelineUpdate::from(change));
        }
    }

    fn report(&self, failure: SessionFailure) {
        let _ = self.event_bus.failure.send(Arc::new(failure));
    }

    /// Shows the message right away as pending and hands it to the live
    /// channel, which queues it while offline.
    pub async fn send(&self, text: &str) -> Result<MessageId, SessionError> {
        self.ensure_open()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let (id, change) = self.timeline.lock().await.push_local(
            self.me.clone(),
            self.group_id,
            text,
            Utc::now(),
        );
        self.publish(change);

        let body = PostMessage { message: text }.encode();
        self.connection
            .send(&self.destinations.post_message, body)
            .await;
        debug!(target: "Session", "Sent {id}");
        Ok(id)
    }

    /// Loads the next older history page and merges it in front.
    pub async fn load_older(&self) -> Result<PageFetch, PaginationError> {
        if self.is_closed() {
            return Err(PaginationError::Cancelled);
        }
        let mut shutdown = self.shutdown.subscribe();
        let fetched = tokio::select! {
            result = self.pager.fetch_next_page() => result,
            _ = shutdown_signalled(&mut shutdown) => return Err(PaginationError::Cancelled),
        };

        let fetch = match fetched {
            Ok(fetch) => fetch,
            Err(PaginationError::Exhausted) => return Err(PaginationError::Exhausted),
            Err(e) => {
                self.report(SessionFailure::History {
                    page_index: self.pager.next_index(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        if let PageFetch::Fetched(page) = &fetch {
            if self.is_closed() {
                debug!(target: "Session", "Discarding page {} fetched after close", page.page_index);
                return Err(PaginationError::Cancelled);
            }
            let changes = self
                .timeline
                .lock()
                .await
                .merge_page(page.messages.clone());
            for change in changes {
                self.publish(change);
            }
        }
        Ok(fetch)
    }

    /// Tells the server the user has read up to now and moves the user's own
    /// cursor. Nothing is sent while the connection is down.
    pub async fn mark_read(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let sent = self
            .connection
            .send_if_connected(&self.destinations.mark_read, Bytes::new())
            .await;
        if !sent {
            return false;
        }
        debug!(target: "Session", "Marked conversation {} as read", self.group_id);

        // Covers everything shown, even if the local clock trails the server.
        let newest = self
            .timeline
            .lock()
            .await
            .messages()
            .map(|m| m.sent_at)
            .max();
        let read_at = newest.map_or_else(Utc::now, |newest| newest.max(Utc::now()));
        self.advance_cursor(self.me.id, read_at).await;
        true
    }

    async fn advance_cursor(&self, member_id: MemberId, read_at: DateTime<Utc>) {
        let moved = self.cursors.lock().await.advance(member_id, read_at);
        if moved {
            let _ = self
                .event_bus
                .read_cursor
                .send(CursorUpdate { member_id, read_at });
        }
    }

    pub async fn set_view_active(&self, active: bool) {
        let was_active = self.view_active.swap(active, Ordering::SeqCst);
        if active && !was_active {
            self.mark_read().await;
        }
    }

    fn is_view_active(&self) -> bool {
        self.view_active.load(Ordering::SeqCst)
    }

    /// Disconnects and stops background work. Only the first call does
    /// anything.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(target: "Session", "Closing conversation {}", self.group_id);
        self.shutdown.send_replace(true);
        self.connection.disconnect().await;
        let _ = self
            .event_bus
            .connection_state
            .send(ConnectionState::Disconnected);
        true
    }

    async fn pump_connection_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ConnectionEvent::StateChanged(state) => {
                    let _ = self.event_bus.connection_state.send(state);
                }
                ConnectionEvent::Subscribed { generation } => {
                    if generation == 1 || self.is_view_active() {
                        self.mark_read().await;
                    }
                }
                ConnectionEvent::Message { destination, body } => {
                    if destination == self.destinations.topic {
                        self.handle_frame(&body).await;
                    } else {
                        debug!(target: "Session", "Ignoring frame for {destination}");
                    }
                }
                ConnectionEvent::Failed(e) => {
                    warn!(target: "Session", "Live channel failure: {e}");
                    self.report(SessionFailure::Connection(e));
                }
            }
        }
        debug!(target: "Session", "Event pump for conversation {} stopped", self.group_id);
    }

    async fn handle_frame(&self, body: &[u8]) {
        match InboundFrame::decode(body) {
            Ok(InboundFrame::General(message)) => {
                if message.group_id != self.group_id {
                    warn!(target: "Session", "Dropping message {} for group {}", message.id, message.group_id);
                    return;
                }
                let change = self.timeline.lock().await.merge_live(message);
                if change == TimelineChange::Unchanged {
                    return;
                }
                self.publish(change);
                if self.is_view_active() {
                    self.mark_read().await;
                }
            }
            Ok(InboundFrame::CursorAdvanced(advance)) => {
                self.advance_cursor(advance.member_id, advance.read_at).await;
            }
            Err(e) => {
                warn!(target: "Session", "Dropping malformed live frame: {e}");
                self.report(SessionFailure::MalformedFrame(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crate::transport::mock::{MockTransport, MockTransportFactory};
    use crate::types::events::ViewportHint;
    use chatcore::stomp::{Command, StompFrame};
    use serde_json::json;
    use std::time::Duration;

    async fn open(
        http: &Arc<MockHttpClient>,
        transports: &Arc<MockTransportFactory>,
    ) -> Result<Arc<ChatSession>, SessionError> {
        ChatSession::open(
            GROUP,
            Credential::bearer("tok"),
            SessionConfig::default(),
            transports.clone(),
            http.clone(),
        )
        .await
    }

    fn sends_to(transport: &MockTransport, destination: &str) -> usize {
        transport
            .sent_commands(Command::Send)
            .iter()
            .filter(|f| f.get_header("destination") == Some(destination))
            .count()
    }

    async fn push_live(transport: &MockTransport, body: serde_json::Value) {
        transport
            .push(
                StompFrame::new(Command::Message)
                    .header("destination", format!("/topic/groups/{GROUP}/chats"))
                    .header("subscription", "sub-0")
                    .with_body(body.to_string()),
            )
            .await;
    }

    const MARK_READ: &str = "/app/groups/7/chats/read";
    const POST: &str = "/app/groups/7/chats";

    #[tokio::test(start_paused = true)]
    async fn test_open_loads_history_then_marks_read_once() {
        let http = quiet_server();
        http.respond(
            &page_fragment(0),
            200,
            page_json(&[message(2, 2, "second", 20), message(1, 3, "first", 10)], 0, true),
        );
        let transports = transports();
        let session = open(&http, &transports).await.unwrap();

        let requests = http.requests();
        assert!(requests[2].contains("page=0&size=30"));
        let texts: Vec<String> = session
            .snapshot()
            .await
            .into_iter()
            .map(|e| e.message.text)
            .collect();
        assert_eq!(texts, vec!["first", "second"]);

        eventually(async || {
            transports
                .latest()
                .is_some_and(|t| sends_to(&t, MARK_READ) == 1)
        })
        .await;
        let transport = transports.latest().unwrap();
        assert_eq!(transport.sent_commands(Command::Subscribe).len(), 1);
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_open_rejects_non_member() {
        let http = quiet_server();
        http.respond("/members", 200, members_json(&[2, 3]));
        let result = open(&http, &transports()).await;
        assert!(matches!(
            result,
            Err(SessionError::NotAMember { group_id: GROUP })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_frames_merge_and_move_cursors() {
        let http = quiet_server();
        let transports = transports();
        let session = open(&http, &transports).await.unwrap();
        let mut events = session.events();
        eventually(async || transports.latest().is_some_and(|t| sends_to(&t, MARK_READ) == 1)).await;
        let transport = transports.latest().unwrap();

        let live = message(10, 2, "hi", 100);
        push_live(&transport, json!({ "messageType": "general", "message": live })).await;
        push_live(&transport, json!({ "messageType": "general", "message": live })).await;
        eventually(async || session.snapshot().await.len() == 1).await;

        let update = events.timeline.recv().await.unwrap();
        assert_eq!(update.hint, ViewportHint::StickToBottom);
        // The mark-read for the new message moves my own cursor; member 3 is
        // still behind.
        eventually(async || sends_to(&transport, MARK_READ) == 2).await;
        eventually(async || session.unread_count(live.id).await == Some(1)).await;

        push_live(
            &transport,
            json!({ "messageType": "updateReadTime",
                    "message": { "updateMemberId": 3, "updateReadTime": at(200).to_rfc3339() } }),
        )
        .await;
        let cursor = loop {
            let cursor = events.read_cursor.recv().await.unwrap();
            if cursor.member_id != ME {
                break cursor;
            }
        };
        assert_eq!(cursor.member_id, 3);
        assert_eq!(session.unread_count(live.id).await, Some(0));

        push_live(
            &transport,
            json!({ "messageType": "updateReadTime",
                    "message": { "updateMemberId": 3, "updateReadTime": at(50).to_rfc3339() } }),
        )
        .await;
        push_live(&transport, json!({ "messageType": "typing" })).await;
        let failure = events.failure.recv().await.unwrap();
        assert!(matches!(*failure, SessionFailure::MalformedFrame(_)));

        assert_eq!(session.unread_count(live.id).await, Some(0));
        assert_eq!(session.snapshot().await.len(), 1);
        // One mark-read on subscribe and one for the new message.
        assert_eq!(sends_to(&transport, MARK_READ), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_reconciles_after_reconnect() {
        let http = quiet_server();
        let transports = transports();
        let session = open(&http, &transports).await.unwrap();
        eventually(async || transports.latest().is_some_and(|t| sends_to(&t, MARK_READ) == 1)).await;

        transports.latest().unwrap().drop_connection().await;
        eventually(async || session.connection_state() == ConnectionState::Reconnecting).await;

        let id = session.send("hello").await.unwrap();
        assert!(id.is_local());
        assert_eq!(session.pending_count().await, 1);

        eventually(async || {
            transports.created().len() == 2 && sends_to(&transports.created()[1], POST) == 1
        })
        .await;
        let first = transports.created()[0].clone();
        let second = transports.created()[1].clone();
        assert_eq!(sends_to(&first, POST), 0);
        assert_eq!(sends_to(&first, MARK_READ), 1);
        assert_eq!(sends_to(&second, MARK_READ), 1);
        assert_eq!(second.sent_commands(Command::Subscribe).len(), 1);

        let mut echo = message(55, ME, "hello", 0);
        echo.sent_at = Utc::now();
        push_live(&second, json!({ "messageType": "general", "message": echo })).await;
        eventually(async || session.pending_count().await == 0).await;

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message.id, MessageId::Server(55));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_older_prepends_with_offset_hint() {
        let http = quiet_server();
        http.respond(
            &page_fragment(0),
            200,
            page_json(&[message(4, 2, "d", 40), message(3, 2, "c", 30)], 0, false),
        );
        http.respond(
            &page_fragment(1),
            200,
            page_json(&[message(2, 3, "b", 20), message(1, 3, "a", 10)], 1, true),
        );
        let session = open(&http, &transports()).await.unwrap();
        let mut events = session.events();

        assert!(matches!(
            session.load_older().await,
            Ok(PageFetch::Fetched(_))
        ));
        let update = events.timeline.recv().await.unwrap();
        assert_eq!(update.hint, ViewportHint::KeepOffset { inserted: 2 });

        let ids: Vec<MessageId> = session
            .snapshot()
            .await
            .into_iter()
            .map(|e| e.message.id)
            .collect();
        assert_eq!(ids, (1..=4).map(MessageId::Server).collect::<Vec<_>>());
        assert!(!session.has_more_history());
        assert!(matches!(
            session.load_older().await,
            Err(PaginationError::Exhausted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_page_is_retried_by_load_older() {
        let http = quiet_server();
        http.respond(&page_fragment(0), 500, "");
        let session = open(&http, &transports()).await.unwrap();
        assert!(session.snapshot().await.is_empty());

        http.respond(
            &page_fragment(0),
            200,
            page_json(&[message(1, 2, "a", 10)], 0, true),
        );
        let Ok(PageFetch::Fetched(page)) = session.load_older().await else {
            panic!("expected page 0");
        };
        assert_eq!(page.page_index, 0);
        assert_eq!(session.snapshot().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_carry_grouping_and_unread_counts() {
        let http = quiet_server();
        http.respond(
            "/lastReadTimes",
            200,
            json!([{ "memberId": ME, "readAt": at(15).to_rfc3339() }]).to_string(),
        );
        http.respond(
            &page_fragment(0),
            200,
            page_json(
                &[
                    message(3, 3, "c", 20),
                    message(2, 2, "b", 10),
                    message(1, 2, "a", 0),
                ],
                0,
                true,
            ),
        );
        // Stay offline so no mark-read moves my cursor.
        let transports = transports();
        transports.fail_next(u32::MAX);
        let session = open(&http, &transports).await.unwrap();

        let rows = session.rows().await;
        let flags: Vec<(bool, bool)> = rows
            .iter()
            .map(|r| (r.flags.show_header, r.flags.show_timestamp))
            .collect();
        assert_eq!(flags, vec![(true, false), (false, true), (true, true)]);
        // Member 3 never read; member 1 read at 15s.
        assert_eq!(rows[0].unread_count, 1);
        assert_eq!(rows[2].unread_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_moves_own_cursor() {
        let http = quiet_server();
        http.respond(
            &page_fragment(0),
            200,
            page_json(&[message(1, 2, "a", 10)], 0, true),
        );
        let transports = transports();
        let session = open(&http, &transports).await.unwrap();
        let mut events = session.events();

        eventually(async || transports.latest().is_some_and(|t| sends_to(&t, MARK_READ) == 1)).await;
        let cursor = events.read_cursor.recv().await.unwrap();
        assert_eq!(cursor.member_id, ME);
        assert!(cursor.read_at >= at(10));
        // Only member 3 is left.
        assert_eq!(session.unread_count(MessageId::Server(1)).await, Some(1));

        // Nothing was sent, so the cursor stays put.
        session.connection.disconnect().await;
        assert!(!session.mark_read().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_exactly_once() {
        let http = quiet_server();
        let transports = transports();
        let session = open(&http, &transports).await.unwrap();
        eventually(async || transports.latest().is_some_and(|t| sends_to(&t, MARK_READ) == 1)).await;

        assert!(session.close().await);
        assert!(!session.close().await);

        let transport = transports.latest().unwrap();
        assert!(transport.is_closed());
        assert_eq!(transport.sent_commands(Command::Unsubscribe).len(), 1);
        assert_eq!(transport.sent_commands(Command::Disconnect).len(), 1);
        assert!(matches!(session.send("late").await, Err(SessionError::Closed)));
        assert!(matches!(
            session.load_older().await,
            Err(PaginationError::Cancelled)
        ));
        assert!(!session.mark_read().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_arriving_after_close_is_discarded() {
        let http = quiet_server();
        http.respond(
            &page_fragment(0),
            200,
            page_json(&[message(2, 2, "b", 10)], 0, false),
        );
        http.respond(
            &page_fragment(1),
            200,
            page_json(&[message(1, 2, "a", 0)], 1, true),
        );
        let session = open(&http, &transports()).await.unwrap();
        assert_eq!(session.snapshot().await.len(), 1);

        http.delay(Duration::from_secs(2));
        let loader = session.clone();
        let pending = tokio::spawn(async move { loader.load_older().await });
        tokio::task::yield_now().await;
        session.close().await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(PaginationError::Cancelled)
        ));
        assert_eq!(session.snapshot().await.len(), 1);
    }
}
