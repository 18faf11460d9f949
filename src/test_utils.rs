use crate::transport::mock::MockTransportFactory;
use chatcore::net::{HttpClient, HttpRequest, HttpResponse};
use chatcore::types::{ChatMessage, GroupId, MessageId, Sender};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Serves canned JSON for URL fragments. The longest matching fragment wins;
/// unknown URLs get a 404.
#[derive(Default)]
pub struct MockHttpClient {
    routes: StdMutex<Vec<(String, u16, String)>>,
    requests: StdMutex<Vec<String>>,
    failures_left: AtomicU32,
    delay: StdMutex<Option<Duration>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url_fragment: &str, status: u16, body: impl Into<String>) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.retain(|(fragment, _, _)| fragment != url_fragment);
            routes.push((url_fragment.to_string(), status, body.into()));
        }
    }

    /// The next `count` requests fail at the transport level.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Every response is held back this long.
    pub fn delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.url.clone());
        }
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("connection reset"));
        }

        let routes = self.routes.lock().map(|r| r.clone()).unwrap_or_default();
        let reply = routes
            .iter()
            .filter(|(fragment, _, _)| request.url.contains(fragment.as_str()))
            .max_by_key(|(fragment, _, _)| fragment.len());
        Ok(match reply {
            Some((_, status, body)) => HttpResponse {
                status_code: *status,
                body: body.clone().into_bytes(),
            },
            None => HttpResponse {
                status_code: 404,
                body: Vec::new(),
            },
        })
    }
}

pub const GROUP: GroupId = 7;
pub const ME: i64 = 1;

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .unwrap()
}

pub fn message(id: i64, sender: i64, text: &str, seconds: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId::Server(id),
        group_id: GROUP,
        sender: Sender {
            id: sender,
            nickname: format!("user{sender}"),
            image_url: None,
        },
        text: text.to_string(),
        sent_at: at(seconds),
    }
}

/// History page body; `messages` must already be newest first.
pub fn page_json(messages: &[ChatMessage], number: u32, last: bool) -> String {
    json!({ "content": messages, "number": number, "last": last }).to_string()
}

pub fn members_json(ids: &[i64]) -> String {
    let members: Vec<_> = ids
        .iter()
        .map(|id| json!({ "id": id, "nickname": format!("user{id}"), "isMe": *id == ME }))
        .collect();
    serde_json::Value::from(members).to_string()
}

pub fn page_fragment(index: u32) -> String {
    format!("/groups/{GROUP}/chats?page={index}&")
}

/// A server with three members, no read cursors and an empty history.
pub fn quiet_server() -> Arc<MockHttpClient> {
    let http = Arc::new(MockHttpClient::new());
    http.respond("/members", 200, members_json(&[ME, 2, 3]));
    http.respond("/lastReadTimes", 200, "[]");
    http.respond(&page_fragment(0), 200, page_json(&[], 0, true));
    http
}

pub fn transports() -> Arc<MockTransportFactory> {
    Arc::new(MockTransportFactory::new())
}

/// Polls `condition` on the (paused) test clock until it holds.
pub async fn eventually(mut condition: impl AsyncFnMut() -> bool) {
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
