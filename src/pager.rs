//! Backward pagination over the conversation history.

use crate::api::ChatApi;
use chatcore::rest::ApiError;
use chatcore::types::{GroupId, Page};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("History request failed: {0}")]
    Api(#[from] ApiError),
    #[error("History request timed out after {0:?}")]
    Timeout(Duration),
    #[error("No older history")]
    Exhausted,
    #[error("Session closed while fetching history")]
    Cancelled,
}

#[derive(Debug)]
pub enum PageFetch {
    Fetched(Page),
    /// Another fetch was already in flight; nothing was requested.
    Busy,
}

pub struct HistoryPager {
    api: Arc<ChatApi>,
    group_id: GroupId,
    page_size: u32,
    request_timeout: Duration,
    next_index: AtomicU32,
    has_more: AtomicBool,
    in_flight: AtomicBool,
}

impl HistoryPager {
    pub fn new(
        api: Arc<ChatApi>,
        group_id: GroupId,
        page_size: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            api,
            group_id,
            page_size,
            request_timeout,
            next_index: AtomicU32::new(0),
            has_more: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Index of the page the next `fetch_next_page` requests.
    pub fn next_index(&self) -> u32 {
        self.next_index.load(Ordering::SeqCst)
    }

    pub fn has_more(&self) -> bool {
        self.has_more.load(Ordering::SeqCst)
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Fetches one page by index without touching the pager position.
    pub async fn fetch_page(&self, page_index: u32) -> Result<Page, PaginationError> {
        let request = self
            .api
            .fetch_history(self.group_id, page_index, self.page_size);
        match timeout(self.request_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PaginationError::Timeout(self.request_timeout)),
        }
    }

    /// Fetches the next older page. Concurrent calls while one is in flight
    /// return [`PageFetch::Busy`]; a failure leaves the position unchanged.
    pub async fn fetch_next_page(&self) -> Result<PageFetch, PaginationError> {
        if !self.has_more() {
            return Err(PaginationError::Exhausted);
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(target: "Pager", "Fetch already in flight, ignoring.");
            return Ok(PageFetch::Busy);
        }
        let _guard = scopeguard::guard((), |_| {
            self.in_flight.store(false, Ordering::SeqCst);
        });

        let index = self.next_index();
        let page = match self.fetch_page(index).await {
            Ok(page) => page,
            Err(e) => {
                warn!(target: "Pager", "Failed to fetch page {index}: {e}");
                return Err(e);
            }
        };

        // An empty page cannot move the cursor further back.
        let has_more = page.has_more && !page.messages.is_empty();
        self.next_index.store(index + 1, Ordering::SeqCst);
        self.has_more.store(has_more, Ordering::SeqCst);
        info!(
            target: "Pager",
            "Fetched page {index} ({} messages, has_more={has_more})",
            page.messages.len()
        );
        Ok(PageFetch::Fetched(page))
    }
}
