use crate::config::Credential;
use chatcore::net::HttpClient;
use chatcore::rest::{self, ApiError};
use chatcore::types::{GroupId, Member, Page, ReadCursor};
use log::debug;
use std::sync::Arc;

/// Authenticated client for the REST read API.
pub struct ChatApi {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    credential: Credential,
}

impl ChatApi {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into(),
            credential,
        }
    }

    pub async fn fetch_history(
        &self,
        group_id: GroupId,
        page_index: u32,
        page_size: u32,
    ) -> Result<Page, ApiError> {
        let request = rest::history_request(
            &self.base_url,
            group_id,
            page_index,
            page_size,
            self.credential.token(),
        );
        debug!(target: "Api", "GET {}", request.url);
        let response = self.http_client.execute(request).await?;
        rest::parse_page(&response)
    }

    pub async fn fetch_members(&self, group_id: GroupId) -> Result<Vec<Member>, ApiError> {
        let request = rest::members_request(&self.base_url, group_id, self.credential.token());
        debug!(target: "Api", "GET {}", request.url);
        let response = self.http_client.execute(request).await?;
        rest::parse_members(&response)
    }

    pub async fn fetch_read_cursors(&self, group_id: GroupId) -> Result<Vec<ReadCursor>, ApiError> {
        let request =
            rest::read_cursors_request(&self.base_url, group_id, self.credential.token());
        debug!(target: "Api", "GET {}", request.url);
        let response = self.http_client.execute(request).await?;
        rest::parse_read_cursors(&response)
    }
}
