//! Request builders and response mapping for the REST read API.

use crate::net::{HttpRequest, HttpResponse};
use crate::types::{ChatMessage, GroupId, Member, Page, ReadCursor};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const HISTORY_SORT: &str = "id";
pub const HISTORY_DIRECTION: &str = "DESC";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] anyhow::Error),
    #[error("server responded with status {status}")]
    Status { status: u16 },
    #[error("could not decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Wire shape of a history page.
#[derive(Debug, Deserialize)]
struct PageResponse {
    content: Vec<ChatMessage>,
    number: u32,
    last: bool,
}

fn trim_base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

pub fn history_request(
    base_url: &str,
    group_id: GroupId,
    page_index: u32,
    page_size: u32,
    bearer: &str,
) -> HttpRequest {
    let url = format!(
        "{}/groups/{group_id}/chats?page={page_index}&size={page_size}&sort={}&direction={}",
        trim_base(base_url),
        urlencoding::encode(HISTORY_SORT),
        urlencoding::encode(HISTORY_DIRECTION),
    );
    HttpRequest::get(url)
        .with_bearer(bearer)
        .with_header("Accept", "application/json")
}

pub fn members_request(base_url: &str, group_id: GroupId, bearer: &str) -> HttpRequest {
    HttpRequest::get(format!("{}/groups/{group_id}/members", trim_base(base_url)))
        .with_bearer(bearer)
        .with_header("Accept", "application/json")
}

pub fn read_cursors_request(base_url: &str, group_id: GroupId, bearer: &str) -> HttpRequest {
    HttpRequest::get(format!(
        "{}/groups/{group_id}/chats/lastReadTimes",
        trim_base(base_url)
    ))
    .with_bearer(bearer)
    .with_header("Accept", "application/json")
}

fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, ApiError> {
    if !response.is_success() {
        return Err(ApiError::Status {
            status: response.status_code,
        });
    }
    Ok(serde_json::from_slice(&response.body)?)
}

pub fn parse_page(response: &HttpResponse) -> Result<Page, ApiError> {
    let page: PageResponse = decode(response)?;
    Ok(Page {
        messages: page.content,
        has_more: !page.last,
        page_index: page.number,
    })
}

pub fn parse_members(response: &HttpResponse) -> Result<Vec<Member>, ApiError> {
    decode(response)
}

pub fn parse_read_cursors(response: &HttpResponse) -> Result<Vec<ReadCursor>, ApiError> {
    decode(response)
}
