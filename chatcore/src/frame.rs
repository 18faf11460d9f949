//! Payloads carried inside live channel frames.

use crate::types::{ChatMessage, MemberId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed live frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("live frame body is not UTF-8")]
    NotUtf8,
}

/// A frame pushed by the server on the conversation topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "messageType", content = "message")]
pub enum InboundFrame {
    #[serde(rename = "general")]
    General(ChatMessage),
    #[serde(rename = "updateReadTime")]
    CursorAdvanced(CursorAdvance),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CursorAdvance {
    #[serde(rename = "updateMemberId")]
    pub member_id: MemberId,
    #[serde(rename = "updateReadTime", with = "crate::time::wire")]
    pub read_at: DateTime<Utc>,
}

impl InboundFrame {
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(body).map_err(|_| FrameError::NotUtf8)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Body of a "post message" send.
#[derive(Debug, Clone, Serialize)]
pub struct PostMessage<'a> {
    pub message: &'a str,
}

impl PostMessage<'_> {
    pub fn encode(&self) -> String {
        // Serializing a single string field cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
