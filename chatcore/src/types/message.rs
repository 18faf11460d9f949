use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub type GroupId = i64;

/// Identifier of a timeline entry.
///
/// Server-issued ids and client placeholders live in separate spaces so an
/// optimistic entry can never collide with a confirmed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    Server(i64),
    Local(u64),
}

impl MessageId {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{id}"),
            MessageId::Local(id) => write!(f, "local-{id}"),
        }
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        MessageId::Server(id)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageId::Server(id) => serializer.serialize_i64(*id),
            MessageId::Local(_) => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(MessageId::Server)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub id: i64,
    pub nickname: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender: Sender,
    #[serde(alias = "message")]
    pub text: String,
    #[serde(with = "crate::time::wire")]
    pub sent_at: DateTime<Utc>,
}
