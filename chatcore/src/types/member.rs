use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MemberId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: MemberId,
    pub nickname: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_me: bool,
    #[serde(default)]
    pub is_leader: bool,
}

/// Last-read position of one member. A member who never opened the
/// conversation has no `read_at`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadCursor {
    pub member_id: MemberId,
    #[serde(default, deserialize_with = "crate::time::wire_opt::deserialize")]
    pub read_at: Option<DateTime<Utc>>,
}
