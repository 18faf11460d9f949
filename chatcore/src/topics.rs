use crate::types::GroupId;

/// Live channel destinations for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub topic: String,
    pub post_message: String,
    pub mark_read: String,
}

impl Destinations {
    pub fn for_group(group_id: GroupId) -> Self {
        Self {
            topic: format!("/topic/groups/{group_id}/chats"),
            post_message: format!("/app/groups/{group_id}/chats"),
            mark_read: format!("/app/groups/{group_id}/chats/read"),
        }
    }
}
