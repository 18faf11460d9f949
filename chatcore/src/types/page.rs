use super::ChatMessage;

/// One slice of history as returned by the read API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Newest first.
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
    pub page_index: u32,
}
