pub mod member;
pub mod message;
pub mod page;

pub use member::{Member, MemberId, ReadCursor};
pub use message::{ChatMessage, GroupId, MessageId, Sender};
pub use page::Page;
