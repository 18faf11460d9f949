pub use chatcore::{frame, grouping, read_cursor, stomp, timeline, topics};

pub mod types {
    pub use chatcore::types::*;
    pub mod events;
}

pub mod api;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod pager;
pub mod session;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use config::{Credential, ReconnectPolicy, SessionConfig};
pub use connection::{ConnectionState, TransportError};
pub use session::{ChatSession, MessageRow, SessionError};
