pub mod frame;
pub mod grouping;
pub mod net;
pub mod read_cursor;
pub mod rest;
pub mod stomp;
pub mod time;
pub mod timeline;
pub mod topics;
pub mod types;
