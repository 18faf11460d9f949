//! STOMP 1.2 framing
//!
//! Frames are `COMMAND\n` followed by `name:value` header lines, a blank line,
//! the body and a NUL terminator. Bare EOLs between frames are heart-beats.

use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use std::fmt;
use thiserror::Error;

pub const STOMP_VERSION: &str = "1.2";
pub const HEARTBEAT: &[u8] = b"\n";
/// Largest frame the decoder buffers before giving up on it.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
const NUL: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StompError {
    #[error("unknown STOMP command '{0}'")]
    UnknownCommand(String),
    #[error("malformed header line '{0}'")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header '{0}'")]
    InvalidEscape(String),
    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),
    #[error("frame body is not NUL terminated")]
    MissingTerminator,
    #[error("frame is not UTF-8")]
    NotUtf8,
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Result<Self, StompError> {
        Ok(match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED frames carry headers verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StompFrame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the first value for `name`; repeated headers keep the first.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> Result<&str, StompError> {
        std::str::from_utf8(&self.body).map_err(|_| StompError::NotUtf8)
    }

    pub fn connect(host: &str, bearer: &str, heartbeat_ms: u64) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
            .header("Authorization", format!("Bearer {bearer}"))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut frame = Self::new(Command::Send).header("destination", destination);
        if !body.is_empty() {
            frame = frame
                .header("content-type", "application/json")
                .header("content-length", body.len().to_string());
        }
        frame.with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).header("receipt", receipt)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if self.command.escapes_headers() {
                escape_into(name, &mut out);
                out.push(b':');
                escape_into(value, &mut out);
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(NUL);
        out
    }
}

fn escape_into(raw: &str, out: &mut Vec<u8>) {
    for b in raw.bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b':' => out.extend_from_slice(b"\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// Buffers incoming data and extracts complete STOMP frames.
#[derive(Debug)]
pub struct StompDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
    /// Set after an oversized frame was dropped; bytes are discarded up to
    /// the next NUL.
    discarding: bool,
}

impl Default for StompDecoder {
    fn default() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }
}

impl StompDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
            discarding: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame, `None` when more data is needed.
    ///
    /// A malformed frame is consumed up to its terminator and reported as an
    /// error so the caller can keep decoding. A frame that grows past the
    /// size limit is reported once and its remaining bytes are skipped.
    pub fn decode_frame(&mut self) -> Option<Result<StompFrame, StompError>> {
        if self.discarding && !self.discard_until_terminator() {
            return None;
        }
        self.skip_heartbeats();
        if self.buffer.is_empty() {
            return None;
        }

        match self.try_parse() {
            Parse::Incomplete if self.buffer.len() > self.max_frame_size => {
                self.start_discarding();
                Some(Err(StompError::FrameTooLarge {
                    limit: self.max_frame_size,
                }))
            }
            Parse::Incomplete => None,
            Parse::Complete { frame, consumed } => {
                self.buffer.advance(consumed);
                trace!("<-- Decoded {} frame ({} bytes)", frame.command, consumed);
                Some(Ok(frame))
            }
            Parse::Invalid(err) => match self.buffer.iter().position(|&b| b == NUL) {
                Some(end) => {
                    self.buffer.advance(end + 1);
                    Some(Err(err))
                }
                None if self.buffer.len() > self.max_frame_size => {
                    self.start_discarding();
                    Some(Err(err))
                }
                // Wait for the terminator before discarding.
                None => None,
            },
        }
    }

    fn start_discarding(&mut self) {
        self.buffer.clear();
        self.discarding = true;
    }

    /// Drops bytes through the next NUL. Returns `false` while none arrived.
    fn discard_until_terminator(&mut self) -> bool {
        match self.buffer.iter().position(|&b| b == NUL) {
            Some(end) => {
                self.buffer.advance(end + 1);
                self.discarding = false;
                true
            }
            None => {
                self.buffer.clear();
                false
            }
        }
    }

    fn skip_heartbeats(&mut self) {
        let skip = self
            .buffer
            .iter()
            .take_while(|&&b| b == b'\n' || b == b'\r')
            .count();
        self.buffer.advance(skip);
    }

    fn try_parse(&self) -> Parse {
        let buf = &self.buffer[..];
        let mut pos = 0;
        let mut lines: Vec<&[u8]> = Vec::new();

        // Command and header lines, up to the blank separator line.
        loop {
            let Some(rel) = buf[pos..].iter().position(|&b| b == b'\n') else {
                return Parse::Incomplete;
            };
            let mut line = &buf[pos..pos + rel];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            pos += rel + 1;
            if line.is_empty() {
                break;
            }
            if line.contains(&NUL) {
                return Parse::Invalid(StompError::MissingTerminator);
            }
            lines.push(line);
        }

        let Some((command_line, header_lines)) = lines.split_first() else {
            return Parse::Invalid(StompError::UnknownCommand(String::new()));
        };
        let command = match std::str::from_utf8(command_line) {
            Ok(raw) => match Command::parse(raw) {
                Ok(command) => command,
                Err(e) => return Parse::Invalid(e),
            },
            Err(_) => return Parse::Invalid(StompError::NotUtf8),
        };

        let mut headers = Vec::with_capacity(header_lines.len());
        for line in header_lines {
            let Ok(line) = std::str::from_utf8(line) else {
                return Parse::Invalid(StompError::NotUtf8);
            };
            let Some((name, value)) = line.split_once(':') else {
                return Parse::Invalid(StompError::MalformedHeader(line.to_string()));
            };
            if command.escapes_headers() {
                match (unescape(name), unescape(value)) {
                    (Ok(name), Ok(value)) => headers.push((name, value)),
                    (Err(e), _) | (_, Err(e)) => return Parse::Invalid(e),
                }
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| v.clone());

        let body_end = match content_length {
            Some(raw) => {
                let Ok(len) = raw.trim().parse::<usize>() else {
                    return Parse::Invalid(StompError::InvalidContentLength(raw));
                };
                if len > self.max_frame_size {
                    return Parse::Invalid(StompError::FrameTooLarge {
                        limit: self.max_frame_size,
                    });
                }
                let Some(end) = pos.checked_add(len) else {
                    return Parse::Invalid(StompError::InvalidContentLength(raw));
                };
                if buf.len() <= end {
                    return Parse::Incomplete;
                }
                if buf[end] != NUL {
                    return Parse::Invalid(StompError::MissingTerminator);
                }
                end
            }
            None => match buf[pos..].iter().position(|&b| b == NUL) {
                Some(rel) => pos + rel,
                None => return Parse::Incomplete,
            },
        };

        let frame = StompFrame {
            command,
            headers,
            body: Bytes::copy_from_slice(&buf[pos..body_end]),
        };
        Parse::Complete {
            frame,
            consumed: body_end + 1,
        }
    }
}

enum Parse {
    Incomplete,
    Complete { frame: StompFrame, consumed: usize },
    Invalid(StompError),
}
