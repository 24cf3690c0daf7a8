//! Line protocol: request parser, reply formatter and payload codec.
//!
//! Every message is one LF-terminated line:
//!
//! ```text
//! UPLOAD <name>\n                      store empty content
//! UPLOAD <name> <encoded-payload>\n    store the decoded payload
//! RETRIEVE <name>\n
//!
//! FILE_UPLOADED <name>\n
//! FILE_CONTENT <name> <encoded-payload>\n
//! FILE_NOT_FOUND <name>\n
//! ```
//!
//! Payloads never carry a raw LF on the wire: each LF travels as the two
//! characters `\n`. Requests are split on single spaces with a per-verb
//! limit, so an upload payload keeps its internal spaces verbatim.

use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use serde::Deserialize;
use std::str;

pub const UPLOAD: &str = "UPLOAD";
pub const RETRIEVE: &str = "RETRIEVE";
pub const FILE_UPLOADED: &str = "FILE_UPLOADED";
pub const FILE_CONTENT: &str = "FILE_CONTENT";
pub const FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";

/// Upper bound on tokens for each verb.
const UPLOAD_TOKENS: usize = 3;
const RETRIEVE_TOKENS: usize = 2;

/// A parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store `payload` (already decoded) under `name`
    Upload { name: String, payload: Bytes },
    /// Fetch the content stored under `name`
    Retrieve { name: String },
}

/// Why a request line was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing but the line terminator
    Empty,
    /// First token is not a known verb
    UnknownVerb(String),
    /// Verb present but the name token is missing or empty
    MissingName(&'static str),
    /// The name is not valid UTF-8
    InvalidUtf8,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Empty request"),
            ParseError::UnknownVerb(verb) => write!(f, "Unknown command: {}", verb),
            ParseError::MissingName(verb) => write!(f, "{} requires a file name", verb),
            ParseError::InvalidUtf8 => write!(f, "Invalid UTF-8 in file name"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Remove the LF terminator, and a CR before it if present.
pub fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parser for request lines
pub struct Parser;

impl Parser {
    /// Parse one request line. A trailing terminator is ignored.
    pub fn parse(line: &[u8]) -> Result<Command, ParseError> {
        let line = strip_terminator(line);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let verb = line.split(|&b| b == b' ').next().unwrap_or_default();
        match verb {
            b"UPLOAD" => Self::parse_upload(line),
            b"RETRIEVE" => Self::parse_retrieve(line),
            _ => Err(ParseError::UnknownVerb(
                String::from_utf8_lossy(verb).into_owned(),
            )),
        }
    }

    /// `UPLOAD <name> [payload]`
    fn parse_upload(line: &[u8]) -> Result<Command, ParseError> {
        let mut parts = line.splitn(UPLOAD_TOKENS, |&b| b == b' ').skip(1);
        let name = Self::name(parts.next(), UPLOAD)?;
        let payload = parts.next().map(decode_payload).unwrap_or_default();

        Ok(Command::Upload {
            name,
            payload: Bytes::from(payload),
        })
    }

    /// `RETRIEVE <name>`; the name is everything after the first space.
    fn parse_retrieve(line: &[u8]) -> Result<Command, ParseError> {
        let mut parts = line.splitn(RETRIEVE_TOKENS, |&b| b == b' ').skip(1);
        let name = Self::name(parts.next(), RETRIEVE)?;
        Ok(Command::Retrieve { name })
    }

    fn name(token: Option<&[u8]>, verb: &'static str) -> Result<String, ParseError> {
        match token {
            Some(token) if !token.is_empty() => str::from_utf8(token)
                .map(str::to_string)
                .map_err(|_| ParseError::InvalidUtf8),
            _ => Err(ParseError::MissingName(verb)),
        }
    }
}

/// A server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The upload was persisted
    Uploaded { name: String },
    /// Raw (unencoded) content of a stored blob
    Content { name: String, payload: Bytes },
    /// Nothing stored under the name
    NotFound { name: String },
}

impl Reply {
    /// Format as exactly one LF-terminated line.
    pub fn to_line(&self) -> BytesMut {
        let mut line = BytesMut::new();
        match self {
            Reply::Uploaded { name } => {
                line.extend_from_slice(format!("{} {}", FILE_UPLOADED, name).as_bytes());
            }
            Reply::Content { name, payload } => {
                line.extend_from_slice(format!("{} {} ", FILE_CONTENT, name).as_bytes());
                line.extend_from_slice(&encode_payload(payload));
            }
            Reply::NotFound { name } => {
                line.extend_from_slice(format!("{} {}", FILE_NOT_FOUND, name).as_bytes());
            }
        }
        line.extend_from_slice(b"\n");
        line
    }
}

/// Replace every LF with the two characters `\n`.
pub fn encode_payload(raw: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(raw.len());
    for &b in raw {
        if b == b'\n' {
            encoded.extend_from_slice(b"\\n");
        } else {
            encoded.push(b);
        }
    }
    encoded
}

/// Replace every two-character `\n` with an LF, scanning left to right.
pub fn decode_payload(encoded: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        if encoded[i] == b'\\' && encoded.get(i + 1) == Some(&b'n') {
            decoded.push(b'\n');
            i += 2;
        } else {
            decoded.push(encoded[i]);
            i += 1;
        }
    }
    decoded
}

/// Trim ASCII whitespace from both ends.
fn trim_ascii(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_ascii_whitespace())
}

/// Format an upload request. An all-whitespace body sends no payload token;
/// any other body is sent verbatim after trimming.
pub fn format_upload(name: &str, body: &str) -> String {
    let name = trim_ascii(name);
    let body = trim_ascii(body);
    if body.is_empty() {
        format!("{} {}", UPLOAD, name)
    } else {
        format!("{} {} {}", UPLOAD, name, body)
    }
}

/// Format a retrieve request.
pub fn format_retrieve(name: &str) -> String {
    format!("{} {}", RETRIEVE, trim_ascii(name))
}

/// What the client does with `\n` escapes in received content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContentNewlines {
    /// Drop the escapes entirely (lines run together)
    #[default]
    Strip,
    /// Turn the escapes back into line breaks
    Decode,
}

/// A server line as the client reader sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Content to display
    Content(String),
    /// The requested file does not exist
    NotFound,
    /// Anything else, shown in the log only
    Other,
}

/// Classify a received line (terminator already removed).
pub fn classify(line: &str, newlines: ContentNewlines) -> ServerMessage {
    if line.starts_with("FILE_CONTENT ") {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        let content = match parts.get(2) {
            Some(payload) => match newlines {
                ContentNewlines::Strip => payload.replace("\\n", ""),
                ContentNewlines::Decode => {
                    String::from_utf8_lossy(&decode_payload(payload.as_bytes())).into_owned()
                }
            },
            None => String::new(),
        };
        ServerMessage::Content(content)
    } else if line.starts_with(FILE_NOT_FOUND) {
        ServerMessage::NotFound
    } else {
        ServerMessage::Other
    }
}
