//! JSON frames exchanged with subscribers, and decoding of upstream frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::UPSTREAM_AUTHOR;
use crate::error::ParseError;
use crate::types::{Message, MessageId};

/// A message as sent to subscribers and returned by the query API.
///
/// Unlike [`Message`], `markup` is always filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub markup: String,
}

impl From<&Message> for MessageRecord {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id(),
            author: msg.author().to_string(),
            timestamp: msg.timestamp(),
            text: msg.text().to_string(),
            markup: msg.markup().into_owned(),
        }
    }
}

impl MessageRecord {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A frame sent *by* a subscriber that wants to publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    pub author: String,
    pub text: String,
    #[serde(default)]
    pub markup: Option<String>,
}

impl InboundFrame {
    /// Parse and validate a subscriber text frame.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let frame: InboundFrame =
            serde_json::from_str(text).map_err(|e| ParseError::NotJson(e.to_string()))?;

        if frame.author.trim().is_empty() {
            return Err(ParseError::MissingField("author"));
        }
        if frame.text.trim().is_empty() {
            return Err(ParseError::MissingField("text"));
        }
        Ok(frame)
    }

    /// Build the message to publish. Ids and timestamps are assigned here,
    /// never taken from the client.
    pub fn into_message(self) -> Message {
        let msg = Message::new(self.author, self.text);
        match self.markup {
            Some(markup) => msg.with_markup(markup),
            None => msg,
        }
    }
}

/// Result of decoding one upstream frame.
///
/// `message` is always usable. `issue` records why some fields had to be
/// filled in with defaults.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub message: Message,
    pub issue: Option<ParseError>,
}

const AUTHOR_KEYS: &[&str] = &["author", "username", "name"];
const TEXT_KEYS: &[&str] = &["text", "msg", "content", "message"];
const MARKUP_KEYS: &[&str] = &["markup", "html"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "time"];

/// Decode an upstream data frame into a message.
///
/// Frames are never rejected. A JSON object contributes whichever known
/// fields it has; anything missing falls back to the upstream author, the
/// raw frame as text, and the current time. Anything else is relayed
/// whole as text. Upstream ids are ignored so that ids stay unique.
pub fn decode_upstream_frame(data: &[u8]) -> DecodedFrame {
    let raw = String::from_utf8_lossy(data);

    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return fallback(&raw, ParseError::NotUtf8),
    };

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return fallback(&raw, ParseError::NotJson(e.to_string())),
    };

    let Value::Object(fields) = value else {
        return fallback(&raw, ParseError::NotAnObject);
    };

    let mut issue = None;

    let author = match string_field(&fields, AUTHOR_KEYS) {
        Some(author) => author.to_string(),
        None => {
            issue.get_or_insert(ParseError::MissingField("author"));
            UPSTREAM_AUTHOR.to_string()
        }
    };

    let body = match string_field(&fields, TEXT_KEYS) {
        Some(body) => body.to_string(),
        None => {
            issue.get_or_insert(ParseError::MissingField("text"));
            raw.to_string()
        }
    };

    let mut message = Message::new(author, body);

    match timestamp_field(&fields) {
        Ok(Some(timestamp)) => message = message.with_timestamp(timestamp),
        Ok(None) => {}
        Err(e) => {
            issue.get_or_insert(e);
        }
    }

    if let Some(markup) = string_field(&fields, MARKUP_KEYS) {
        message = message.with_markup(markup);
    }

    DecodedFrame { message, issue }
}

fn fallback(raw: &str, issue: ParseError) -> DecodedFrame {
    DecodedFrame {
        message: Message::new(UPSTREAM_AUTHOR, raw),
        issue: Some(issue),
    }
}

fn string_field<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

/// RFC 3339 strings and integer epoch milliseconds are accepted.
fn timestamp_field(fields: &Map<String, Value>) -> Result<Option<DateTime<Utc>>, ParseError> {
    let Some(value) = TIMESTAMP_KEYS.iter().find_map(|key| fields.get(*key)) else {
        return Ok(None);
    };

    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| ParseError::InvalidTimestamp(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| ParseError::InvalidTimestamp(n.to_string())),
        other => Err(ParseError::InvalidTimestamp(other.to_string())),
    }
}
