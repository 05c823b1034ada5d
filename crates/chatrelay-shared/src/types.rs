use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message identity. UUIDv7, so ids are time-derived and increase
/// monotonically within one process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A relayed chat message.
///
/// Fields are private: once built, a message is never modified. The hub
/// shares it between the replay buffer and every subscriber queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    author: String,
    timestamp: DateTime<Utc>,
    text: String,
    markup: Option<String>,
}

impl Message {
    /// New message observed now, with a fresh id.
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            author: author.into(),
            timestamp: Utc::now(),
            text: text.into(),
            markup: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_markup(mut self, markup: impl Into<String>) -> Self {
        self.markup = Some(markup.into());
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Pre-rendered markup, if the source supplied one.
    pub fn raw_markup(&self) -> Option<&str> {
        self.markup.as_deref()
    }

    /// Markup to display: the supplied rendering, or one derived from
    /// author, timestamp and text.
    pub fn markup(&self) -> Cow<'_, str> {
        match &self.markup {
            Some(markup) => Cow::Borrowed(markup),
            None => Cow::Owned(render_markup(&self.author, self.timestamp, &self.text)),
        }
    }
}

/// Deterministic markup for a message without a supplied rendering.
pub fn render_markup(author: &str, timestamp: DateTime<Utc>, text: &str) -> String {
    format!(
        "<div class=\"message\"><span class=\"timestamp\">[{}]</span>\
         <span class=\"username\">{}</span><span class=\"content\">{}</span></div>",
        timestamp.format("%H:%M:%S"),
        escape_html(author),
        escape_html(text),
    )
}

fn escape_html(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}
