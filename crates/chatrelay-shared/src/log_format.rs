//! On-disk chat log format.
//!
//! Files are named `chat-YYYY-MM-DD.log` (the active file for a day) or
//! `chat-YYYY-MM-DD.N.log` (a segment closed because it grew too large).
//! Each line is one entry: `[YYYY-MM-DD HH:MM:SS] author: text`.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::constants::{LOG_FILE_PREFIX, LOG_FILE_SUFFIX};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIMESTAMP_LEN: usize = 19;

/// A validated chat log filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogFileName {
    pub date: NaiveDate,
    /// `None` for the active file of `date`, `Some(n)` for a closed segment.
    pub segment: Option<u32>,
}

impl LogFileName {
    pub fn active(date: NaiveDate) -> Self {
        Self { date, segment: None }
    }

    pub fn segment(date: NaiveDate, n: u32) -> Self {
        Self {
            date,
            segment: Some(n),
        }
    }

    /// Parse a bare filename. Returns `None` for anything that is not
    /// exactly a chat log name, which includes every name carrying a path
    /// separator or `..`.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name
            .strip_prefix(LOG_FILE_PREFIX)?
            .strip_suffix(LOG_FILE_SUFFIX)?;

        let (date_part, segment) = match stem.split_once('.') {
            Some((date_part, n)) => {
                if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let segment = n.parse::<u32>().ok()?;
                // Segments start at 1 and must print back as written.
                if segment == 0 || segment.to_string() != n {
                    return None;
                }
                (date_part, Some(segment))
            }
            None => (stem, None),
        };

        let date = NaiveDate::parse_from_str(date_part, DATE_FORMAT).ok()?;
        // Reject non-canonical spellings such as `2024-3-1`.
        if date.format(DATE_FORMAT).to_string() != date_part {
            return None;
        }

        Some(Self { date, segment })
    }
}

impl std::fmt::Display for LogFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.segment {
            None => write!(
                f,
                "{LOG_FILE_PREFIX}{}{LOG_FILE_SUFFIX}",
                self.date.format(DATE_FORMAT)
            ),
            Some(n) => write!(
                f,
                "{LOG_FILE_PREFIX}{}.{n}{LOG_FILE_SUFFIX}",
                self.date.format(DATE_FORMAT)
            ),
        }
    }
}

/// One parsed chat log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub author: String,
    pub text: String,
}

impl LogEntry {
    pub fn new(timestamp: NaiveDateTime, author: &str, text: &str) -> Self {
        Self {
            timestamp,
            author: single_line(author),
            text: single_line(text),
        }
    }

    /// Parse `[YYYY-MM-DD HH:MM:SS] author: text`. The author ends at the
    /// first `": "`.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('[')?;
        let stamp = rest.get(..TIMESTAMP_LEN)?;
        let rest = rest.get(TIMESTAMP_LEN..)?.strip_prefix("] ")?;

        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        let (author, text) = rest.split_once(": ")?;

        Some(Self {
            timestamp,
            author: author.to_string(),
            text: text.to_string(),
        })
    }

    /// Parse every well-formed line of a log file, skipping the rest.
    pub fn parse_all(content: &str) -> Vec<Self> {
        content.lines().filter_map(Self::parse).collect()
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.author,
            self.text
        )
    }
}

/// Entries are newline-separated, so embedded line breaks become spaces.
fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
