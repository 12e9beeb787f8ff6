//! Message model shared by the ingest path, the store and the console.
//!
//! A [`Message`] is immutable once built: the constructors apply truncation and
//! timestamp normalisation, and refuse empty text, so every instance that exists
//! already satisfies the storage invariants.

use serde::{Deserialize, Serialize};

/// Default upper bound for message text, in bytes.
pub const DEFAULT_MAX_LEN: usize = 240;

/// Sender tag attached to messages composed on this console.
pub const LOCAL_SENDER: &str = "You";

/// Sender tag used when a packet does not identify its origin.
pub const UNKNOWN_SENDER: &str = "unknown";

/// Source timestamps above this value are taken to be milliseconds.
const MILLIS_THRESHOLD: f64 = 1e12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    timestamp: f64,
    sender: String,
    text: String,
}

impl Message {
    /// Build a message, truncating `text` to `max_len` bytes and normalising the
    /// timestamp to seconds. Returns `None` for empty text.
    pub fn new(timestamp: f64, sender: impl Into<String>, text: &str, max_len: usize) -> Option<Self> {
        let text = truncate_utf8(text, max_len);
        if text.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: normalize_timestamp(timestamp),
            sender: sender.into(),
            text: text.to_string(),
        })
    }

    /// A message typed on this console, stamped with the current wall-clock time.
    pub fn outbound(text: &str, max_len: usize) -> Option<Self> {
        Self::new(now_seconds(), LOCAL_SENDER, text, max_len)
    }

    /// Rehydrate a stored row. Rows are trusted to already be normalised.
    pub(crate) fn from_row(timestamp: f64, sender: String, text: String) -> Self {
        Self {
            timestamp,
            sender,
            text,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_local(&self) -> bool {
        self.sender == LOCAL_SENDER
    }
}

/// Opaque inbound unit as surfaced by a transport's decoding layer.
///
/// Only the three optional fields matter to the pipeline; `port` is carried for
/// the raw-packet diagnostic log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

impl RawPacket {
    pub fn text(sender: impl Into<String>, timestamp: f64, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            sender: Some(sender.into()),
            timestamp: Some(timestamp),
            port: None,
        }
    }
}

/// Convert a millisecond timestamp to seconds; values already in seconds pass through.
pub fn normalize_timestamp(ts: f64) -> f64 {
    if ts > MILLIS_THRESHOLD {
        ts / 1000.0
    } else {
        ts
    }
}

/// Cut `input` to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut cut = max_bytes;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    &input[..cut]
}

/// Current wall-clock time as fractional unix seconds.
pub fn now_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millisecond_timestamps_become_seconds() {
        assert_eq!(normalize_timestamp(1_700_000_000_000.0), 1_700_000_000.0);
        assert_eq!(normalize_timestamp(1_700_000_000.5), 1_700_000_000.5);
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(Message::new(1.0, "a", "", 240).is_none());
        assert!(Message::new(1.0, "a", "x", 0).is_none());
    }

    #[test]
    fn long_text_is_cut_to_max_len() {
        let long = "a".repeat(500);
        let msg = Message::new(1.0, "node", &long, 240).unwrap();
        assert_eq!(msg.text().len(), 240);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // "é" is two bytes; a 3-byte cut would land inside the second one.
        assert_eq!(truncate_utf8("éé", 3), "é");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    #[test]
    fn outbound_messages_are_local() {
        let msg = Message::outbound("hello", 240).unwrap();
        assert!(msg.is_local());
        assert!(msg.timestamp() > 1_600_000_000.0);
    }
}
