//! Payload shape classification.
//!
//! A frame body is classified exactly once, at the Link:
//!
//! 1. not valid UTF-8 -> [`Payload::Bytes`]
//! 2. a JSON object with `timestamp` and `content` -> [`Payload::Record`]
//! 3. anything else -> [`Payload::Text`]
//!
//! Ciphertext and key packets carry a marker whose first byte is `0xFF`,
//! which is never valid UTF-8, so they always classify as bytes.

use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Plain UTF-8 text.
    Text(String),
    /// Structured record with a sender-side timestamp.
    Record(Record),
    /// Opaque bytes (key packets, ciphertext, anything non-UTF-8).
    Bytes(Vec<u8>),
}

impl Payload {
    /// Classify a frame body.
    pub fn decode(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => match serde_json::from_str::<Record>(&text) {
                Ok(record) => Payload::Record(record),
                Err(_) => Payload::Text(text),
            },
            Err(e) => Payload::Bytes(e.into_bytes()),
        }
    }

    /// Serialize to the bytes carried inside a frame (sentinel not included).
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Record(record) => serde_json::to_vec(record)?,
            Payload::Bytes(bytes) => bytes.clone(),
        })
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Record(_) => "record",
            Payload::Bytes(_) => "bytes",
        }
    }

    /// Size of the body in bytes, before serialization overhead.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Record(record) => match &record.content {
                RecordContent::Text(text) => text.len(),
                RecordContent::Bytes(bytes) => bytes.len(),
            },
            Payload::Bytes(bytes) => bytes.len(),
        }
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON record `{"timestamp": ..., "content": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// When the sender produced the record.
    #[serde(serialize_with = "serialize_ts", deserialize_with = "deserialize_ts")]
    pub timestamp: DateTime<Utc>,
    /// Record body.
    pub content: RecordContent,
}

impl Record {
    /// Text record stamped with the current time.
    pub fn text_now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            content: RecordContent::Text(text.into()),
        }
    }
}

/// Body of a [`Record`]: a JSON string or a JSON array of byte values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordContent {
    /// String content.
    Text(String),
    /// Byte-array content.
    Bytes(Vec<u8>),
}

fn serialize_ts<S: Serializer>(ts: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339())
}

// Accepts RFC 3339 and offset-less ISO-8601 (read as UTC).
fn deserialize_ts<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}
