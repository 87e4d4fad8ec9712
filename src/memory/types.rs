//! Persisted memory record types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message id recorded when the surface assigns no id (console input,
/// failed sends).
pub const PLACEHOLDER_MESSAGE_ID: i64 = -1;

/// One message in a channel's ordered, append-only history.
///
/// `metainfo` is mutated in place by later actions referencing the same id:
/// `"edited": true` after an edit, a `"reactions"` array of emoji after
/// reactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    /// Unix timestamp, seconds.
    pub timestamp: f64,
    pub text: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metainfo: HashMap<String, serde_json::Value>,
}

impl StoredMessage {
    pub fn new(id: i64, author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            text: text.into(),
            author: author.into(),
            metainfo: HashMap::new(),
        }
    }
}

/// A durable note, grouped under a topic. Ids are unique within a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryCell {
    pub id: i64,
    /// Unix timestamp, seconds.
    pub timestamp: f64,
    pub text: String,
}

/// Serializable snapshot of the whole store. Channel keys use the stable
/// `"<kind code>:<id>"` form from [`crate::ChannelId::storage_key`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    #[serde(default)]
    pub channels: HashMap<String, Vec<StoredMessage>>,
    #[serde(default)]
    pub topics: HashMap<String, Vec<MemoryCell>>,
}
