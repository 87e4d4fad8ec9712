//! Pulsebot: a conversational agent that executes streamed, timed action sequences.
//!
//! An inbound message triggers a streaming model response shaped as
//! `{"action_sequence": [...]}`. The [`stream::PartialJsonTracker`] lifts
//! completed elements out of the still-incomplete stream, a per-channel
//! worker in [`queue::ChannelRegistry`] executes them strictly in order via
//! the [`dispatch::Dispatcher`], and side effects land in the shared
//! [`memory::store::MemoryStore`]. New input on a channel cancels whatever
//! that channel was doing and starts over.

pub mod action;
pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod memory;
pub mod queue;
pub mod stream;
pub mod surface;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Logical channel kind. Numeric codes are stable and used as snapshot keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Console,
    Voice,
    Discord,
    Telegram,
}

impl ChannelKind {
    /// Stable numeric code used in persisted snapshot keys.
    pub fn code(self) -> u8 {
        match self {
            ChannelKind::Console => 0,
            ChannelKind::Voice => 1,
            ChannelKind::Discord => 2,
            ChannelKind::Telegram => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChannelKind::Console),
            1 => Some(ChannelKind::Voice),
            2 => Some(ChannelKind::Discord),
            3 => Some(ChannelKind::Telegram),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Console => write!(f, "console"),
            ChannelKind::Voice => write!(f, "voice"),
            ChannelKind::Discord => write!(f, "discord"),
            ChannelKind::Telegram => write!(f, "telegram"),
        }
    }
}

/// Channel identity: (kind, platform id). The registry and the memory store
/// are both keyed by this. Channels are created on first reference and never
/// deleted, only cleared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub kind: ChannelKind,
    pub id: i64,
}

impl ChannelId {
    pub fn new(kind: ChannelKind, id: i64) -> Self {
        Self { kind, id }
    }

    /// Key used for persisted snapshots, `"<kind code>:<id>"`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind.code(), self.id)
    }

    /// Parse a snapshot key produced by [`ChannelId::storage_key`].
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (kind, id) = key.split_once(':')?;
        let kind = ChannelKind::from_code(kind.parse().ok()?)?;
        Some(Self::new(kind, id.parse().ok()?))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Inbound message event from a messaging surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: ChannelId,
    /// Platform-assigned message id, or [`memory::types::PLACEHOLDER_MESSAGE_ID`]
    /// on surfaces without ids (console).
    pub message_id: i64,
    pub author: String,
    pub text: String,
    pub reply_to: Option<i64>,
    /// Unix timestamp, seconds.
    pub timestamp: f64,
}

impl InboundMessage {
    pub fn now(channel: ChannelId, message_id: i64, author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel,
            message_id,
            author: author.into(),
            text: text.into(),
            reply_to: None,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Context a queued action carries from the request that produced it,
/// needed for reply and mention resolution at dispatch time.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub channel: ChannelId,
    pub origin: InboundMessage,
}
