//! The closed set of actions the model can emit.

use serde::{Deserialize, Serialize};

/// One effectful instruction decoded from the model's `action_sequence`.
///
/// The wire discriminant is the `action_name` field. An unknown discriminant
/// fails deserialization with a typed error instead of silently passing
/// through; the caller logs and skips that element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_name", rename_all = "snake_case")]
pub enum Action {
    /// Send `content` to the channel, optionally as a reply.
    SendMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_message_id: Option<i64>,
    },

    /// Edit a previously sent message.
    EditMessage { message_id: i64, new_content: String },

    /// Suspend this channel's worker. Other channels are unaffected.
    Wait { seconds: f64 },

    /// Append a memory cell under `topic`. An id is generated if absent.
    Remember {
        topic: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
    },

    /// Remove the cell with `id` from `topic`. No-op if absent.
    Forget { topic: String, id: i64 },

    /// Replace the content of an existing cell by id.
    ModifyMemory {
        topic: String,
        id: i64,
        content: String,
    },

    /// Attach an emoji reaction to a message.
    AddReactionEmojiIcon { message_id: i64, emoji: String },
}

impl Action {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::SendMessage { .. } => "send_message",
            Action::EditMessage { .. } => "edit_message",
            Action::Wait { .. } => "wait",
            Action::Remember { .. } => "remember",
            Action::Forget { .. } => "forget",
            Action::ModifyMemory { .. } => "modify_memory",
            Action::AddReactionEmojiIcon { .. } => "add_reaction_emoji_icon",
        }
    }
}
