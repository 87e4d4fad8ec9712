//! Executes one decoded action against the messaging surface and the store.

use crate::action::Action;
use crate::config::PacingConfig;
use crate::error::DispatchError;
use crate::memory::store::MemoryStore;
use crate::memory::types::StoredMessage;
use crate::surface::ChatSurfaceDyn;
use crate::{ChannelId, RequestContext};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

static MENTION_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"@(\w[\w.-]*)").expect("mention pattern is valid"));

/// One dispatcher serves every channel worker; it is stateless apart from
/// its collaborators.
pub struct Dispatcher {
    surface: Arc<dyn ChatSurfaceDyn>,
    store: Arc<MemoryStore>,
    pacing: PacingConfig,
    persona: String,
}

impl Dispatcher {
    pub fn new(
        surface: Arc<dyn ChatSurfaceDyn>,
        store: Arc<MemoryStore>,
        pacing: PacingConfig,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            surface,
            store,
            pacing,
            persona: persona.into(),
        }
    }

    /// Execute one action. An `Err` means this action is skipped; the
    /// caller's queue continues regardless.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        action: Action,
    ) -> Result<(), DispatchError> {
        let kind = action.kind();
        tracing::debug!(channel = %ctx.channel, kind, "dispatching action");

        match action {
            Action::SendMessage {
                content,
                reply_message_id,
            } => self.send_message(ctx, &content, reply_message_id).await,
            Action::EditMessage {
                message_id,
                new_content,
            } => self.edit_message(ctx.channel, message_id, &new_content).await,
            Action::Wait { seconds } => {
                tokio::time::sleep(clamp_delay(seconds)).await;
                Ok(())
            }
            Action::Remember { topic, content, id } => {
                let id = self.store.remember(&topic, &content, id).await;
                tracing::debug!(topic, id, "memory cell added");
                Ok(())
            }
            Action::Forget { topic, id } => {
                if !self.store.forget(&topic, id).await {
                    tracing::debug!(topic, id, "forget of absent cell, no-op");
                }
                Ok(())
            }
            Action::ModifyMemory { topic, id, content } => {
                self.store.modify(&topic, id, &content).await
            }
            Action::AddReactionEmojiIcon { message_id, emoji } => {
                self.add_reaction(ctx.channel, message_id, &emoji).await
            }
        }
    }

    async fn send_message(
        &self,
        ctx: &RequestContext,
        content: &str,
        reply_to: Option<i64>,
    ) -> Result<(), DispatchError> {
        let resolved = self.resolve_mentions(ctx.channel, content).await;

        let delay = typing_delay(
            resolved.chars().count(),
            self.pacing.seconds_per_char,
            jitter_factor(self.pacing.jitter, rand::random::<f64>()),
        );
        if !delay.is_zero() {
            if let Err(error) = self.surface.set_typing(ctx.channel, delay).await {
                tracing::debug!(%error, "typing indicator failed");
            }
            tokio::time::sleep(delay).await;
        }

        let message_id = self.surface.send(ctx.channel, &resolved, reply_to).await?;
        self.store
            .add_message(
                ctx.channel,
                StoredMessage::new(message_id, self.persona.clone(), resolved),
            )
            .await;
        Ok(())
    }

    async fn edit_message(
        &self,
        channel: ChannelId,
        message_id: i64,
        new_content: &str,
    ) -> Result<(), DispatchError> {
        // Fetch first: a vanished message skips the whole action.
        self.surface.fetch(channel, message_id).await?;
        self.surface.edit(channel, message_id, new_content).await?;

        let updated = self
            .store
            .update_message(channel, message_id, |message| {
                message.text = new_content.to_string();
                message.metainfo.insert("edited".into(), true.into());
            })
            .await;
        if !updated {
            tracing::debug!(message_id, "edited message not present in stored history");
        }
        Ok(())
    }

    async fn add_reaction(
        &self,
        channel: ChannelId,
        message_id: i64,
        emoji: &str,
    ) -> Result<(), DispatchError> {
        self.surface.fetch(channel, message_id).await?;
        self.surface.react(channel, message_id, emoji).await?;

        let emoji = emoji.to_string();
        self.store
            .update_message(channel, message_id, move |message| {
                let entry = message
                    .metainfo
                    .entry("reactions".into())
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                if let Some(reactions) = entry.as_array_mut() {
                    reactions.push(emoji.into());
                }
            })
            .await;
        Ok(())
    }

    /// Replace `@name` placeholders with platform mention syntax where the
    /// surface can resolve the name; unknown names pass through untouched.
    async fn resolve_mentions(&self, channel: ChannelId, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for captures in MENTION_RE.captures_iter(text) {
            let whole = captures.get(0).expect("match 0 always present");
            let name = &captures[1];
            out.push_str(&text[last..whole.start()]);
            match self.surface.member_id(channel, name).await {
                Some(member) => out.push_str(&format!("<@{member}>")),
                None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&text[last..]);
        out
    }
}

/// Longest pause a single action may impose on its channel worker. The
/// model controls `wait` arguments, so the bound has to live here.
pub const MAX_ACTION_DELAY: Duration = Duration::from_secs(3600);

/// Clamp model- or config-supplied seconds to `[0, MAX_ACTION_DELAY]`.
/// NaN waits not at all.
fn clamp_delay(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0))
        .map(|delay| delay.min(MAX_ACTION_DELAY))
        .unwrap_or(MAX_ACTION_DELAY)
}

/// Simulated typing time for a message of `chars` characters. Pure so tests
/// can pin the jitter factor.
pub fn typing_delay(chars: usize, seconds_per_char: f64, jitter: f64) -> Duration {
    clamp_delay(chars as f64 * seconds_per_char * jitter)
}

/// Map a uniform `[0, 1)` sample to a `[1 - amplitude, 1 + amplitude)` scale
/// factor.
pub fn jitter_factor(amplitude: f64, unit_sample: f64) -> f64 {
    1.0 - amplitude + 2.0 * amplitude * unit_sample
}
