//! The agent: inbound messages in, queued actions out.
//!
//! A new message on a channel cancels that channel's in-flight work, records
//! the message, starts a streaming model request, and feeds decoded actions
//! into the channel's queue as the stream completes them. Administrative
//! commands short-circuit before any of that.

use crate::action::Action;
use crate::error::{AgentError, Result, StreamError};
use crate::llm::{ChatRequest, ModelClientDyn, TokenStream};
use crate::memory::store::MemoryStore;
use crate::memory::types::{StoredMessage, PLACEHOLDER_MESSAGE_ID};
use crate::queue::{ChannelRegistry, QueuedAction};
use crate::stream::PartialJsonTracker;
use crate::surface::ChatSurfaceDyn;
use crate::{ChannelId, InboundMessage, RequestContext};
use futures::StreamExt as _;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub struct Agent {
    store: Arc<MemoryStore>,
    registry: Arc<ChannelRegistry>,
    surface: Arc<dyn ChatSurfaceDyn>,
    model: Arc<dyn ModelClientDyn>,
    command_prefix: String,
    current_channel: RwLock<Option<ChannelId>>,
}

impl Agent {
    pub fn new(
        store: Arc<MemoryStore>,
        registry: Arc<ChannelRegistry>,
        surface: Arc<dyn ChatSurfaceDyn>,
        model: Arc<dyn ModelClientDyn>,
        command_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            surface,
            model,
            command_prefix: command_prefix.into(),
            current_channel: RwLock::new(None),
        }
    }

    /// Select the channel that bare text input is attributed to.
    pub async fn set_channel(&self, channel: ChannelId) {
        self.store.ensure_channel(channel).await;
        *self.current_channel.write().await = Some(channel);
        tracing::info!(%channel, "channel selected");
    }

    /// Handle raw text input on the currently selected channel.
    pub async fn process_text(&self, author: &str, text: &str) -> Result<()> {
        let channel = self
            .current_channel
            .read()
            .await
            .ok_or(AgentError::ChannelNotSelected)?;
        self.handle_inbound(InboundMessage::now(
            channel,
            PLACEHOLDER_MESSAGE_ID,
            author,
            text,
        ))
        .await
    }

    /// Handle one inbound message: commands are executed directly, anything
    /// else cancels the channel's in-flight response and starts a new one.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<()> {
        if let Some(command) = message.text.strip_prefix(&self.command_prefix) {
            return self.handle_command(&message, command.trim()).await;
        }

        let channel = message.channel;
        let (generation, cancel) = self.registry.cancel_and_rebuild(channel).await;

        self.store.ensure_channel(channel).await;
        // Snapshot history before recording the incoming message, so the
        // model sees it once as `incoming`, not again in the context.
        let history = self.store.messages(channel).await;
        self.store
            .add_message(channel, stored_from_inbound(&message))
            .await;
        if let Err(error) = self.store.persist().await {
            tracing::warn!(%error, "persist of inbound message failed");
        }

        let request = ChatRequest {
            channel,
            incoming: message.clone(),
            history,
        };

        let stream = match self.model.stream_actions(request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%channel, %error, "model request failed");
                if let Err(send_error) = self
                    .surface
                    .send(channel, "(something went wrong, try again later)", None)
                    .await
                {
                    tracing::warn!(%send_error, "failed to surface model error");
                }
                return Ok(());
            }
        };

        let ctx = Arc::new(RequestContext {
            channel,
            origin: message,
        });
        let registry = Arc::clone(&self.registry);
        let task = tokio::spawn(drive_stream(registry, ctx, generation, cancel, stream));
        self.registry
            .attach_stream_task(channel, generation, task)
            .await;
        Ok(())
    }

    async fn handle_command(&self, message: &InboundMessage, command: &str) -> Result<()> {
        let channel = message.channel;
        match command {
            "clear" => {
                if !self.authorize(message, command).await? {
                    return Ok(());
                }
                self.registry.cancel_and_rebuild(channel).await;
                self.store.clear_channel(channel).await;
                self.store
                    .add_message(
                        channel,
                        StoredMessage::new(
                            PLACEHOLDER_MESSAGE_ID,
                            "system",
                            format!("chat history cleared by {}", message.author),
                        ),
                    )
                    .await;
                self.persist_and_confirm(channel, "Chat history cleared.")
                    .await;
            }
            "clear_notes" => {
                if !self.authorize(message, command).await? {
                    return Ok(());
                }
                self.store.clear_topics().await;
                self.persist_and_confirm(channel, "All notes cleared.").await;
            }
            _ => {
                tracing::debug!(%channel, command, "unknown command ignored");
            }
        }
        Ok(())
    }

    /// Operator check for administrative commands. A refusal is surfaced to
    /// the author and logged, not returned as an error.
    async fn authorize(&self, message: &InboundMessage, command: &str) -> Result<bool> {
        if self
            .surface
            .is_operator(message.channel, &message.author)
            .await
        {
            return Ok(true);
        }
        tracing::warn!(
            error = %AgentError::Unauthorized {
                command: command.to_string(),
                author: message.author.clone(),
            },
            "command refused"
        );
        if let Err(error) = self
            .surface
            .send(message.channel, "You are not allowed to do that.", None)
            .await
        {
            tracing::warn!(%error, "failed to surface refusal");
        }
        Ok(false)
    }

    async fn persist_and_confirm(&self, channel: ChannelId, confirmation: &str) {
        if let Err(error) = self.store.persist().await {
            tracing::warn!(%error, "persist after command failed");
        }
        if let Err(error) = self.surface.send(channel, confirmation, None).await {
            tracing::warn!(%error, "failed to send confirmation");
        }
    }

    /// Flush state on shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.registry.shutdown().await;
        self.store.persist().await
    }
}

fn stored_from_inbound(message: &InboundMessage) -> StoredMessage {
    let mut metainfo = HashMap::new();
    if let Some(reply_to) = message.reply_to {
        metainfo.insert("reply_to".to_string(), reply_to.into());
    }
    StoredMessage {
        id: message.message_id,
        timestamp: message.timestamp,
        text: message.text.clone(),
        author: message.author.clone(),
        metainfo,
    }
}

/// Pump one model stream through the tracker into the channel queue.
///
/// Runs until the stream ends, the token is cancelled, or the registry
/// refuses an enqueue (the worker was rebuilt under us).
async fn drive_stream(
    registry: Arc<ChannelRegistry>,
    ctx: Arc<RequestContext>,
    generation: u64,
    cancel: CancellationToken,
    mut stream: TokenStream,
) {
    let channel = ctx.channel;
    let mut tracker = PartialJsonTracker::new();

    loop {
        let fragment = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(%channel, generation, "stream producer cancelled");
                return;
            }
            next = stream.next() => next,
        };
        let fragment = match fragment {
            Some(Ok(fragment)) => fragment,
            Some(Err(error)) => {
                tracing::warn!(%channel, %error, "model stream broke mid-response");
                break;
            }
            None => break,
        };

        let values = tracker.push(&fragment);
        let base = tracker.elements_yielded() - values.len();
        for (offset, value) in values.into_iter().enumerate() {
            let index = base + offset;
            let action = match serde_json::from_value::<Action>(value) {
                Ok(action) => action,
                Err(source) => {
                    let error = StreamError::Decode { index, source };
                    tracing::warn!(%channel, %error, "skipping malformed action");
                    continue;
                }
            };
            let accepted = registry
                .enqueue(
                    channel,
                    generation,
                    QueuedAction {
                        ctx: ctx.clone(),
                        action,
                    },
                )
                .await;
            if !accepted {
                tracing::debug!(%channel, generation, "queue gone, abandoning stream");
                return;
            }
        }
    }

    if let Err(error) = tracker.finish() {
        tracing::debug!(%channel, %error, "model response ended mid-sequence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacingConfig;
    use crate::dispatch::Dispatcher;
    use crate::error::{DispatchError, Error};
    use crate::llm::ModelClient;
    use crate::memory::persist::Persistence;
    use crate::memory::types::MemorySnapshot;
    use crate::surface::{ChatSurface, SurfaceMessage, SurfaceResult};
    use crate::ChannelKind;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    struct NullPersistence;

    #[async_trait]
    impl Persistence for NullPersistence {
        async fn save(&self, _snapshot: &MemorySnapshot) -> Result<()> {
            Ok(())
        }
        async fn load(&self) -> Result<Option<MemorySnapshot>> {
            Ok(None)
        }
        async fn backup(&self, _snapshot: &MemorySnapshot) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        next_id: AtomicI64,
        sent: SyncMutex<Vec<String>>,
        operator: bool,
    }

    impl ChatSurface for RecordingSurface {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(
            &self,
            _channel: ChannelId,
            text: &str,
            _reply_to: Option<i64>,
        ) -> SurfaceResult<i64> {
            self.sent.lock().push(text.to_string());
            Ok(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
        }

        async fn edit(&self, _channel: ChannelId, _id: i64, _text: &str) -> SurfaceResult<()> {
            Ok(())
        }

        async fn fetch(
            &self,
            _channel: ChannelId,
            message_id: i64,
        ) -> SurfaceResult<SurfaceMessage> {
            Err(DispatchError::MessageNotFound { message_id })
        }

        async fn react(&self, _channel: ChannelId, _id: i64, _emoji: &str) -> SurfaceResult<()> {
            Ok(())
        }

        async fn is_operator(&self, _channel: ChannelId, _author: &str) -> bool {
            self.operator
        }
    }

    /// Model double that replays a fixed set of fragments and records every
    /// request it was asked to answer.
    struct ScriptedModel {
        fragments: Vec<String>,
        requests: SyncMutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                requests: SyncMutex::new(Vec::new()),
            }
        }
    }

    impl ModelClient for ScriptedModel {
        async fn stream_actions(&self, request: ChatRequest) -> Result<TokenStream> {
            self.requests.lock().push(request);
            let fragments = self.fragments.clone();
            Ok(Box::pin(futures::stream::iter(
                fragments.into_iter().map(Ok),
            )))
        }
    }

    struct FailingModel;

    impl ModelClient for FailingModel {
        async fn stream_actions(&self, _request: ChatRequest) -> Result<TokenStream> {
            Err(Error::Stream(StreamError::Transport("offline".into())))
        }
    }

    fn channel() -> ChannelId {
        ChannelId::new(ChannelKind::Console, 0)
    }

    async fn build_agent(
        surface: Arc<RecordingSurface>,
        model: Arc<dyn ModelClientDyn>,
    ) -> (Agent, Arc<MemoryStore>) {
        let store = Arc::new(
            MemoryStore::open(Arc::new(NullPersistence), 1000)
                .await
                .expect("open"),
        );
        let pacing = PacingConfig {
            seconds_per_char: 0.0,
            jitter: 0.0,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            surface.clone(),
            store.clone(),
            pacing,
            "Alpha",
        ));
        let registry = Arc::new(ChannelRegistry::new(
            dispatcher,
            store.clone(),
            Duration::from_secs(300),
        ));
        let agent = Agent::new(store.clone(), registry, surface, model, "!");
        (agent, store)
    }

    async fn drain_until(surface: &RecordingSurface, count: usize) {
        for _ in 0..200 {
            if surface.sent.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} sends, got {:?}", surface.sent.lock());
    }

    #[tokio::test(start_paused = true)]
    async fn text_input_flows_to_the_surface() {
        let surface = Arc::new(RecordingSurface::default());
        let model = Arc::new(ScriptedModel::new(&[
            r#"{"action_sequence": [{"action_name": "send_"#,
            r#"message", "content": "hello there"}]}"#,
        ]));
        let (agent, store) = build_agent(surface.clone(), model).await;

        agent.set_channel(channel()).await;
        agent.process_text("DVD", "hi").await.expect("process");

        drain_until(&surface, 1).await;
        assert_eq!(*surface.sent.lock(), vec!["hello there"]);

        // Both sides of the exchange are in history.
        let history = store.messages(channel()).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].author, "DVD");
        assert_eq!(history[1].author, "Alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_message_appears_once_per_request() {
        let surface = Arc::new(RecordingSurface::default());
        let model = Arc::new(ScriptedModel::new(&[
            r#"{"action_sequence": [{"action_name": "send_message", "content": "hey"}]}"#,
        ]));
        let (agent, _) = build_agent(surface.clone(), model.clone()).await;

        agent.set_channel(channel()).await;
        agent.process_text("DVD", "first question").await.expect("first");
        drain_until(&surface, 1).await;
        agent.process_text("DVD", "second question").await.expect("second");
        drain_until(&surface, 2).await;

        let requests = model.requests.lock();
        assert_eq!(requests.len(), 2);
        // The first request starts from a clean channel.
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[0].incoming.text, "first question");
        // The second sees the prior exchange as context, but never its own
        // incoming text.
        let context: Vec<&str> = requests[1].history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(context, vec!["first question", "hey"]);
        assert_eq!(requests[1].incoming.text, "second question");
    }

    #[tokio::test]
    async fn text_without_a_channel_is_a_typed_error() {
        let surface = Arc::new(RecordingSurface::default());
        let model = Arc::new(ScriptedModel::new(&[]));
        let (agent, _) = build_agent(surface, model).await;

        let error = agent.process_text("DVD", "hi").await.unwrap_err();
        assert!(matches!(error, Error::Agent(AgentError::ChannelNotSelected)));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_action_is_skipped_not_fatal() {
        let surface = Arc::new(RecordingSurface::default());
        let model = Arc::new(ScriptedModel::new(&[concat!(
            r#"{"action_sequence": ["#,
            r#"{"action_name": "no_such_action"}, "#,
            r#"{"action_name": "send_message", "content": "still here"}"#,
            r#"]}"#,
        )]));
        let (agent, _) = build_agent(surface.clone(), model).await;

        agent.set_channel(channel()).await;
        agent.process_text("DVD", "hi").await.expect("process");

        drain_until(&surface, 1).await;
        assert_eq!(*surface.sent.lock(), vec!["still here"]);
    }

    #[tokio::test(start_paused = true)]
    async fn model_failure_produces_a_diagnostic() {
        let surface = Arc::new(RecordingSurface::default());
        let (agent, _) = build_agent(surface.clone(), Arc::new(FailingModel)).await;

        agent.set_channel(channel()).await;
        agent.process_text("DVD", "hi").await.expect("process");

        assert_eq!(
            *surface.sent.lock(),
            vec!["(something went wrong, try again later)"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_command_wipes_history_and_confirms() {
        let surface = Arc::new(RecordingSurface {
            operator: true,
            ..Default::default()
        });
        let model = Arc::new(ScriptedModel::new(&[
            r#"{"action_sequence": [{"action_name": "send_message", "content": "hey"}]}"#,
        ]));
        let (agent, store) = build_agent(surface.clone(), model).await;

        agent.set_channel(channel()).await;
        agent.process_text("DVD", "hi").await.expect("process");
        drain_until(&surface, 1).await;

        agent.process_text("DVD", "!clear").await.expect("command");
        drain_until(&surface, 2).await;
        assert_eq!(surface.sent.lock().last().unwrap(), "Chat history cleared.");

        // Only the audit entry survives.
        let history = store.messages(channel()).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, "system");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_from_non_operator_is_refused() {
        let surface = Arc::new(RecordingSurface::default());
        let model = Arc::new(ScriptedModel::new(&[]));
        let (agent, store) = build_agent(surface.clone(), model).await;

        agent.set_channel(channel()).await;
        store.remember("facts", "keep me", None).await;
        agent
            .process_text("DVD", "!clear_notes")
            .await
            .expect("command");

        assert_eq!(
            *surface.sent.lock(),
            vec!["You are not allowed to do that."]
        );
        assert_eq!(store.cells("facts").await.len(), 1);
    }
}
