//! Messaging-surface trait and dynamic dispatch companion.

use crate::error::DispatchError;
use crate::ChannelId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Surface call result type.
pub type SurfaceResult<T> = std::result::Result<T, DispatchError>;

/// A message as the surface sees it.
#[derive(Debug, Clone)]
pub struct SurfaceMessage {
    pub id: i64,
    pub author: String,
    pub text: String,
}

/// Static trait for messaging-surface adapters.
/// Use this for type-safe implementations.
pub trait ChatSurface: Send + Sync + 'static {
    /// Unique name for this adapter.
    fn name(&self) -> &str;

    /// Send text to a channel, optionally as a reply. Returns the
    /// platform-assigned message id.
    fn send(
        &self,
        channel: ChannelId,
        text: &str,
        reply_to: Option<i64>,
    ) -> impl Future<Output = SurfaceResult<i64>> + Send;

    /// Edit a previously sent message.
    fn edit(
        &self,
        channel: ChannelId,
        message_id: i64,
        text: &str,
    ) -> impl Future<Output = SurfaceResult<()>> + Send;

    /// Fetch a message by id. `DispatchError::MessageNotFound` if absent.
    fn fetch(
        &self,
        channel: ChannelId,
        message_id: i64,
    ) -> impl Future<Output = SurfaceResult<SurfaceMessage>> + Send;

    /// Attach an emoji reaction to a message.
    fn react(
        &self,
        channel: ChannelId,
        message_id: i64,
        emoji: &str,
    ) -> impl Future<Output = SurfaceResult<()>> + Send;

    /// Show a typing indicator for roughly `duration`.
    fn set_typing(
        &self,
        channel: ChannelId,
        duration: Duration,
    ) -> impl Future<Output = SurfaceResult<()>> + Send {
        let _ = (channel, duration);
        async { Ok(()) }
    }

    /// Whether `author` may run privileged administrative commands.
    fn is_operator(
        &self,
        channel: ChannelId,
        author: &str,
    ) -> impl Future<Output = bool> + Send {
        let _ = (channel, author);
        async { false }
    }

    /// Resolve a display name to a platform member id for mention rendering.
    fn member_id(
        &self,
        channel: ChannelId,
        name: &str,
    ) -> impl Future<Output = Option<i64>> + Send {
        let _ = (channel, name);
        async { None }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn ChatSurfaceDyn>` for storing different adapters.
pub trait ChatSurfaceDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn send<'a>(
        &'a self,
        channel: ChannelId,
        text: &'a str,
        reply_to: Option<i64>,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<i64>> + Send + 'a>>;

    fn edit<'a>(
        &'a self,
        channel: ChannelId,
        message_id: i64,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<()>> + Send + 'a>>;

    fn fetch<'a>(
        &'a self,
        channel: ChannelId,
        message_id: i64,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<SurfaceMessage>> + Send + 'a>>;

    fn react<'a>(
        &'a self,
        channel: ChannelId,
        message_id: i64,
        emoji: &'a str,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<()>> + Send + 'a>>;

    fn set_typing<'a>(
        &'a self,
        channel: ChannelId,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<()>> + Send + 'a>>;

    fn is_operator<'a>(
        &'a self,
        channel: ChannelId,
        author: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    fn member_id<'a>(
        &'a self,
        channel: ChannelId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing ChatSurface automatically
/// implements ChatSurfaceDyn.
impl<T: ChatSurface> ChatSurfaceDyn for T {
    fn name(&self) -> &str {
        ChatSurface::name(self)
    }

    fn send<'a>(
        &'a self,
        channel: ChannelId,
        text: &'a str,
        reply_to: Option<i64>,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<i64>> + Send + 'a>> {
        Box::pin(ChatSurface::send(self, channel, text, reply_to))
    }

    fn edit<'a>(
        &'a self,
        channel: ChannelId,
        message_id: i64,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<()>> + Send + 'a>> {
        Box::pin(ChatSurface::edit(self, channel, message_id, text))
    }

    fn fetch<'a>(
        &'a self,
        channel: ChannelId,
        message_id: i64,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<SurfaceMessage>> + Send + 'a>> {
        Box::pin(ChatSurface::fetch(self, channel, message_id))
    }

    fn react<'a>(
        &'a self,
        channel: ChannelId,
        message_id: i64,
        emoji: &'a str,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<()>> + Send + 'a>> {
        Box::pin(ChatSurface::react(self, channel, message_id, emoji))
    }

    fn set_typing<'a>(
        &'a self,
        channel: ChannelId,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = SurfaceResult<()>> + Send + 'a>> {
        Box::pin(ChatSurface::set_typing(self, channel, duration))
    }

    fn is_operator<'a>(
        &'a self,
        channel: ChannelId,
        author: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(ChatSurface::is_operator(self, channel, author))
    }

    fn member_id<'a>(
        &'a self,
        channel: ChannelId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + 'a>> {
        Box::pin(ChatSurface::member_id(self, channel, name))
    }
}

/// Stdout-backed surface for the console REPL. Message ids are a local
/// counter; the console user is always an operator.
pub struct ConsoleSurface {
    persona: String,
    next_id: AtomicI64,
    sent: Mutex<HashMap<i64, SurfaceMessage>>,
}

impl ConsoleSurface {
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            next_id: AtomicI64::new(1),
            sent: Mutex::new(HashMap::new()),
        }
    }
}

impl ChatSurface for ConsoleSurface {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(
        &self,
        _channel: ChannelId,
        text: &str,
        reply_to: Option<i64>,
    ) -> SurfaceResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match reply_to {
            Some(target) => println!("{} (re #{target}): {text}", self.persona),
            None => println!("{}: {text}", self.persona),
        }
        self.sent.lock().expect("console surface lock").insert(
            id,
            SurfaceMessage {
                id,
                author: self.persona.clone(),
                text: text.to_string(),
            },
        );
        Ok(id)
    }

    async fn edit(&self, _channel: ChannelId, message_id: i64, text: &str) -> SurfaceResult<()> {
        let mut sent = self.sent.lock().expect("console surface lock");
        let message = sent
            .get_mut(&message_id)
            .ok_or(DispatchError::MessageNotFound { message_id })?;
        message.text = text.to_string();
        println!("{} (edited #{message_id}): {text}", self.persona);
        Ok(())
    }

    async fn fetch(&self, _channel: ChannelId, message_id: i64) -> SurfaceResult<SurfaceMessage> {
        self.sent
            .lock()
            .expect("console surface lock")
            .get(&message_id)
            .cloned()
            .ok_or(DispatchError::MessageNotFound { message_id })
    }

    async fn react(&self, _channel: ChannelId, message_id: i64, emoji: &str) -> SurfaceResult<()> {
        if !self
            .sent
            .lock()
            .expect("console surface lock")
            .contains_key(&message_id)
        {
            return Err(DispatchError::MessageNotFound { message_id });
        }
        println!("{} reacted to #{message_id} with {emoji}", self.persona);
        Ok(())
    }

    async fn is_operator(&self, _channel: ChannelId, _author: &str) -> bool {
        true
    }
}
