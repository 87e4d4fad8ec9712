//! Per-channel action queues and their workers.
//!
//! Each active channel owns one worker task draining an unbounded FIFO.
//! Ordering within a channel is strict; channels never block each other.
//! Workers retire after an idle timeout and are rebuilt transparently on the
//! next activation. Generation numbers fence stale producers: a stream task
//! spawned before a cancel can never feed the queue built after it.

use crate::action::Action;
use crate::dispatch::Dispatcher;
use crate::memory::store::MemoryStore;
use crate::{ChannelId, RequestContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One action plus the request that produced it.
pub struct QueuedAction {
    pub ctx: Arc<RequestContext>,
    pub action: Action,
}

struct ChannelHandle {
    generation: u64,
    queue_tx: mpsc::UnboundedSender<QueuedAction>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    stream_task: Option<JoinHandle<()>>,
}

/// Registry of live channel workers.
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, ChannelHandle>>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<MemoryStore>,
    idle_timeout: Duration,
    generations: AtomicU64,
}

impl ChannelRegistry {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<MemoryStore>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            dispatcher,
            store,
            idle_timeout,
            generations: AtomicU64::new(0),
        }
    }

    /// Ensure a worker exists for `channel`, returning its generation and
    /// cancellation token.
    pub async fn activate(self: &Arc<Self>, channel: ChannelId) -> (u64, CancellationToken) {
        let mut channels = self.channels.lock().await;
        if let Some(handle) = channels.get(&channel) {
            return (handle.generation, handle.cancel.clone());
        }
        let handle = self.build_worker(channel);
        let result = (handle.generation, handle.cancel.clone());
        channels.insert(channel, handle);
        result
    }

    /// Queue an action for `channel`. Returns false when the worker for
    /// `generation` no longer exists, which tells a stale producer to stop.
    ///
    /// Sending happens under the registry lock so an idle worker that is
    /// about to retire either sees this action or has already deregistered.
    pub async fn enqueue(&self, channel: ChannelId, generation: u64, queued: QueuedAction) -> bool {
        let channels = self.channels.lock().await;
        match channels.get(&channel) {
            Some(handle) if handle.generation == generation => {
                handle.queue_tx.send(queued).is_ok()
            }
            _ => false,
        }
    }

    /// Remember the stream-producer task feeding `generation`, so a later
    /// cancel can await it.
    pub async fn attach_stream_task(
        &self,
        channel: ChannelId,
        generation: u64,
        task: JoinHandle<()>,
    ) {
        let mut channels = self.channels.lock().await;
        match channels.get_mut(&channel) {
            Some(handle) if handle.generation == generation => handle.stream_task = Some(task),
            // The worker was torn down between spawn and attach; the token
            // is already cancelled, so just let the task drain.
            _ => {}
        }
    }

    /// Discard everything in flight for `channel` and return a fresh worker.
    /// Queued actions, the running action, and the stream producer all stop;
    /// the returned generation is ready for new input.
    pub async fn cancel_and_rebuild(
        self: &Arc<Self>,
        channel: ChannelId,
    ) -> (u64, CancellationToken) {
        let removed = {
            let mut channels = self.channels.lock().await;
            channels.remove(&channel)
        };

        if let Some(handle) = removed {
            handle.cancel.cancel();
            // Await outside the lock; the worker's idle path takes it.
            if let Err(error) = handle.worker.await {
                tracing::warn!(%channel, %error, "channel worker panicked");
            }
            if let Some(stream_task) = handle.stream_task {
                if let Err(error) = stream_task.await {
                    tracing::warn!(%channel, %error, "stream producer panicked");
                }
            }
            tracing::debug!(%channel, generation = handle.generation, "channel worker cancelled");
        }

        self.activate(channel).await
    }

    /// Whether a worker currently exists for `channel`.
    pub async fn is_active(&self, channel: ChannelId) -> bool {
        self.channels.lock().await.contains_key(&channel)
    }

    /// Cancel every worker and wait for them to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<ChannelHandle> = {
            let mut channels = self.channels.lock().await;
            channels.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.cancel.cancel();
            let _ = handle.worker.await;
            if let Some(stream_task) = handle.stream_task {
                let _ = stream_task.await;
            }
        }
    }

    fn build_worker(self: &Arc<Self>, channel: ChannelId) -> ChannelHandle {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = self.spawn_worker(channel, generation, queue_rx, cancel.clone());
        ChannelHandle {
            generation,
            queue_tx,
            cancel,
            worker,
            stream_task: None,
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        channel: ChannelId,
        generation: u64,
        mut queue_rx: mpsc::UnboundedReceiver<QueuedAction>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(%channel, generation, "channel worker started");
            loop {
                let queued = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = tokio::time::timeout(registry.idle_timeout, queue_rx.recv()) => {
                        match received {
                            Ok(Some(queued)) => queued,
                            Ok(None) => break,
                            Err(_elapsed) => {
                                // Idle. Deregister, unless an action slipped
                                // in while we were deciding: enqueue sends
                                // under this same lock.
                                let mut channels = registry.channels.lock().await;
                                match queue_rx.try_recv() {
                                    Ok(queued) => {
                                        drop(channels);
                                        queued
                                    }
                                    Err(_) => {
                                        if channels
                                            .get(&channel)
                                            .is_some_and(|handle| handle.generation == generation)
                                        {
                                            channels.remove(&channel);
                                        }
                                        tracing::debug!(%channel, generation, "idle timeout, worker retiring");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                };

                let kind = queued.action.kind();
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = registry.dispatcher.dispatch(&queued.ctx, queued.action) => result,
                };
                if let Err(error) = outcome {
                    tracing::warn!(%channel, kind, %error, "action failed, continuing with queue");
                }
                if let Err(error) = registry.store.persist().await {
                    tracing::warn!(%channel, %error, "persist after action failed");
                }
            }
        })
    }
}
