//! The shared memory store.
//!
//! One store serves every channel worker concurrently, so all access goes
//! through a single `RwLock`. Persistence snapshots are taken under the read
//! lock and written outside it.

use crate::error::{DispatchError, Result};
use crate::memory::persist::Persistence;
use crate::memory::types::{MemoryCell, MemorySnapshot, StoredMessage};
use crate::ChannelId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Channel histories plus topic-keyed memory cells, with pluggable snapshot
/// persistence and a mutation counter driving periodic backups.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    persister: Arc<dyn Persistence>,
    backup_every: u64,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, Vec<StoredMessage>>,
    topics: HashMap<String, Vec<MemoryCell>>,
    mutations: u64,
    backed_up_at: u64,
}

impl MemoryStore {
    /// Open the store, loading the persisted snapshot if one exists.
    pub async fn open(persister: Arc<dyn Persistence>, backup_every: u64) -> Result<Self> {
        let mut inner = Inner::default();
        if let Some(snapshot) = persister.load().await? {
            for (key, messages) in snapshot.channels {
                match ChannelId::from_storage_key(&key) {
                    Some(channel) => {
                        inner.channels.insert(channel, messages);
                    }
                    None => tracing::warn!(key, "skipping unrecognized channel key in snapshot"),
                }
            }
            inner.topics = snapshot.topics;
            tracing::info!(
                channels = inner.channels.len(),
                topics = inner.topics.len(),
                "memory snapshot loaded"
            );
        }
        Ok(Self {
            inner: RwLock::new(inner),
            persister,
            backup_every: backup_every.max(1),
        })
    }

    /// Register a channel if it is not already known.
    pub async fn ensure_channel(&self, channel: ChannelId) {
        self.inner.write().await.channels.entry(channel).or_default();
    }

    /// Append a message to a channel's history.
    pub async fn add_message(&self, channel: ChannelId, message: StoredMessage) {
        let mut inner = self.inner.write().await;
        inner.channels.entry(channel).or_default().push(message);
        inner.mutations += 1;
    }

    /// Clone of a channel's history, oldest first.
    pub async fn messages(&self, channel: ChannelId) -> Vec<StoredMessage> {
        self.inner
            .read()
            .await
            .channels
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutate the stored message with `id` in place. Returns false if the
    /// channel has no message with that id.
    pub async fn update_message<F>(&self, channel: ChannelId, id: i64, mutate: F) -> bool
    where
        F: FnOnce(&mut StoredMessage),
    {
        let mut inner = self.inner.write().await;
        let Some(message) = inner
            .channels
            .get_mut(&channel)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == id))
        else {
            return false;
        };
        mutate(message);
        inner.mutations += 1;
        true
    }

    /// Append a cell under `topic`, generating an id when none is given.
    /// Returns the cell's id.
    pub async fn remember(&self, topic: &str, content: &str, id: Option<i64>) -> i64 {
        let mut inner = self.inner.write().await;
        let cells = inner.topics.entry(topic.to_string()).or_default();
        let mut id = id.unwrap_or_else(generate_cell_id);
        while cells.iter().any(|cell| cell.id == id) {
            id += 1;
        }
        cells.push(MemoryCell {
            id,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            text: content.to_string(),
        });
        inner.mutations += 1;
        id
    }

    /// Remove the cell with `id` from `topic`. No-op (returns false) if absent.
    pub async fn forget(&self, topic: &str, id: i64) -> bool {
        let mut inner = self.inner.write().await;
        let Some(cells) = inner.topics.get_mut(topic) else {
            return false;
        };
        let before = cells.len();
        cells.retain(|cell| cell.id != id);
        let removed = cells.len() != before;
        if removed {
            inner.mutations += 1;
        }
        removed
    }

    /// Replace the content of the cell with `id` under `topic`, keeping its
    /// id and timestamp.
    pub async fn modify(
        &self,
        topic: &str,
        id: i64,
        content: &str,
    ) -> std::result::Result<(), DispatchError> {
        let mut inner = self.inner.write().await;
        let cell = inner
            .topics
            .get_mut(topic)
            .and_then(|cells| cells.iter_mut().find(|cell| cell.id == id))
            .ok_or(DispatchError::CellNotFound {
                topic: topic.to_string(),
                id,
            })?;
        cell.text = content.to_string();
        inner.mutations += 1;
        Ok(())
    }

    /// Clone of a topic's cells, oldest first.
    pub async fn cells(&self, topic: &str) -> Vec<MemoryCell> {
        self.inner
            .read()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a channel's history. The channel itself remains registered.
    pub async fn clear_channel(&self, channel: ChannelId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(messages) = inner.channels.get_mut(&channel) else {
            return false;
        };
        messages.clear();
        inner.mutations += 1;
        true
    }

    /// Drop every memory cell in every topic.
    pub async fn clear_topics(&self) {
        let mut inner = self.inner.write().await;
        inner.topics.clear();
        inner.mutations += 1;
    }

    /// Current serializable state.
    pub async fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.read().await;
        MemorySnapshot {
            channels: inner
                .channels
                .iter()
                .map(|(channel, messages)| (channel.storage_key(), messages.clone()))
                .collect(),
            topics: inner.topics.clone(),
        }
    }

    /// Save the current state, and fire a backup if enough mutations have
    /// accumulated since the last one.
    pub async fn persist(&self) -> Result<()> {
        let (snapshot, backup_due) = {
            let mut inner = self.inner.write().await;
            let backup_due = inner.mutations.saturating_sub(inner.backed_up_at) >= self.backup_every;
            if backup_due {
                inner.backed_up_at = inner.mutations;
            }
            let snapshot = MemorySnapshot {
                channels: inner
                    .channels
                    .iter()
                    .map(|(channel, messages)| (channel.storage_key(), messages.clone()))
                    .collect(),
                topics: inner.topics.clone(),
            };
            (snapshot, backup_due)
        };

        self.persister.save(&snapshot).await?;
        if backup_due {
            self.persister.backup(&snapshot).await?;
        }
        Ok(())
    }
}

/// Time-derived cell id, matching the original scheme. Uniqueness within a
/// topic is enforced by the caller.
fn generate_cell_id() -> i64 {
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    (now * 23_456.0).round() as i64 + 123_456_789
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::persist::Persistence;
    use crate::ChannelKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// In-memory persistence double that counts calls.
    #[derive(Default)]
    struct RecordingPersistence {
        saves: Mutex<u64>,
        backups: Mutex<u64>,
        initial: Mutex<Option<MemorySnapshot>>,
    }

    #[async_trait]
    impl Persistence for RecordingPersistence {
        async fn save(&self, _snapshot: &MemorySnapshot) -> Result<()> {
            *self.saves.lock() += 1;
            Ok(())
        }

        async fn load(&self) -> Result<Option<MemorySnapshot>> {
            Ok(self.initial.lock().take())
        }

        async fn backup(&self, _snapshot: &MemorySnapshot) -> Result<()> {
            *self.backups.lock() += 1;
            Ok(())
        }
    }

    fn channel() -> ChannelId {
        ChannelId::new(ChannelKind::Console, 0)
    }

    async fn fresh_store(backup_every: u64) -> (MemoryStore, Arc<RecordingPersistence>) {
        let persistence = Arc::new(RecordingPersistence::default());
        let store = MemoryStore::open(persistence.clone(), backup_every)
            .await
            .expect("open");
        (store, persistence)
    }

    #[tokio::test]
    async fn remember_then_forget_leaves_topic_empty() {
        let (store, _) = fresh_store(100).await;
        let id = store.remember("facts", "x", None).await;
        assert!(store.forget("facts", id).await);
        assert!(store.cells("facts").await.is_empty());
    }

    #[tokio::test]
    async fn forget_of_unknown_id_is_a_noop() {
        let (store, _) = fresh_store(100).await;
        store.remember("facts", "x", Some(1)).await;
        assert!(!store.forget("facts", 999).await);
        assert_eq!(store.cells("facts").await.len(), 1);
    }

    #[tokio::test]
    async fn modify_writes_the_replacement_back() {
        let (store, _) = fresh_store(100).await;
        let id = store.remember("facts", "old", None).await;
        store.modify("facts", id, "new").await.expect("modify");
        let cells = store.cells("facts").await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].text, "new");
        assert_eq!(cells[0].id, id);
    }

    #[tokio::test]
    async fn modify_unknown_id_is_a_typed_error() {
        let (store, _) = fresh_store(100).await;
        let error = store.modify("facts", 5, "new").await.unwrap_err();
        assert!(matches!(error, DispatchError::CellNotFound { id: 5, .. }));
    }

    #[tokio::test]
    async fn duplicate_explicit_ids_are_disambiguated() {
        let (store, _) = fresh_store(100).await;
        let first = store.remember("facts", "a", Some(7)).await;
        let second = store.remember("facts", "b", Some(7)).await;
        assert_eq!(first, 7);
        assert_ne!(second, 7);
        assert_eq!(store.cells("facts").await.len(), 2);
    }

    #[tokio::test]
    async fn update_message_mutates_metainfo_in_place() {
        let (store, _) = fresh_store(100).await;
        store
            .add_message(channel(), StoredMessage::new(10, "Alpha", "hello"))
            .await;
        let updated = store
            .update_message(channel(), 10, |message| {
                message.text = "hello again".into();
                message.metainfo.insert("edited".into(), true.into());
            })
            .await;
        assert!(updated);
        let messages = store.messages(channel()).await;
        assert_eq!(messages[0].text, "hello again");
        assert_eq!(messages[0].metainfo["edited"], true);
    }

    #[tokio::test]
    async fn backup_fires_every_n_mutations() {
        let (store, persistence) = fresh_store(3).await;
        for i in 0..2 {
            store.remember("facts", &format!("{i}"), None).await;
            store.persist().await.expect("persist");
        }
        assert_eq!(*persistence.backups.lock(), 0);

        store.remember("facts", "third", None).await;
        store.persist().await.expect("persist");
        assert_eq!(*persistence.backups.lock(), 1);
        assert_eq!(*persistence.saves.lock(), 3);
    }

    #[tokio::test]
    async fn reopen_restores_snapshot() {
        let persistence = Arc::new(RecordingPersistence::default());
        let mut snapshot = MemorySnapshot::default();
        snapshot
            .channels
            .insert(channel().storage_key(), vec![StoredMessage::new(1, "user", "hi")]);
        snapshot.topics.insert(
            "facts".into(),
            vec![MemoryCell {
                id: 1,
                timestamp: 0.0,
                text: "x".into(),
            }],
        );
        *persistence.initial.lock() = Some(snapshot);

        let store = MemoryStore::open(persistence, 100).await.expect("open");
        assert_eq!(store.messages(channel()).await.len(), 1);
        assert_eq!(store.cells("facts").await.len(), 1);
    }
}
