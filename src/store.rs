//! The conversation table and every mutation that may touch it.
//!
//! Mutations are synchronous. Each one that changes state is followed by a
//! commit: the collection and active id are serialized into the storage slot
//! and the revision published on the watch channel is bumped.

use crate::models::{Conversation, Message, NewMessage, Role, DEFAULT_TITLE};
use crate::storage::StorageProvider;
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Storage slot holding the persisted conversations.
pub const STATE_SLOT: &str = "chat_state";

/// Bumped whenever the persisted layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// Read-only copy of the store's contents.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub conversations: Vec<Conversation>,
    pub active_id: Option<Uuid>,
}

#[derive(Deserialize, Debug)]
struct PersistedState {
    version: u32,
    state: StoreSnapshot,
}

// Borrowed form of `PersistedState`, so a commit never clones the history
#[derive(Serialize)]
struct PersistedStateRef<'a> {
    version: u32,
    state: StoreSnapshotRef<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreSnapshotRef<'a> {
    conversations: &'a [Conversation],
    active_id: Option<Uuid>,
}

pub struct ConversationStore {
    conversations: Vec<Conversation>,
    active_id: Option<Uuid>,
    storage: Box<dyn StorageProvider>,
    revision: watch::Sender<u64>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("conversations", &self.conversations.len())
            .field("active_id", &self.active_id)
            .finish()
    }
}

impl ConversationStore {
    /// Creates a store, restoring whatever compatible state `storage` holds.
    ///
    /// Persisted data written under another schema version, or that fails to
    /// parse, is discarded and the store starts empty.
    pub fn load(storage: impl StorageProvider + 'static) -> Self {
        let mut storage: Box<dyn StorageProvider> = Box::new(storage);
        let snapshot = match Self::restore(storage.as_ref()) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => StoreSnapshot::default(),
            Err(e) => {
                log::warn!("Discarding saved conversations: {:#}", e);
                if let Err(e) = storage.remove(STATE_SLOT) {
                    log::error!("Failed to remove saved conversations: {:?}", e);
                }
                StoreSnapshot::default()
            }
        };
        log::info!(
            "Loaded {} conversations (active: {:?})",
            snapshot.conversations.len(),
            snapshot.active_id
        );

        let (revision, _) = watch::channel(0);
        let mut store = Self {
            conversations: snapshot.conversations,
            active_id: snapshot.active_id,
            storage,
            revision,
        };
        store.repair_active();
        store
    }

    fn restore(storage: &dyn StorageProvider) -> Result<Option<StoreSnapshot>, anyhow::Error> {
        let Some(raw) = storage.read(STATE_SLOT)? else {
            return Ok(None);
        };
        let persisted: PersistedState =
            serde_json::from_str(&raw).context("Failed to parse saved conversations")?;
        if persisted.version != SCHEMA_VERSION {
            anyhow::bail!(
                "saved schema version {} does not match {}",
                persisted.version,
                SCHEMA_VERSION
            );
        }
        Ok(Some(persisted.state))
    }

    // A restored active id may point at nothing if the saved file was edited by hand
    fn repair_active(&mut self) {
        if let Some(id) = self.active_id {
            if self.index_of(id).is_none() {
                self.active_id = self.conversations.first().map(|c| c.id);
            }
        }
    }

    /// Serializes the current state into storage and notifies subscribers.
    /// Storage failures are logged; the in-memory state stays authoritative.
    fn commit(&mut self) {
        let persisted = PersistedStateRef {
            version: SCHEMA_VERSION,
            state: StoreSnapshotRef {
                conversations: &self.conversations,
                active_id: self.active_id,
            },
        };
        match serde_json::to_string(&persisted) {
            Ok(json) => {
                if let Err(e) = self.storage.write(STATE_SLOT, &json) {
                    log::error!("Failed to persist conversations: {:?}", e);
                }
            }
            Err(e) => log::error!("Failed to serialize conversations: {:?}", e),
        }
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn index_of(&self, id: Uuid) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    // --- Read side ---

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: Uuid) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.active_id
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active_id.and_then(|id| self.conversation(id))
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.conversations.clone(),
            active_id: self.active_id,
        }
    }

    /// Receiver whose value changes after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    // --- Mutations ---

    /// Creates a conversation at the front of the list and makes it active.
    pub fn new_conversation(&mut self, seed_system_prompt: Option<&str>) -> Uuid {
        let conversation = Conversation::new(seed_system_prompt);
        let id = conversation.id;
        self.conversations.insert(0, conversation);
        self.active_id = Some(id);
        log::info!("Created conversation {}", id);
        self.commit();
        id
    }

    /// Removes a conversation. If it was active, the new first conversation
    /// (or nothing) becomes active.
    pub fn delete_conversation(&mut self, id: Uuid) {
        let Some(index) = self.index_of(id) else {
            log::warn!("Attempted to delete non-existent conversation: {}", id);
            return;
        };
        self.conversations.remove(index);
        if self.active_id == Some(id) {
            self.active_id = self.conversations.first().map(|c| c.id);
        }
        log::warn!("Deleted conversation {}", id);
        self.commit();
    }

    pub fn rename_conversation(&mut self, id: Uuid, title: impl Into<String>) {
        let title = title.into();
        let Some(conversation) = self.get_mut(id) else {
            log::warn!("Attempted to rename non-existent conversation: {}", id);
            return;
        };
        conversation.title = title;
        conversation.updated_at = Utc::now();
        log::info!("Renamed conversation {}", id);
        self.commit();
    }

    /// Makes an existing conversation active.
    pub fn set_active(&mut self, id: Uuid) {
        if self.index_of(id).is_none() {
            log::warn!("Attempted to activate non-existent conversation: {}", id);
            return;
        }
        if self.active_id != Some(id) {
            self.active_id = Some(id);
            self.commit();
        }
    }

    /// Appends a message and returns its id, or `None` when the conversation
    /// is unknown or the requested id is already taken.
    pub fn add_message(&mut self, conversation_id: Uuid, msg: NewMessage) -> Option<Uuid> {
        let Some(conversation) = self.get_mut(conversation_id) else {
            log::warn!(
                "Attempted to add message to non-existent conversation: {}",
                conversation_id
            );
            return None;
        };

        let id = msg.id.unwrap_or_else(Uuid::new_v4);
        if conversation.has_message(id) {
            log::warn!(
                "Message {} already exists in conversation {}, ignoring",
                id,
                conversation_id
            );
            return None;
        }

        conversation.messages.push(Message {
            id,
            role: msg.role,
            content: msg.content,
            created_at: msg.created_at.unwrap_or_else(Utc::now),
        });
        if conversation.title == DEFAULT_TITLE {
            conversation.title = conversation.auto_title();
        }
        conversation.updated_at = Utc::now();
        log::debug!("Added {} message {} to {}", msg.role, id, conversation_id);
        self.commit();
        Some(id)
    }

    /// Streams `delta` into the trailing assistant message, opening one if the
    /// conversation does not end with an assistant message.
    pub fn append_to_last_assistant(&mut self, conversation_id: Uuid, delta: &str) {
        let Some(conversation) = self.get_mut(conversation_id) else {
            log::warn!(
                "Attempted to stream into non-existent conversation: {}",
                conversation_id
            );
            return;
        };

        match conversation.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => last.content.push_str(delta),
            _ => {
                let msg = Message::new(Role::Assistant, delta);
                log::debug!("Opened assistant message {} in {}", msg.id, conversation_id);
                conversation.messages.push(msg);
            }
        }
        conversation.updated_at = Utc::now();
        self.commit();
    }

    /// Drops every conversation.
    pub fn clear_all(&mut self) {
        log::warn!("Clearing {} conversations", self.conversations.len());
        self.conversations.clear();
        self.active_id = None;
        self.commit();
    }
}
