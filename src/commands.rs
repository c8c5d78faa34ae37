// Operations the front end drives. Each locks the store only for as long as a
// single store call takes; network work happens in a spawned task.

use crate::models::{ChatTurn, Conversation, Message, NewMessage};
use crate::state::{AppEvent, AppState};
use crate::stream::{StreamHandler, StreamOutcome};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lists all conversations, most recently created first.
pub async fn list_conversations(state: &AppState) -> Vec<Conversation> {
    log::debug!("Requested to list conversations");
    state.store.lock().await.conversations().to_vec()
}

/// Creates a conversation seeded with the configured system prompt and makes it active.
pub async fn create_conversation(state: &AppState) -> Uuid {
    let mut store = state.store.lock().await;
    store.new_conversation(state.system_prompt.as_deref())
}

pub async fn active_conversation(state: &AppState) -> Option<Conversation> {
    state.store.lock().await.active_conversation().cloned()
}

pub async fn get_conversation_messages(
    state: &AppState,
    conversation_id: Uuid,
) -> Result<Vec<Message>> {
    log::debug!("Requested messages for conversation ID: {}", conversation_id);
    let store = state.store.lock().await;
    store
        .conversation(conversation_id)
        .map(|c| c.messages.clone())
        .ok_or_else(|| anyhow!("Conversation {} not found", conversation_id))
}

pub async fn set_active_conversation(state: &AppState, conversation_id: Uuid) -> Result<()> {
    let mut store = state.store.lock().await;
    if store.conversation(conversation_id).is_none() {
        bail!("Conversation {} not found", conversation_id);
    }
    store.set_active(conversation_id);
    Ok(())
}

/// Deletes a conversation, stopping its generation first if one is running.
pub async fn delete_conversation(state: &AppState, conversation_id: Uuid) {
    log::warn!("Requested to delete conversation ID: {}", conversation_id);
    stop_generation(state, conversation_id);
    state.store.lock().await.delete_conversation(conversation_id);
}

pub async fn rename_conversation(
    state: &AppState,
    conversation_id: Uuid,
    new_title: &str,
) -> Result<()> {
    log::info!(
        "Requested to rename conversation {} to: {}",
        conversation_id,
        new_title
    );

    let new_title = new_title.trim();
    if new_title.is_empty() {
        bail!("New title cannot be empty.");
    }

    let mut store = state.store.lock().await;
    if store.conversation(conversation_id).is_none() {
        bail!("Conversation {} not found", conversation_id);
    }
    store.rename_conversation(conversation_id, new_title);
    Ok(())
}

/// Stops every running generation and drops all conversations.
pub async fn clear_conversations(state: &AppState) {
    log::warn!("Requested to clear all conversations");
    for entry in state.active_streams.iter() {
        entry.value().cancel();
    }
    state.store.lock().await.clear_all();
}

/// Signals the generation running for `conversation_id` to stop.
/// Returns whether there was one.
pub fn stop_generation(state: &AppState, conversation_id: Uuid) -> bool {
    match state.active_streams.get(&conversation_id) {
        Some(token) => {
            log::warn!("Stopping generation for conversation {}", conversation_id);
            token.cancel();
            true
        }
        None => false,
    }
}

/// A generation started by [`send_message`].
#[derive(Debug)]
pub struct Generation {
    pub conversation_id: Uuid,
    pub user_message_id: Uuid,
    pub task: JoinHandle<()>,
}

/// Stores the user message, opens an empty assistant reply and streams the
/// backend's answer into it in the background.
pub async fn send_message(
    state: &AppState,
    conversation_id: Uuid,
    content: &str,
) -> Result<Generation> {
    log::info!("Requested to send message to conversation ID: {}", conversation_id);

    let text = content.trim();
    if text.is_empty() {
        bail!("Message cannot be empty.");
    }

    let cancel = CancellationToken::new();
    match state.active_streams.entry(conversation_id) {
        Entry::Occupied(_) => bail!(
            "A reply is still being generated for conversation {}",
            conversation_id
        ),
        Entry::Vacant(slot) => {
            slot.insert(cancel.clone());
        }
    }

    let prepared = {
        let mut store = state.store.lock().await;
        match store.add_message(conversation_id, NewMessage::user(text)) {
            Some(user_message_id) => {
                // Placeholder the deltas stream into
                store.append_to_last_assistant(conversation_id, "");
                let history = store
                    .conversation(conversation_id)
                    .map(Conversation::history)
                    .unwrap_or_default();
                Some((user_message_id, history))
            }
            None => None,
        }
    };
    let Some((user_message_id, history)) = prepared else {
        state.active_streams.remove(&conversation_id);
        bail!("Conversation {} not found", conversation_id);
    };
    log::info!("User message {} saved.", user_message_id);

    let task = tokio::spawn(run_generation(
        state.clone(),
        conversation_id,
        history,
        cancel,
    ));

    Ok(Generation {
        conversation_id,
        user_message_id,
        task,
    })
}

async fn run_generation(
    state: AppState,
    conversation_id: Uuid,
    history: Vec<ChatTurn>,
    cancel: CancellationToken,
) {
    log::info!("Generation task started for conversation {}", conversation_id);
    let mut sink = StoreSink {
        state: state.clone(),
        conversation_id,
        chunks: 0,
    };

    let result = state
        .api_client
        .stream_chat_completion(&history, &cancel, &mut sink)
        .await;

    match result {
        Ok(StreamOutcome::Completed) => log::info!(
            "Generation for {} completed after {} chunks",
            conversation_id,
            sink.chunks
        ),
        Ok(StreamOutcome::Cancelled) => {
            log::warn!("Generation for {} was stopped", conversation_id)
        }
        Err(e) => {
            log::error!("Generation for {} failed: {}", conversation_id, e);
            state.emit(AppEvent::Notice {
                conversation_id,
                message: e.to_string(),
            });
        }
    }

    state.active_streams.remove(&conversation_id);
    state.emit(AppEvent::StreamFinished { conversation_id });
}

// Routes stream callbacks into the store and out to event subscribers
struct StoreSink {
    state: AppState,
    conversation_id: Uuid,
    chunks: usize,
}

#[async_trait]
impl StreamHandler for StoreSink {
    async fn on_delta(&mut self, delta: &str) {
        self.chunks += 1;
        self.state
            .store
            .lock()
            .await
            .append_to_last_assistant(self.conversation_id, delta);
        self.state.emit(AppEvent::AssistantChunk {
            conversation_id: self.conversation_id,
            delta: delta.to_string(),
        });
    }

    async fn on_done(&mut self) {
        log::debug!("Stream for {} reported done", self.conversation_id);
    }

    async fn on_error(&mut self, message: &str) {
        self.state.emit(AppEvent::Notice {
            conversation_id: self.conversation_id,
            message: message.to_string(),
        });
    }
}
