use crate::api::ChatStreamClient;
use crate::store::ConversationStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something the front end should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// A fragment of the assistant reply was stored.
    AssistantChunk { conversation_id: Uuid, delta: String },
    /// The generation for this conversation is over: completed, failed or stopped.
    StreamFinished { conversation_id: Uuid },
    /// A transient, user-visible message (the toast of a browser client).
    Notice { conversation_id: Uuid, message: String },
}

// Core application state shared by commands and background generation tasks
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<ConversationStore>>,
    pub api_client: Arc<dyn ChatStreamClient>,
    // One token per conversation with a generation in flight
    pub active_streams: Arc<DashMap<Uuid, CancellationToken>>,
    pub system_prompt: Option<String>,
    events: broadcast::Sender<AppEvent>,
}

impl AppState {
    pub fn new(store: ConversationStore, api_client: Arc<dyn ChatStreamClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: Arc::new(Mutex::new(store)),
            api_client,
            active_streams: Arc::new(DashMap::new()),
            system_prompt: None,
            events,
        }
    }

    /// System prompt seeded into conversations created through the commands.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        // No subscribers is fine; the store already holds the result
        if self.events.send(event).is_err() {
            log::debug!("No event subscribers");
        }
    }

    pub fn is_generating(&self, conversation_id: Uuid) -> bool {
        self.active_streams.contains_key(&conversation_id)
    }
}
