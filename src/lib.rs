// Declare the modules
pub mod api;
pub mod commands;
pub mod config;
pub mod models;
pub mod repl;
pub mod state;
pub mod storage;
pub mod store;
pub mod stream;

use crate::api::{ChatStreamClient, HttpStreamClient};
use config::Settings;
use state::AppState;
use std::sync::Arc;
use storage::FileStorage;
use store::ConversationStore;

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let settings = Settings::from_env()?;
    log::info!("Chat backend: {}", settings.api_base_url);

    // Restore saved conversations, then hand the store to the app state
    let storage = FileStorage::new(&settings.data_dir)?;
    let store = ConversationStore::load(storage);

    let api_client: Arc<dyn ChatStreamClient> = Arc::new(
        HttpStreamClient::new(settings.api_base_url.as_str()).options(settings.generation),
    );

    let app_state = AppState::new(store, api_client).with_system_prompt(settings.system_prompt);

    repl::run(app_state).await
}
