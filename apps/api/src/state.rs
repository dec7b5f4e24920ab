use std::sync::Arc;

use crate::chat::{ChatService, SessionStore};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::documents::DocumentNormalizer;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionStore>,
    pub chat: Arc<ChatService>,
    pub normalizer: DocumentNormalizer,
    /// The same dispatcher the chat service uses, so generation shares the rate ceiling.
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Dispatcher, normalizer: DocumentNormalizer) -> Self {
        let chat = ChatService::from_config(dispatcher.clone(), &config);
        Self {
            sessions: Arc::new(SessionStore::new(config.conversation_budget)),
            chat: Arc::new(chat),
            normalizer,
            dispatcher,
            config,
        }
    }
}
