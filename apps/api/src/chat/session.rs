use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::conversation::{ConversationState, TurnBudget};
use crate::documents::Attachment;

/// One chat session: its conversation and the attachments staged for its next turn.
pub struct ChatSession {
    pub id: Uuid,
    pub conversation: ConversationState,
    pub staged: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

pub type SessionHandle = Arc<Mutex<ChatSession>>;

/// In-memory sessions. Nothing is persisted; ending a session drops its state.
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    budget: TurnBudget,
}

impl SessionStore {
    pub fn new(budget: TurnBudget) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            budget,
        }
    }

    pub async fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        let session = ChatSession {
            id,
            conversation: ConversationState::new(self.budget),
            staged: Vec::new(),
            created_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        info!("Session {id} started");
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Resets and drops the session. Returns `false` when it did not exist.
    pub async fn end(&self, id: Uuid) -> bool {
        let Some(handle) = self.sessions.write().await.remove(&id) else {
            return false;
        };
        let mut session = handle.lock().await;
        let turns = session.conversation.turns().len();
        session.conversation.reset();
        session.staged.clear();
        info!(
            "Session {} ended after {}s with {turns} stored turn(s)",
            session.id,
            (Utc::now() - session.created_at).num_seconds()
        );
        true
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
