//! Level-triggered cancellation signal shared through the database.
//!
//! A generation is cancellable while a token row exists for its conversation.
//! Cancelling deletes the row; the running generation notices on its next
//! poll. Nothing is pushed to the generation, so a cancel issued before the
//! token is registered is simply lost.

use crate::db::models::GenerationToken;
use crate::db::{Database, DbResult};
use std::sync::Arc;

#[derive(Clone)]
pub struct CancellationRegistry {
    db: Arc<Database>,
}

impl CancellationRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn register(&self, conversation_id: &str, message_id: &str) -> DbResult<GenerationToken> {
        let token = self.db.insert_generation_token(conversation_id, message_id)?;
        tracing::debug!(
            conversation_id,
            message_id,
            token_id = %token.id,
            "registered generation token"
        );
        Ok(token)
    }

    pub fn is_active(&self, conversation_id: &str) -> DbResult<bool> {
        self.db.has_generation_token(conversation_id)
    }

    /// Requests a stop. Idempotent: with nothing running this removes nothing.
    pub fn cancel(&self, conversation_id: &str) -> DbResult<()> {
        let removed = self.db.delete_generation_tokens(conversation_id)?;
        if removed > 0 {
            tracing::info!(conversation_id, removed, "generation cancel requested");
        } else {
            tracing::debug!(conversation_id, "cancel with no active generation");
        }
        Ok(())
    }

    /// End-of-run cleanup so no stale token outlives its generation.
    pub fn clear(&self, conversation_id: &str) -> DbResult<()> {
        self.db.delete_generation_tokens(conversation_id)?;
        Ok(())
    }
}
