pub mod chat;
pub mod settings;

use crate::db::models::Conversation;
use crate::db::{Database, DbError};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("conversation {0} does not belong to the caller")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(DbError),
}

impl From<DbError> for CommandError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { .. } => CommandError::NotFound(err.to_string()),
            other => CommandError::Storage(other),
        }
    }
}

impl Serialize for CommandError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Loads the conversation and checks the caller owns it.
pub(crate) fn owned_conversation(
    db: &Database,
    user_id: &str,
    conversation_id: &str,
) -> Result<Conversation, CommandError> {
    let conversation = db.get_conversation(conversation_id)?.ok_or_else(|| {
        CommandError::NotFound(format!("conversation not found: {}", conversation_id))
    })?;
    if conversation.owner != user_id {
        tracing::warn!(conversation_id, user_id, "rejected access to foreign conversation");
        return Err(CommandError::Unauthorized(conversation_id.to_string()));
    }
    Ok(conversation)
}
