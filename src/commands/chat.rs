use super::{owned_conversation, CommandError};
use crate::completion::GenerationHandle;
use crate::db::models::{ContentPart, Conversation, Message, NewMessage};
use crate::AppState;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendMessage {
    pub content: String,
    pub parts: Option<Vec<ContentPart>>,
    pub file_ids: Option<Vec<String>>,
    /// Overrides the conversation's model for this turn.
    pub model: Option<String>,
}

impl SendMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// The stored user message plus the generation answering it.
pub struct SentMessage {
    pub message: Message,
    pub generation: GenerationHandle,
}

/// Explicit model, then the conversation's, then the saved default, then config.
fn resolve_model(
    state: &AppState,
    requested: Option<String>,
    conversation: &Conversation,
) -> Result<String, CommandError> {
    if let Some(model) = requested
        .filter(|m| !m.trim().is_empty())
        .or_else(|| conversation.model.clone())
    {
        return Ok(model);
    }
    Ok(state
        .db
        .get_setting("default_model")?
        .unwrap_or_else(|| state.config.default_model.clone()))
}

pub fn create_conversation(
    state: &AppState,
    user_id: &str,
    title: &str,
    model: Option<&str>,
) -> Result<Conversation, CommandError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(CommandError::InvalidInput("title must not be empty".into()));
    }
    Ok(state.db.create_conversation(user_id, title, model)?)
}

pub fn list_conversations(state: &AppState, user_id: &str) -> Result<Vec<Conversation>, CommandError> {
    Ok(state.db.list_conversations(user_id)?)
}

pub fn delete_conversation(state: &AppState, user_id: &str, id: &str) -> Result<(), CommandError> {
    owned_conversation(&state.db, user_id, id)?;
    state.db.delete_conversation(id)?;
    Ok(())
}

pub fn rename_conversation(
    state: &AppState,
    user_id: &str,
    id: &str,
    title: &str,
) -> Result<(), CommandError> {
    owned_conversation(&state.db, user_id, id)?;
    state.db.update_conversation_title(id, title.trim())?;
    Ok(())
}

/// Observer read surface: re-query while any message is streaming to follow progress.
pub fn get_messages(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<Vec<Message>, CommandError> {
    owned_conversation(&state.db, user_id, conversation_id)?;
    Ok(state.db.get_messages(conversation_id)?)
}

/// Saves the user turn and starts the reply in the background.
pub async fn send_message(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
    input: SendMessage,
) -> Result<SentMessage, CommandError> {
    let conversation = owned_conversation(&state.db, user_id, conversation_id)?;

    let has_parts = input.parts.as_ref().map_or(false, |p| !p.is_empty());
    if input.content.trim().is_empty() && !has_parts {
        return Err(CommandError::InvalidInput("message must not be empty".into()));
    }

    let model = resolve_model(state, input.model.clone(), &conversation)?;

    let mut new_message = NewMessage::user(input.content);
    if let Some(parts) = input.parts.filter(|p| !p.is_empty()) {
        new_message = new_message.with_parts(parts);
    }
    if let Some(file_ids) = input.file_ids.filter(|f| !f.is_empty()) {
        new_message = new_message.with_file_ids(file_ids);
    }
    let message = state.db.add_message(conversation_id, new_message)?;

    tracing::debug!(conversation_id, message_id = %message.id, model = %model, "dispatching generation");
    let generation = state
        .dispatcher
        .dispatch(conversation_id.to_string(), model);

    Ok(SentMessage {
        message,
        generation,
    })
}

/// Stops the running generation, if any. Succeeds when nothing is running.
pub fn cancel_generation(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<(), CommandError> {
    owned_conversation(&state.db, user_id, conversation_id)?;
    state.registry.cancel(conversation_id)?;
    Ok(())
}

/// Deletes a message; deleting a user message also removes its reply.
pub fn delete_message(
    state: &AppState,
    user_id: &str,
    message_id: &str,
) -> Result<Vec<String>, CommandError> {
    let message = state
        .db
        .get_message(message_id)?
        .ok_or_else(|| CommandError::NotFound(format!("message not found: {}", message_id)))?;
    owned_conversation(&state.db, user_id, &message.conversation_id)?;
    Ok(state.db.delete_message_cascade(message_id)?)
}
