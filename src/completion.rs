//! Produces one assistant reply per run, streamed into the message store.
//!
//! A run creates an empty placeholder message, registers a cancellation
//! token, then grows the placeholder in place as deltas arrive. Every run
//! ends with the placeholder finalized (`is_streaming = false`) and the
//! token cleared, whatever happened upstream.

use crate::cancellation::CancellationRegistry;
use crate::db::models::{self, Conversation, Message, MessagePatch, NewMessage};
use crate::db::{Database, DbError};
use crate::llm::sse::{SseEvent, SseParser, StreamDelta};
use crate::llm::{
    ByteStream, ChatMessage, ChatRequest, CompletionProvider, ContentPart, ImageUrl, LlmError,
    MessageContent,
};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const CREDENTIAL_MISSING_REPLY: &str =
    "Sorry, I can't answer yet: no API key is configured for your account. Add one in settings and try again.";
pub const UPSTREAM_ERROR_REPLY: &str = "Sorry, something went wrong while generating a response.";
pub const CANCELLED_MARKER: &str = "\n\n_(generation stopped)_";

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Longest wait for the next provider chunk. `None` waits forever.
    pub stream_idle_timeout: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            stream_idle_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("no provider credential configured for {owner}")]
    CredentialMissing { owner: String },
    #[error("generation cancelled")]
    Cancelled,
    #[error("provider sent nothing for {}s", .0.as_secs())]
    Stalled(Duration),
    #[error("{0}")]
    Provider(#[from] LlmError),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// How a run ended, after its placeholder was finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    CredentialMissing,
    Failed(String),
}

#[derive(Debug, Default)]
struct Accumulator {
    content: String,
    reasoning: String,
}

impl Accumulator {
    fn apply(&mut self, delta: &StreamDelta) -> bool {
        let mut changed = false;
        if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
            self.content.push_str(text);
            changed = true;
        }
        if let Some(text) = delta.reasoning.as_deref().filter(|t| !t.is_empty()) {
            self.reasoning.push_str(text);
            changed = true;
        }
        changed
    }

    fn progress(&self) -> MessagePatch {
        MessagePatch::progress(&self.content, &self.reasoning)
    }

    fn finished(&self) -> MessagePatch {
        MessagePatch::finish(self.content.clone()).with_reasoning(&self.reasoning)
    }
}

pub struct CompletionDriver {
    db: Arc<Database>,
    registry: CancellationRegistry,
    provider: Arc<dyn CompletionProvider>,
    config: DriverConfig,
}

impl CompletionDriver {
    pub fn new(
        db: Arc<Database>,
        registry: CancellationRegistry,
        provider: Arc<dyn CompletionProvider>,
        config: DriverConfig,
    ) -> Self {
        Self {
            db,
            registry,
            provider,
            config,
        }
    }

    /// Generates the next assistant reply for `conversation_id`.
    ///
    /// Never fails: every error becomes the final state of the placeholder
    /// message. `abort` tears down the in-flight provider request.
    pub async fn run(
        &self,
        conversation_id: &str,
        model: &str,
        abort: &CancellationToken,
    ) -> RunOutcome {
        self.run_tracked(conversation_id, model, abort, &OnceLock::new())
            .await
    }

    /// Same as [`run`](Self::run), publishing the placeholder id into
    /// `placeholder_id` as soon as the message exists.
    async fn run_tracked(
        &self,
        conversation_id: &str,
        model: &str,
        abort: &CancellationToken,
        placeholder_id: &OnceLock<String>,
    ) -> RunOutcome {
        let (conversation, history) = match self.load(conversation_id) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "could not load conversation for generation");
                return RunOutcome::Failed(e.to_string());
            }
        };

        let placeholder = match self.db.add_message(conversation_id, NewMessage::placeholder()) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "could not create placeholder message");
                return RunOutcome::Failed(e.to_string());
            }
        };
        let _ = placeholder_id.set(placeholder.id.clone());
        tracing::info!(
            conversation_id,
            message_id = %placeholder.id,
            model,
            provider = self.provider.name(),
            "generation started"
        );

        let mut acc = Accumulator::default();
        let result = self
            .generate(&conversation, &placeholder.id, model, history, abort, &mut acc)
            .await;
        let outcome = self.finalize(&placeholder.id, &acc, result);

        if let Err(e) = self.registry.clear(conversation_id) {
            tracing::warn!(conversation_id, error = %e, "failed to clear generation token");
        }
        tracing::info!(conversation_id, message_id = %placeholder.id, ?outcome, "generation finished");
        outcome
    }

    fn load(&self, conversation_id: &str) -> Result<(Conversation, Vec<ChatMessage>), DbError> {
        let conversation =
            self.db
                .get_conversation(conversation_id)?
                .ok_or_else(|| DbError::NotFound {
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;
        let history = history_to_chat(&self.db.get_messages(conversation_id)?);
        Ok((conversation, history))
    }

    async fn generate(
        &self,
        conversation: &Conversation,
        message_id: &str,
        model: &str,
        history: Vec<ChatMessage>,
        abort: &CancellationToken,
        acc: &mut Accumulator,
    ) -> Result<(), GenerationError> {
        let conversation_id = conversation.id.as_str();
        self.registry.register(conversation_id, message_id)?;

        let api_key = self.db.get_api_key(&conversation.owner)?.ok_or_else(|| {
            GenerationError::CredentialMissing {
                owner: conversation.owner.clone(),
            }
        })?;

        // A cancel may have landed between registration and here
        if abort.is_cancelled() || !self.registry.is_active(conversation_id)? {
            return Err(GenerationError::Cancelled);
        }

        let request = ChatRequest::streaming(model, history);
        let mut stream = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(GenerationError::Cancelled),
            opened = self.provider.open_stream(&api_key, &request) => opened?,
        };

        let mut parser = SseParser::new();
        loop {
            if !self.registry.is_active(conversation_id)? {
                return Err(GenerationError::Cancelled);
            }

            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(GenerationError::Cancelled),
                next = self.next_chunk(&mut stream) => next?,
            };

            let Some(chunk) = next else {
                for event in parser.finish() {
                    if self.apply_event(message_id, event, acc)? {
                        return Ok(());
                    }
                }
                if let Some(detail) = parser.unrecognized_body() {
                    return Err(LlmError::Parse(detail).into());
                }
                tracing::warn!(conversation_id, message_id, "stream closed without end sentinel");
                self.db.patch_message(message_id, &acc.finished())?;
                return Ok(());
            };

            // The read may have been parked for a while; honour a cancel that came in meanwhile
            if !self.registry.is_active(conversation_id)? {
                return Err(GenerationError::Cancelled);
            }

            for event in parser.feed(&chunk)? {
                if self.apply_event(message_id, event, acc)? {
                    return Ok(());
                }
            }
        }
    }

    async fn next_chunk(
        &self,
        stream: &mut ByteStream,
    ) -> Result<Option<Vec<u8>>, GenerationError> {
        let next = match self.config.stream_idle_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| GenerationError::Stalled(limit))?,
            None => stream.next().await,
        };
        Ok(next.transpose()?)
    }

    /// Returns `true` once the stream is complete and the message finalized.
    fn apply_event(
        &self,
        message_id: &str,
        event: SseEvent,
        acc: &mut Accumulator,
    ) -> Result<bool, GenerationError> {
        match event {
            SseEvent::Delta(delta) => {
                if acc.apply(&delta) {
                    self.db.patch_message(message_id, &acc.progress())?;
                }
                Ok(false)
            }
            SseEvent::Done => {
                self.db.patch_message(message_id, &acc.finished())?;
                Ok(true)
            }
            SseEvent::Error(detail) => Err(LlmError::Upstream(detail).into()),
        }
    }

    fn finalize(
        &self,
        message_id: &str,
        acc: &Accumulator,
        result: Result<(), GenerationError>,
    ) -> RunOutcome {
        let (patch, outcome) = match result {
            Ok(()) => return RunOutcome::Completed,
            Err(GenerationError::CredentialMissing { owner }) => {
                tracing::warn!(message_id, owner = %owner, "no provider credential; skipping request");
                (
                    MessagePatch::finish(CREDENTIAL_MISSING_REPLY),
                    RunOutcome::CredentialMissing,
                )
            }
            Err(GenerationError::Cancelled) => {
                tracing::info!(message_id, chars = acc.content.len(), "generation cancelled");
                (
                    MessagePatch::finish(format!("{}{}", acc.content, CANCELLED_MARKER))
                        .with_reasoning(&acc.reasoning),
                    RunOutcome::Cancelled,
                )
            }
            Err(e) => {
                tracing::error!(message_id, error = %e, "generation failed");
                let detail = e.to_string();
                (
                    MessagePatch::finish(format!("{}\n\n{}", UPSTREAM_ERROR_REPLY, detail)),
                    RunOutcome::Failed(detail),
                )
            }
        };

        if let Err(e) = self.db.patch_message(message_id, &patch) {
            tracing::error!(message_id, error = %e, "failed to finalize message");
        }
        outcome
    }

    /// Finalizes a placeholder whose run died without reaching `finalize`.
    fn finalize_abandoned(&self, message_id: &str, detail: &str) {
        let patch = MessagePatch::finish(format!("{}\n\n{}", UPSTREAM_ERROR_REPLY, detail));
        match self.db.patch_message(message_id, &patch) {
            Ok(()) | Err(DbError::Frozen(_)) => {}
            Err(e) => tracing::error!(message_id, error = %e, "failed to finalize abandoned message"),
        }
    }
}

/// Translates stored turns into provider messages. Assistant messages with
/// nothing in them (an abandoned placeholder) are left out.
fn history_to_chat(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| !(m.content.is_empty() && m.parts.as_ref().map_or(true, Vec::is_empty)))
        .map(|m| {
            let content = match &m.parts {
                Some(parts) if !parts.is_empty() => MessageContent::Parts(
                    parts
                        .iter()
                        .map(|part| match part {
                            models::ContentPart::Text { text } => {
                                ContentPart::Text { text: text.clone() }
                            }
                            models::ContentPart::ImageRef { url } => ContentPart::ImageUrl {
                                image_url: ImageUrl { url: url.clone() },
                            },
                        })
                        .collect(),
                ),
                _ => MessageContent::Text(m.content.clone()),
            };
            ChatMessage {
                role: m.role.as_str().to_string(),
                content,
            }
        })
        .collect()
}

/// Handle to a dispatched generation. Dropping it detaches the task.
pub struct GenerationHandle(JoinHandle<RunOutcome>);

impl GenerationHandle {
    /// Waits for the run; `None` if the task was torn down by the runtime.
    pub async fn wait(self) -> Option<RunOutcome> {
        self.0.await.ok()
    }
}

/// Runs generations as detached tasks, one at a time per conversation.
#[derive(Clone)]
pub struct GenerationDispatcher {
    driver: Arc<CompletionDriver>,
    registry: CancellationRegistry,
    in_flight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    shutdown: CancellationToken,
}

impl GenerationDispatcher {
    pub fn new(driver: Arc<CompletionDriver>, registry: CancellationRegistry) -> Self {
        Self {
            driver,
            registry,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns one run and returns immediately. Must be called inside a Tokio runtime.
    pub fn dispatch(&self, conversation_id: String, model: String) -> GenerationHandle {
        let this = self.clone();
        let lock = self.conversation_lock(&conversation_id);
        let abort = self.shutdown.child_token();
        let span = tracing::info_span!("generation", conversation_id = %conversation_id, model = %model);

        GenerationHandle(tokio::spawn(
            async move {
                let placeholder_id = OnceLock::new();
                let outcome = {
                    let _turn = lock.lock().await;
                    AssertUnwindSafe(this.driver.run_tracked(
                        &conversation_id,
                        &model,
                        &abort,
                        &placeholder_id,
                    ))
                    .catch_unwind()
                    .await
                };
                drop(lock);
                this.release_lock(&conversation_id);

                match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::error!("generation task panicked");
                        if let Some(message_id) = placeholder_id.get() {
                            this.driver
                                .finalize_abandoned(message_id, "generation task panicked");
                        }
                        if let Err(e) = this.registry.clear(&conversation_id) {
                            tracing::warn!(error = %e, "failed to clear generation token after panic");
                        }
                        RunOutcome::Failed("generation task panicked".to_string())
                    }
                }
            }
            .instrument(span),
        ))
    }

    /// Fires the transport abort of every in-flight run. Queued runs finish as cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    fn release_lock(&self, conversation_id: &str) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = in_flight.get(conversation_id) {
            if Arc::strong_count(lock) == 1 {
                in_flight.remove(conversation_id);
            }
        }
    }
}
