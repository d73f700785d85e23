//! Chat commands.
//!
//! `generate` is a one-shot request with no session. `send_message` runs the
//! full session flow: record the user turn, dispatch with history, record
//! the assistant turn, post-process the reply. Sends to one session are
//! serialized by the store's per-session lock.

use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::inference::types::{
    CodeContext, GenerationParams, GenerationRequest, InferenceResponse, Role, SourcePreference,
};
use crate::processing::ProcessedResponse;
use crate::AppState;

/// Session metadata key holding the preferred code language.
pub const LANGUAGE_METADATA_KEY: &str = "language";

/// Session metadata key holding the preferred source (`local`/`remote`/`auto`).
pub const SOURCE_METADATA_KEY: &str = "source";

// ─── Request / Response Types ───────────────────────────────────────────────

/// Options for a one-shot generation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOptions {
    #[serde(default)]
    pub source: SourcePreference,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code_context: Option<CodeContext>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Result of `generate`. `processed` is absent for error responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReply {
    pub response: InferenceResponse,
    pub processed: Option<ProcessedResponse>,
}

/// Result of `send_message`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub user_message: Message,
    /// The recorded assistant turn; `None` when generation failed.
    pub assistant_message: Option<Message>,
    pub response: InferenceResponse,
    pub processed: Option<ProcessedResponse>,
}

// ─── Commands ───────────────────────────────────────────────────────────────

fn params_for(state: &AppState, options: &GenerateOptions) -> GenerationParams {
    let mut params = GenerationParams::from(&state.config.generation);
    if let Some(max_tokens) = options.max_tokens {
        params.max_tokens = max_tokens;
    }
    if let Some(temperature) = options.temperature {
        params.temperature = temperature;
    }
    params
}

/// One-shot generation outside any session.
pub async fn generate(state: &AppState, prompt: String, options: GenerateOptions) -> GenerationReply {
    let mut request = GenerationRequest::new(prompt, params_for(state, &options));
    if let Some(context) = options.code_context.clone() {
        request = request.with_code_context(context);
    }

    let response = state.dispatcher.dispatch(&request, options.source).await;

    let language = options
        .language
        .as_deref()
        .or_else(|| request.code_context().and_then(|c| c.language.as_deref()));
    let processed = (!response.is_error()).then(|| state.processor.process(&response.text, language));

    GenerationReply {
        response,
        processed,
    }
}

/// Send a user message in a session and wait for the assistant reply.
///
/// Fails only when the session is missing or the user turn cannot be
/// recorded. Generation failures come back as an error `response` with no
/// assistant message.
pub async fn send_message(
    state: &AppState,
    session_id: &str,
    text: String,
) -> Result<ChatReply, String> {
    if text.trim().is_empty() {
        return Err("message is empty".to_string());
    }

    let lock = state.store.session_lock(session_id);
    let _guard = lock.lock().await;

    // 1. Snapshot history, then record the user turn
    let session = state.store.get_session(session_id).map_err(|e| e.to_string())?;
    let user_message = state
        .store
        .append_message(session_id, Role::User, text.clone())
        .map_err(|e| format!("Failed to save user message: {e}"))?;

    let language = session
        .metadata
        .get(LANGUAGE_METADATA_KEY)
        .and_then(|v| v.as_str())
        .map(String::from);
    let preference = session
        .metadata
        .get(SOURCE_METADATA_KEY)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<SourcePreference>().ok())
        .unwrap_or_default();

    // 2. Dispatch with the prior turns as history
    let params = GenerationParams::from(&state.config.generation);
    let request = GenerationRequest::new(text, params).with_history(session.messages);
    tracing::info!(
        session_id,
        request_id = %request.id(),
        history = request.history().len(),
        "sending message"
    );
    let response = state
        .dispatcher
        .dispatch_in_session(&state.store, session_id, &request, preference)
        .await;

    // 3. Pick up the recorded assistant turn and post-process it
    let (assistant_message, processed) = if response.is_error() {
        (None, None)
    } else {
        let recorded = state
            .store
            .get_session(session_id)
            .ok()
            .and_then(|s| s.messages.last().cloned())
            .filter(|m| m.role == Role::Assistant);
        let processed = state.processor.process(&response.text, language.as_deref());
        (recorded, Some(processed))
    };

    Ok(ChatReply {
        user_message,
        assistant_message,
        response,
        processed,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
