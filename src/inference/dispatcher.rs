//! Request routing between the local model and the remote provider.
//!
//! [`InferenceDispatcher::dispatch`] always yields exactly one
//! [`InferenceResponse`]. Failures of any kind (configuration, capacity,
//! transport, model) are folded into an error response carrying a message
//! and an [`ErrorCategory`].

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::classifier::{classify, ErrorCategory};
use super::client::{CompletionTransport, RemoteClient};
use super::config::{expand_tilde, AppConfig};
use super::errors::InferenceError;
use super::local::{EndpointPredictor, LocalModel, LocalPredictor};
use super::resources::ResourceGate;
use super::retry::RetryPolicy;
use super::tokens::estimate_tokens;
use super::types::{
    ChatCompletionRequest, FinishReason, GenerationRequest, InferenceResponse, Role,
    SourcePreference, SourceType, TokenUsage,
};
use crate::conversation::store::ConversationStore;

// ─── Backends ────────────────────────────────────────────────────────────────

/// A backend that is either usable or explains why it is not.
enum Backend<T> {
    Ready(T),
    Unavailable(String),
}

impl<T> Backend<T> {
    fn ready(&self) -> Option<&T> {
        match self {
            Backend::Ready(inner) => Some(inner),
            Backend::Unavailable(_) => None,
        }
    }

    fn reason(&self) -> &str {
        match self {
            Backend::Ready(_) => "",
            Backend::Unavailable(reason) => reason,
        }
    }
}

/// A validated model file plus the predictor that runs it.
#[derive(Clone)]
pub struct LocalBackend {
    pub model: LocalModel,
    pub predictor: Arc<dyn LocalPredictor>,
}

enum Route<'a> {
    Local(&'a LocalBackend),
    Remote(&'a Arc<dyn CompletionTransport>),
}

impl Route<'_> {
    fn source(&self) -> SourceType {
        match self {
            Route::Local(_) => SourceType::Local,
            Route::Remote(_) => SourceType::Remote,
        }
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

pub struct InferenceDispatcher {
    remote: Backend<Arc<dyn CompletionTransport>>,
    local: Backend<LocalBackend>,
    gate: Arc<ResourceGate>,
    retry: RetryPolicy,
    local_timeout: Option<Duration>,
}

impl InferenceDispatcher {
    /// A dispatcher with no sources configured. Attach them with
    /// [`with_remote`](Self::with_remote) and [`with_local`](Self::with_local).
    pub fn new(gate: Arc<ResourceGate>, retry: RetryPolicy) -> Self {
        Self {
            remote: Backend::Unavailable("no remote provider configured".into()),
            local: Backend::Unavailable("no local model configured".into()),
            gate,
            retry,
            local_timeout: None,
        }
    }

    pub fn with_remote(mut self, transport: Arc<dyn CompletionTransport>) -> Self {
        self.remote = Backend::Ready(transport);
        self
    }

    pub fn with_local(mut self, model: LocalModel, predictor: Arc<dyn LocalPredictor>) -> Self {
        self.local = Backend::Ready(LocalBackend { model, predictor });
        self
    }

    pub fn with_local_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.local_timeout = timeout;
        self
    }

    /// Build the real backends from configuration.
    ///
    /// Sources that are configured but unusable (missing API key, unreadable
    /// model file) are recorded as unavailable with the reason, so an
    /// explicit request for them reports why.
    pub fn from_config(config: &AppConfig, gate: Arc<ResourceGate>) -> Self {
        let mut dispatcher = Self::new(gate, RetryPolicy::from_settings(&config.retry));

        if let Some(remote) = &config.remote {
            dispatcher.remote = match RemoteClient::from_config(remote) {
                Ok(client) => {
                    tracing::info!(url = %client.url(), model = %remote.model, "remote provider ready");
                    Backend::Ready(Arc::new(client))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "remote provider unavailable");
                    Backend::Unavailable(e.to_string())
                }
            };
        }

        if let Some(local) = &config.local {
            dispatcher.local_timeout = local.timeout_secs.map(Duration::from_secs);
            dispatcher.local = match local.model_path.as_deref() {
                None => Backend::Unavailable("local.model_path is not set".into()),
                Some(raw) => {
                    let path = expand_tilde(raw);
                    match LocalModel::probe(Path::new(&path)).and_then(|model| {
                        EndpointPredictor::from_config(local, &model).map(|p| (model, p))
                    }) {
                        Ok((model, predictor)) => {
                            tracing::info!(
                                path = %model.path.display(),
                                size_mb = model.size_mb,
                                endpoint = %local.endpoint,
                                "local model ready"
                            );
                            Backend::Ready(LocalBackend {
                                model,
                                predictor: Arc::new(predictor),
                            })
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "local model unavailable");
                            Backend::Unavailable(e.to_string())
                        }
                    }
                }
            };
        }

        dispatcher
    }

    pub fn gate(&self) -> &Arc<ResourceGate> {
        &self.gate
    }

    pub fn has_local(&self) -> bool {
        self.local.ready().is_some()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.ready().is_some()
    }

    /// Which source a request with this preference would use.
    pub fn select_source(&self, preference: SourcePreference) -> Result<SourceType, InferenceError> {
        self.route(preference).map(|route| route.source())
    }

    fn route(&self, preference: SourcePreference) -> Result<Route<'_>, InferenceError> {
        match preference {
            SourcePreference::Local => self.local.ready().map(Route::Local).ok_or_else(|| {
                InferenceError::ConfigError {
                    reason: self.local.reason().to_string(),
                }
            }),
            SourcePreference::Remote => self.remote.ready().map(Route::Remote).ok_or_else(|| {
                InferenceError::ConfigError {
                    reason: self.remote.reason().to_string(),
                }
            }),
            SourcePreference::Auto => {
                if let Some(local) = self.local.ready() {
                    Ok(Route::Local(local))
                } else if let Some(remote) = self.remote.ready() {
                    Ok(Route::Remote(remote))
                } else {
                    Err(InferenceError::ConfigError {
                        reason: format!(
                            "no inference source available ({}; {})",
                            self.local.reason(),
                            self.remote.reason()
                        ),
                    })
                }
            }
        }
    }

    /// Fulfil a request. Never fails: every outcome is a response.
    pub async fn dispatch(
        &self,
        request: &GenerationRequest,
        preference: SourcePreference,
    ) -> InferenceResponse {
        let started = Instant::now();

        let route = match self.route(preference) {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(request_id = %request.id(), ?preference, error = %e, "no source for request");
                return InferenceResponse::failed(
                    request,
                    None,
                    FinishReason::Error,
                    e.to_string(),
                    Some(classify(&e).category),
                    started,
                );
            }
        };

        tracing::info!(
            request_id = %request.id(),
            ?preference,
            source = ?route.source(),
            history = request.history().len(),
            "dispatching request"
        );

        let response = match route {
            Route::Remote(transport) => self.dispatch_remote(transport, request, started).await,
            Route::Local(backend) => self.dispatch_local(backend, request, started).await,
        };

        tracing::info!(
            request_id = %response.request_id,
            finish_reason = ?response.finish_reason,
            latency_ms = response.latency_ms,
            total_tokens = response.usage.total_tokens,
            "request finished"
        );
        response
    }

    async fn dispatch_remote(
        &self,
        transport: &Arc<dyn CompletionTransport>,
        request: &GenerationRequest,
        started: Instant,
    ) -> InferenceResponse {
        let payload = ChatCompletionRequest::from_request(transport.model(), request);
        tracing::debug!(
            request_id = %request.id(),
            model = %payload.model,
            messages = payload.messages.len(),
            max_tokens = payload.max_tokens,
            "remote payload built"
        );

        let payload = &payload;
        let result = self
            .retry
            .execute(move |_attempt| transport.complete(payload))
            .await;

        match result {
            Ok(completion) => {
                let choice = completion.choices.first();
                let text = choice.map(|c| c.content()).unwrap_or_default();
                let provider_reason = choice.and_then(|c| c.finish_reason.clone());
                let finish = FinishReason::from_provider(provider_reason.as_deref());
                let usage = completion.usage.map(TokenUsage::from).unwrap_or_else(|| {
                    TokenUsage::new(estimate_tokens(&request.to_prompt_text()), estimate_tokens(&text))
                });
                let model = completion
                    .model
                    .clone()
                    .or_else(|| Some(transport.model().to_string()));

                let mut response = InferenceResponse::completed(
                    request,
                    SourceType::Remote,
                    model,
                    text,
                    usage,
                    finish,
                    started,
                );
                if finish == FinishReason::Error {
                    response.error = Some(format!(
                        "provider finished with unrecognized reason '{}'",
                        provider_reason.unwrap_or_default()
                    ));
                }
                response
            }
            Err(failure) => {
                tracing::warn!(
                    request_id = %request.id(),
                    attempts = failure.attempts,
                    category = %failure.verdict.category,
                    error = %failure.error,
                    "remote request failed"
                );
                let finish = if failure.verdict.category == ErrorCategory::Timeout {
                    FinishReason::Timeout
                } else {
                    FinishReason::Error
                };
                InferenceResponse::failed(
                    request,
                    Some(SourceType::Remote),
                    finish,
                    failure.to_string(),
                    Some(failure.verdict.category),
                    started,
                )
            }
        }
    }

    async fn dispatch_local(
        &self,
        backend: &LocalBackend,
        request: &GenerationRequest,
        started: Instant,
    ) -> InferenceResponse {
        let reservation = match self.gate.admit(backend.model.size_mb) {
            Ok(reservation) => reservation,
            Err(rejection) => {
                tracing::warn!(request_id = %request.id(), %rejection, "local admission rejected");
                let err = InferenceError::Busy {
                    reason: rejection.to_string(),
                };
                return InferenceResponse::failed(
                    request,
                    Some(SourceType::Local),
                    FinishReason::Error,
                    err.to_string(),
                    Some(classify(&err).category),
                    started,
                );
            }
        };
        tracing::debug!(request_id = %request.id(), ?reservation, "local reservation granted");

        let prompt = request.to_prompt_text();
        let predictor = Arc::clone(&backend.predictor);
        let task_prompt = prompt.clone();
        // The task owns the reservation: capacity stays held for as long as
        // the predictor runs, even if this future is dropped. A panic
        // surfaces as a JoinError.
        let mut handle = tokio::spawn(async move {
            let _reservation = reservation;
            predictor.predict(&task_prompt).await
        });

        let joined = match self.local_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    handle.abort();
                    // Wait for the cancelled task so its reservation is gone.
                    let _ = handle.await;
                    None
                }
            },
            None => Some(handle.await),
        };

        let outcome = match joined {
            None => {
                let err = InferenceError::Timeout {
                    duration_secs: self.local_timeout.map(|t| t.as_secs()).unwrap_or_default(),
                };
                tracing::warn!(request_id = %request.id(), error = %err, "local prediction timed out");
                return InferenceResponse::failed(
                    request,
                    Some(SourceType::Local),
                    FinishReason::Timeout,
                    err.to_string(),
                    Some(ErrorCategory::Timeout),
                    started,
                );
            }
            Some(Err(join_error)) => Err(InferenceError::LocalModel {
                reason: if join_error.is_panic() {
                    "predictor panicked".to_string()
                } else {
                    format!("predictor task failed: {join_error}")
                },
            }),
            Some(Ok(result)) => result,
        };

        match outcome {
            Ok(text) => {
                let usage = TokenUsage::new(estimate_tokens(&prompt), estimate_tokens(&text));
                InferenceResponse::completed(
                    request,
                    SourceType::Local,
                    Some(backend.model.name()),
                    text,
                    usage,
                    FinishReason::Stop,
                    started,
                )
            }
            Err(e) => {
                tracing::warn!(request_id = %request.id(), error = %e, "local prediction failed");
                let verdict = classify(&e);
                let finish = if verdict.category == ErrorCategory::Timeout {
                    FinishReason::Timeout
                } else {
                    FinishReason::Error
                };
                InferenceResponse::failed(
                    request,
                    Some(SourceType::Local),
                    finish,
                    e.to_string(),
                    Some(verdict.category),
                    started,
                )
            }
        }
    }

    /// Dispatch and record the assistant reply in `session_id`.
    ///
    /// The assistant message is appended before the response is returned.
    /// Error responses add nothing to the session; a failed append turns the
    /// response into an error.
    pub async fn dispatch_in_session(
        &self,
        store: &ConversationStore,
        session_id: &str,
        request: &GenerationRequest,
        preference: SourcePreference,
    ) -> InferenceResponse {
        let response = self.dispatch(request, preference).await;
        if response.is_error() {
            return response;
        }

        match store.append_message(session_id, Role::Assistant, response.text.clone()) {
            Ok(message) => {
                tracing::debug!(session_id, message_id = %message.id, "assistant reply recorded");
                response
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to record assistant reply");
                response.into_failure(format!("failed to record assistant message: {e}"))
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
