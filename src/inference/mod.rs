//! Inference: deciding how a generation request is fulfilled.
//!
//! This module handles everything between a [`GenerationRequest`] and its
//! [`InferenceResponse`]:
//! - Source selection (local model vs. remote provider)
//! - Remote chat completions with classified, bounded retries
//! - Admission control for local model work
//! - Configuration loading from `coderelay.yaml`
//!
//! Remote providers speak the OpenAI Chat Completions API, so switching
//! providers is a config change, not a code change.

pub mod classifier;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod local;
pub mod resources;
pub mod retry;
pub mod tokens;
pub mod types;

// Re-exports for convenience
pub use classifier::{classify, Classify, ErrorCategory, ErrorVerdict};
pub use client::{CompletionTransport, RemoteClient};
pub use config::AppConfig;
pub use dispatcher::InferenceDispatcher;
pub use errors::InferenceError;
pub use local::{EndpointPredictor, LocalModel, LocalPredictor};
pub use resources::{AdmissionRejection, ResourceGate, ResourceReservation, SystemProbe};
pub use retry::{RetryError, RetryPolicy};
pub use types::{
    CodeContext, FinishReason, GenerationParams, GenerationRequest, InferenceResponse, Role,
    SourcePreference, SourceType, TokenUsage,
};
