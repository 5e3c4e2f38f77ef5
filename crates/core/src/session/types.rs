//! Request, state and error types for generation sessions.

use thiserror::Error;

use crate::engine::EngineError;
use crate::kv_cache::CacheError;

// ─── Request ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Terminator strings in priority order.
    pub stop_strings: Vec<String>,
    pub max_new_tokens: usize,
    /// Map special-token text (chat markup) to special token ids.
    pub parse_special: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            stop_strings: Vec::new(),
            max_new_tokens: 128,
            parse_special: false,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_new_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            max_new_tokens,
            ..Default::default()
        }
    }

    pub fn with_stop_strings<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_strings = stops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parse_special(mut self, parse_special: bool) -> Self {
        self.parse_special = parse_special;
        self
    }
}

// ─── State ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced an end-of-generation token.
    Eos,
    /// The generation budget was exhausted.
    Length,
    /// A stop string matched.
    Stop,
    /// The cancellation token fired.
    Cancelled,
    /// A failure ended the generation.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No prompt is ingested.
    Idle,
    /// Prompt ingested, nothing generated yet.
    Ready,
    Generating,
    /// Terminal until the next ingest or reset.
    Stopped(FinishReason),
}

impl SessionState {
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped(_))
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Generating)
    }
}

/// Result of one [`super::GenerationSession::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// Newly visible text. Empty while a multi-byte character is buffering.
    Text(String),
    Finished(FinishReason),
}

impl StepOutput {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("prompt too long: requires {required} cache positions, context holds {capacity}")]
    PromptTooLong { required: usize, capacity: usize },
    #[error("prompt produced no tokens")]
    EmptyPrompt,
    #[error("no prompt has been ingested")]
    NotReady,
    #[error("engine has no logits to sample from")]
    NoLogits,
    #[error("tokenization error: {0}")]
    Tokenization(String),
    #[error(transparent)]
    Decode(#[from] EngineError),
}

impl From<CacheError> for SessionError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::PromptTooLong { required, capacity } => {
                SessionError::PromptTooLong { required, capacity }
            }
        }
    }
}
