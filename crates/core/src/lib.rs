//! Streaming text generation over an autoregressive inference engine.
//!
//! The centre of the crate is [`session::GenerationSession`]: it ingests a
//! prompt while reusing the engine's resident key-value cache prefix, then
//! streams text one token at a time, reassembling multi-byte characters and
//! truncating at configured stop strings.

pub mod bench;
pub mod config;
pub mod engine;
pub mod handles;
pub mod kv_cache;
pub mod registry;
pub mod sampling;
pub mod session;
pub mod text;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub type TokenId = u32;
pub type SeqId = u32;

pub use config::{DecodeFailurePolicy, MalformedUtf8Policy, SessionConfig};
pub use session::{
    FinishReason, GenerationRequest, GenerationSession, SessionError, SessionState, StepOutput,
};
