//! Shared test utilities for genstream-core.
//!
//! Scripted collaborators for driving a generation session without a model:
//! an engine that records every batch, a sampler that replays a token script,
//! and a byte-level vocabulary.

mod mock_engine;
mod mock_model;
mod mock_sampler;
mod mock_vocab;

pub use mock_engine::ScriptedEngine;
pub use mock_model::MockCausalModel;
pub use mock_sampler::ScriptedSampler;
pub use mock_vocab::ByteVocab;
