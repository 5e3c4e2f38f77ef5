//! Inference engine seam.
//!
//! A session talks to the engine only through [`InferenceEngine`]: it submits
//! [`DecodeBatch`]es at absolute positions, clears the key-value cache, and
//! reads back the logits of the last flagged entry. [`ModelEngine`] adapts any
//! [`CausalModel`] to this interface.

mod model_engine;
mod model_forward;
mod types;

pub use model_engine::ModelEngine;
pub use model_forward::CausalModel;
pub use types::{BatchEntry, DecodeBatch, EngineError};

pub trait InferenceEngine: Send {
    /// Run the model over `batch`, extending the key-value cache.
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError>;

    /// Drop cached positions. A full clear also discards retained logits.
    fn clear_cache(&mut self, full: bool);

    /// Total number of positions the cache can hold.
    fn context_length(&self) -> usize;

    /// Logits for the last entry flagged for output by the latest decode.
    fn logits(&self) -> Option<&[f32]>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError> {
        (**self).decode(batch)
    }

    fn clear_cache(&mut self, full: bool) {
        (**self).clear_cache(full)
    }

    fn context_length(&self) -> usize {
        (**self).context_length()
    }

    fn logits(&self) -> Option<&[f32]> {
        (**self).logits()
    }
}
