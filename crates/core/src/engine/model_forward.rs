//! CausalModel trait for model inference.

use candle_core::{Device, Tensor};

/// A causal language model that owns its key-value cache.
///
/// `forward` receives `input_ids` shaped `[1, seq_len]` starting at absolute
/// position `seqlen_offset`. A call with `seqlen_offset == 0` starts a new
/// sequence and discards whatever the model cached before. The returned
/// logits are either `[1, vocab]` for the last position or
/// `[1, seq_len, vocab]`.
pub trait CausalModel: Send {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize)
        -> candle_core::Result<Tensor>;

    fn device(&self) -> &Device;
}
