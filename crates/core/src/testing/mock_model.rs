use candle_core::{DType, Device, Tensor};

use crate::engine::CausalModel;

/// A causal model that returns zero logits of the right shape and records
/// the offsets it was called with. Lets [`crate::engine::ModelEngine`] and
/// the bench run without real weights.
pub struct MockCausalModel {
    vocab_size: usize,
    device: Device,
    offsets: Vec<usize>,
}

impl MockCausalModel {
    pub fn new(vocab_size: usize, device: Device) -> Self {
        Self {
            vocab_size,
            device,
            offsets: Vec::new(),
        }
    }

    pub fn cpu(vocab_size: usize) -> Self {
        Self::new(vocab_size, Device::Cpu)
    }

    /// `seqlen_offset` of every forward call so far.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
}

impl CausalModel for MockCausalModel {
    fn forward(
        &mut self,
        input_ids: &Tensor,
        seqlen_offset: usize,
    ) -> candle_core::Result<Tensor> {
        self.offsets.push(seqlen_offset);
        let batch_size = input_ids.dim(0)?;
        Tensor::zeros((batch_size, self.vocab_size), DType::F32, &self.device)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
