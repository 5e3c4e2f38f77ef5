//! [`InferenceEngine`] over a single-sequence [`CausalModel`].

use candle_core::{DType, IndexOp, Tensor};
use tracing::trace;

use super::model_forward::CausalModel;
use super::types::{DecodeBatch, EngineError};
use super::InferenceEngine;

/// Drives a causal model one batch at a time and tracks how many positions
/// the model's own cache holds.
///
/// Only sequence 0 is supported, and every batch must extend the cache
/// contiguously (or restart it at position 0). Logits are retained when the
/// last entry of a batch is flagged for output.
pub struct ModelEngine<M> {
    model: M,
    n_ctx: usize,
    n_past: usize,
    logits: Option<Vec<f32>>,
}

impl<M: CausalModel> ModelEngine<M> {
    pub fn new(model: M, n_ctx: usize) -> Self {
        Self {
            model,
            n_ctx,
            n_past: 0,
            logits: None,
        }
    }

    /// Number of positions currently held by the model cache.
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn validate(&self, batch: &DecodeBatch, first: usize) -> Result<(), EngineError> {
        if first != 0 && first != self.n_past {
            return Err(EngineError::NonContiguous {
                expected: self.n_past,
                got: first,
            });
        }
        for (i, entry) in batch.entries().iter().enumerate() {
            if entry.seq_id != 0 {
                return Err(EngineError::UnsupportedSequence(entry.seq_id));
            }
            if entry.pos != first + i {
                return Err(EngineError::NonContiguous {
                    expected: first + i,
                    got: entry.pos,
                });
            }
        }
        let required = first + batch.len();
        if required > self.n_ctx {
            return Err(EngineError::ContextOverflow {
                required,
                capacity: self.n_ctx,
            });
        }
        Ok(())
    }
}

impl<M: CausalModel> InferenceEngine for ModelEngine<M> {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError> {
        let Some(first) = batch.first_pos() else {
            return Ok(());
        };
        self.validate(batch, first)?;

        let tokens: Vec<u32> = batch.tokens().collect();
        let input = Tensor::new(tokens.as_slice(), self.model.device())?.unsqueeze(0)?;
        let logits = self.model.forward(&input, first)?;
        self.n_past = first + batch.len();

        let wants_output = batch.entries().last().is_some_and(|e| e.output);
        self.logits = if wants_output {
            Some(last_row(&logits)?)
        } else {
            None
        };
        trace!(first, n_tokens = batch.len(), n_past = self.n_past, "decoded batch");
        Ok(())
    }

    fn clear_cache(&mut self, full: bool) {
        self.n_past = 0;
        if full {
            self.logits = None;
        }
    }

    fn context_length(&self) -> usize {
        self.n_ctx
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }
}

fn last_row(logits: &Tensor) -> candle_core::Result<Vec<f32>> {
    let row = match *logits.dims() {
        [_, seq_len, _] => logits.i((0, seq_len - 1))?,
        [rows, _] => logits.i(rows - 1)?,
        _ => logits.clone(),
    };
    row.to_dtype(DType::F32)?.to_vec1::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const VOCAB: usize = 8;

    /// Emits, for every input position, a one-hot row at `(token + 1) % VOCAB`.
    struct SuccessorModel {
        device: Device,
        offsets: Vec<usize>,
    }

    impl SuccessorModel {
        fn new() -> Self {
            Self {
                device: Device::Cpu,
                offsets: Vec::new(),
            }
        }
    }

    impl CausalModel for SuccessorModel {
        fn forward(
            &mut self,
            input_ids: &Tensor,
            seqlen_offset: usize,
        ) -> candle_core::Result<Tensor> {
            self.offsets.push(seqlen_offset);
            let ids = input_ids.to_vec2::<u32>()?;
            let seq_len = ids[0].len();
            let mut data = vec![0.0f32; seq_len * VOCAB];
            for (row, &id) in ids[0].iter().enumerate() {
                data[row * VOCAB + (id as usize + 1) % VOCAB] = 1.0;
            }
            Tensor::from_vec(data, (1, seq_len, VOCAB), &self.device)
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn batch(tokens: &[u32], start: usize, output_last: bool) -> DecodeBatch {
        let mut batch = DecodeBatch::default();
        for (i, &t) in tokens.iter().enumerate() {
            batch.push(t, start + i, 0, false);
        }
        if output_last {
            batch.mark_last_output();
        }
        batch
    }

    fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn prompt_then_step_extends_cache() {
        let mut engine = ModelEngine::new(SuccessorModel::new(), 16);
        engine.decode(&batch(&[1, 2, 3], 0, true)).unwrap();
        assert_eq!(engine.n_past(), 3);
        assert_eq!(argmax(engine.logits().unwrap()), 4);

        engine.decode(&batch(&[6], 3, true)).unwrap();
        assert_eq!(engine.n_past(), 4);
        assert_eq!(argmax(engine.logits().unwrap()), 7);
        assert_eq!(engine.model().offsets, vec![0, 3]);
    }

    #[test]
    fn unflagged_batch_drops_logits() {
        let mut engine = ModelEngine::new(SuccessorModel::new(), 16);
        engine.decode(&batch(&[1], 0, true)).unwrap();
        assert!(engine.logits().is_some());
        engine.decode(&batch(&[2], 1, false)).unwrap();
        assert!(engine.logits().is_none());
    }

    #[test]
    fn rejects_gap_in_positions() {
        let mut engine = ModelEngine::new(SuccessorModel::new(), 16);
        engine.decode(&batch(&[1, 2], 0, true)).unwrap();
        let err = engine.decode(&batch(&[3], 5, true)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NonContiguous {
                expected: 2,
                got: 5
            }
        ));
        assert_eq!(engine.n_past(), 2);
    }

    #[test]
    fn rejects_other_sequences() {
        let mut engine = ModelEngine::new(SuccessorModel::new(), 16);
        let mut b = DecodeBatch::default();
        b.push(1, 0, 1, true);
        let err = engine.decode(&b).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedSequence(1)));
    }

    #[test]
    fn rejects_context_overflow() {
        let mut engine = ModelEngine::new(SuccessorModel::new(), 4);
        let err = engine.decode(&batch(&[1, 2, 3, 4, 5], 0, true)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ContextOverflow {
                required: 5,
                capacity: 4
            }
        ));
        assert!(engine.model().offsets.is_empty());
    }

    #[test]
    fn clear_cache_restarts_positions() {
        let mut engine = ModelEngine::new(SuccessorModel::new(), 16);
        engine.decode(&batch(&[1, 2], 0, true)).unwrap();

        engine.clear_cache(false);
        assert_eq!(engine.n_past(), 0);
        assert!(engine.logits().is_some());

        engine.clear_cache(true);
        assert!(engine.logits().is_none());
        engine.decode(&batch(&[5], 0, true)).unwrap();
        assert_eq!(argmax(engine.logits().unwrap()), 6);
    }

    #[test]
    fn empty_batch_is_noop() {
        let mut engine = ModelEngine::new(SuccessorModel::new(), 16);
        engine.decode(&batch(&[1], 0, true)).unwrap();
        engine.decode(&DecodeBatch::default()).unwrap();
        assert_eq!(engine.n_past(), 1);
        assert!(engine.logits().is_some());
        assert_eq!(engine.model().offsets, vec![0]);
    }
}
