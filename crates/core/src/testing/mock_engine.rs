use crate::engine::{BatchEntry, DecodeBatch, EngineError, InferenceEngine};

/// An [`InferenceEngine`] that accepts every batch, records it, and exposes
/// flat logits afterwards. Failures can be injected per decode.
pub struct ScriptedEngine {
    n_ctx: usize,
    vocab_size: usize,
    batches: Vec<Vec<BatchEntry>>,
    clears: Vec<bool>,
    logits: Option<Vec<f32>>,
    fail_next: usize,
}

impl ScriptedEngine {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            vocab_size: 258,
            batches: Vec::new(),
            clears: Vec::new(),
            logits: None,
            fail_next: 0,
        }
    }

    /// Every decode batch submitted so far, including failed ones.
    pub fn batches(&self) -> &[Vec<BatchEntry>] {
        &self.batches
    }

    /// The `full` flag of every `clear_cache` call.
    pub fn clears(&self) -> &[bool] {
        &self.clears
    }

    /// Total number of decode calls.
    pub fn decode_calls(&self) -> usize {
        self.batches.len()
    }

    pub fn fail_next_decode(&mut self) {
        self.fail_next += 1;
    }

    pub fn fail_next_decodes(&mut self, n: usize) {
        self.fail_next += n;
    }

    pub fn drop_logits(&mut self) {
        self.logits = None;
    }
}

impl InferenceEngine for ScriptedEngine {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError> {
        self.batches.push(batch.entries().to_vec());
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(EngineError::Decode("injected failure".into()));
        }
        if batch.entries().last().is_some_and(|e| e.output) {
            self.logits = Some(vec![0.0; self.vocab_size]);
        }
        Ok(())
    }

    fn clear_cache(&mut self, full: bool) {
        self.clears.push(full);
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
