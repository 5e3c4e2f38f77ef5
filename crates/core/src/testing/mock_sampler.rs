use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::sampling::Sampler;
use crate::TokenId;

/// A [`Sampler`] that replays a fixed token script and counts its calls.
/// Once the script runs out it keeps returning `fallback`.
pub struct ScriptedSampler {
    script: VecDeque<TokenId>,
    fallback: TokenId,
    calls: Arc<AtomicUsize>,
    accepted: Vec<TokenId>,
}

impl ScriptedSampler {
    pub fn new(script: Vec<TokenId>) -> Self {
        Self {
            script: script.into(),
            fallback: 0,
            calls: Arc::new(AtomicUsize::new(0)),
            accepted: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, token: TokenId) -> Self {
        self.fallback = token;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared call counter that stays readable after the sampler is moved.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn accepted(&self) -> &[TokenId] {
        &self.accepted
    }
}

impl Sampler for ScriptedSampler {
    fn sample(&mut self, _logits: &[f32]) -> TokenId {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or(self.fallback)
    }

    fn accept(&mut self, token: TokenId) {
        self.accepted.push(token);
    }

    fn reset(&mut self) {
        self.accepted.clear();
    }
}
