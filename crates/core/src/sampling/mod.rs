//! Token sampling over host logits.
//!
//! The session only depends on the [`Sampler`] trait. [`SamplerChain`] is the
//! default implementation: repetition penalty over a recent-token window,
//! then temperature, top-k, top-p and a seeded random draw.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::TokenId;

/// Picks the next token from the engine's logits.
pub trait Sampler: Send {
    fn sample(&mut self, logits: &[f32]) -> TokenId;

    /// Feed back the token that was actually chosen.
    fn accept(&mut self, _token: TokenId) {}

    /// Forget any per-generation history.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    /// 0 disables top-k filtering.
    pub top_k: usize,
    pub top_p: f32,
    /// Number of recent tokens the repetition penalty looks at.
    pub penalty_last_n: usize,
    /// 1.0 disables the repetition penalty.
    pub penalty_repeat: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            penalty_last_n: 64,
            penalty_repeat: 1.1,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }
}

pub struct SamplerChain {
    params: SamplingParams,
    rng: StdRng,
    recent: VecDeque<TokenId>,
}

impl SamplerChain {
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            recent: VecDeque::with_capacity(params.penalty_last_n),
            params,
            rng,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }
}

impl Sampler for SamplerChain {
    fn sample(&mut self, logits: &[f32]) -> TokenId {
        let vocab_size = logits.len();
        let mut logits = logits.to_vec();

        if self.params.penalty_repeat != 1.0 && !self.recent.is_empty() {
            let mut window: Vec<TokenId> = self.recent.iter().copied().collect();
            window.sort_unstable();
            window.dedup();
            apply_repetition_penalty(&mut logits, &window, self.params.penalty_repeat);
        }

        if self.params.is_greedy() {
            return argmax(&logits);
        }

        if self.params.temperature != 1.0 {
            let inv_temp = 1.0 / self.params.temperature;
            for logit in logits.iter_mut() {
                *logit *= inv_temp;
            }
        }

        let mut probs = softmax(&logits);

        if self.params.top_k > 0 && self.params.top_k < vocab_size {
            apply_top_k(&mut probs, self.params.top_k);
        }

        if self.params.top_p < 1.0 && self.params.top_p > 0.0 {
            apply_top_p(&mut probs, self.params.top_p);
        }

        let sum: f32 = probs.iter().sum();
        if sum > 0.0 && sum != 1.0 {
            let inv_sum = 1.0 / sum;
            for p in probs.iter_mut() {
                *p *= inv_sum;
            }
        }

        sample_from_probs(&probs, &mut self.rng)
    }

    fn accept(&mut self, token: TokenId) {
        if self.params.penalty_last_n == 0 {
            return;
        }
        if self.recent.len() == self.params.penalty_last_n {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    fn reset(&mut self) {
        self.recent.clear();
    }
}

fn apply_repetition_penalty(logits: &mut [f32], tokens: &[TokenId], penalty: f32) {
    for &token_id in tokens {
        let idx = token_id as usize;
        if idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

fn apply_top_k(probs: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k.min(sorted.len()) - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));

    let mut cumsum = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff = i + 1;
            break;
        }
    }

    for &(idx, _) in &indexed[cutoff..] {
        probs[idx] = 0.0;
    }
}

fn argmax(values: &[f32]) -> TokenId {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i as TokenId)
        .unwrap_or(0)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> TokenId {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as TokenId;
        }
    }
    // Rounding left r above the total mass: fall back to the last live token.
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .map(|i| i as TokenId)
        .unwrap_or(0)
}
