use tracing::debug;

use super::error::CacheError;
use super::prefix_cache_stats::ReuseStats;
use crate::TokenId;

/// Outcome of planning a prompt against the resident cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePlan {
    /// The resident tokens are a prefix of the prompt; decode from `prefix_len`.
    Reuse { prefix_len: usize },
    /// The engine cache must be fully cleared and the prompt decoded from 0.
    Reset,
}

impl ReusePlan {
    /// First prompt index that must be submitted to the engine.
    pub fn decode_start(&self) -> usize {
        match *self {
            ReusePlan::Reuse { prefix_len } => prefix_len,
            ReusePlan::Reset => 0,
        }
    }
}

/// Mirror of the token ids resident in the engine's key-value cache.
///
/// `tokens()[i]` is the token decoded at absolute position `i`. Reuse is
/// all-or-nothing: the resident sequence is either an exact prefix of the
/// next prompt or the whole cache is dropped.
#[derive(Debug, Clone)]
pub struct TokenCache {
    tokens: Vec<TokenId>,
    reuse_enabled: bool,
    stats: ReuseStats,
}

impl TokenCache {
    pub fn new(reuse_enabled: bool) -> Self {
        Self {
            tokens: Vec::new(),
            reuse_enabled,
            stats: ReuseStats::default(),
        }
    }

    /// Reject a prompt that cannot fit alongside its generation budget.
    pub fn check_capacity(
        prompt_len: usize,
        max_new_tokens: usize,
        capacity: usize,
    ) -> Result<(), CacheError> {
        let required = prompt_len.saturating_add(max_new_tokens);
        if required > capacity {
            return Err(CacheError::PromptTooLong { required, capacity });
        }
        Ok(())
    }

    /// Decide whether `new_tokens` can extend the resident cache.
    pub fn plan(&mut self, new_tokens: &[TokenId]) -> ReusePlan {
        let eligible = self.reuse_enabled
            && !self.tokens.is_empty()
            && self.tokens.len() <= new_tokens.len();
        let plan = if eligible && new_tokens.starts_with(&self.tokens) {
            ReusePlan::Reuse {
                prefix_len: self.tokens.len(),
            }
        } else {
            ReusePlan::Reset
        };

        let reused = plan.decode_start();
        self.stats.record(new_tokens.len(), reused);
        debug!(
            cached = self.tokens.len(),
            prompt = new_tokens.len(),
            reused,
            reset = matches!(plan, ReusePlan::Reset),
            "planned prefix reuse"
        );
        plan
    }

    /// Replace the mirror with the just-ingested prompt.
    pub fn assign(&mut self, tokens: &[TokenId]) {
        self.tokens.clear();
        self.tokens.extend_from_slice(tokens);
    }

    /// Append a generated token once the engine has decoded it at `pos`.
    ///
    /// Ignored unless `pos` directly follows the mirror, so an invalidated
    /// mirror stays empty until the next prompt is assigned.
    pub fn record_generated(&mut self, pos: usize, token: TokenId) {
        if self.reuse_enabled && !self.tokens.is_empty() && pos == self.tokens.len() {
            self.tokens.push(token);
        }
    }

    /// Forget everything. The next plan is always a [`ReusePlan::Reset`].
    pub fn invalidate(&mut self) {
        self.tokens.clear();
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn reuse_enabled(&self) -> bool {
        self.reuse_enabled
    }

    pub fn stats(&self) -> ReuseStats {
        self.stats
    }
}
