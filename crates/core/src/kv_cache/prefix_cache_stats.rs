//! Prefix reuse statistics for monitoring and debugging.

use serde::Serialize;

/// Counters for prefix reuse decisions made by a [`super::TokenCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReuseStats {
    /// Number of prompts planned against the cache.
    pub queries: u64,
    /// Number of prompts that reused the resident prefix.
    pub hits: u64,
    /// Total prompt tokens that did not need decoding thanks to reuse.
    pub tokens_reused: u64,
    /// Total prompt tokens planned.
    pub tokens_queried: u64,
}

impl ReuseStats {
    pub(super) fn record(&mut self, prompt_len: usize, reused: usize) {
        self.queries += 1;
        self.tokens_queried += prompt_len as u64;
        if reused > 0 {
            self.hits += 1;
            self.tokens_reused += reused as u64;
        }
    }

    /// Fraction of queries that reused the cache (0.0 when nothing was queried).
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.hits as f64 / self.queries as f64
        }
    }

    /// Fraction of queried prompt tokens served from the cache.
    pub fn token_reuse_rate(&self) -> f64 {
        if self.tokens_queried == 0 {
            0.0
        } else {
            self.tokens_reused as f64 / self.tokens_queried as f64
        }
    }
}
