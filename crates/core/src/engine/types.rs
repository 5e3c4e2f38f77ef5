//! Batch and error types shared by inference engines.

use thiserror::Error;

use crate::{SeqId, TokenId};

// ─── Batches ──────────────────────────────────────────────────────────────

/// One token submitted to the engine at an absolute cache position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: usize,
    pub seq_id: SeqId,
    /// Whether the engine must produce logits for this entry.
    pub output: bool,
}

/// Reusable decode batch. Cleared and refilled between decode calls so the
/// backing allocation survives the whole generation.
#[derive(Debug, Clone, Default)]
pub struct DecodeBatch {
    entries: Vec<BatchEntry>,
}

impl DecodeBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, token: TokenId, pos: usize, seq_id: SeqId, output: bool) {
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_id,
            output,
        });
    }

    /// Flag the final entry for output. No-op on an empty batch.
    pub fn mark_last_output(&mut self) {
        if let Some(last) = self.entries.last_mut() {
            last.output = true;
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_pos(&self) -> Option<usize> {
        self.entries.first().map(|e| e.pos)
    }

    pub fn tokens(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.entries.iter().map(|e| e.token)
    }
}

// ─── Engine errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("non-contiguous batch: expected position {expected}, got {got}")]
    NonContiguous { expected: usize, got: usize },
    #[error("context overflow: position {required} exceeds capacity {capacity}")]
    ContextOverflow { required: usize, capacity: usize },
    #[error("unsupported sequence id {0}")]
    UnsupportedSequence(SeqId),
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),
}
