//! Streaming generation session.
//!
//! A [`GenerationSession`] drives one inference context through
//! `ingest → step* → Stopped`. It borrows the engine, tokenizer and sampler
//! for each call and owns only the bookkeeping that must survive between
//! calls: the cache mirror, pending UTF-8 bytes, generated text and the
//! cancellation token.
//!
//! Steps on one session must be serialized by the caller; each step reads
//! the logits left behind by the previous decode.

mod types;

pub use types::{FinishReason, GenerationRequest, SessionError, SessionState, StepOutput};

use tokio_util::sync::CancellationToken;

use crate::config::{DecodeFailurePolicy, SessionConfig};
use crate::engine::{DecodeBatch, InferenceEngine};
use crate::kv_cache::{ReusePlan, ReuseStats, TokenCache};
use crate::sampling::Sampler;
use crate::text::{StopMatcher, Utf8Reassembler};
use crate::tokenizer::Tokenizer;
use crate::{SeqId, TokenId};

/// Sequence id used for every batch entry a session submits.
const SEQ_ID: SeqId = 0;

pub struct GenerationSession {
    config: SessionConfig,
    cache: TokenCache,
    reassembler: Utf8Reassembler,
    stop: StopMatcher,
    generated_text: String,
    prompt_token_count: usize,
    /// Absolute position the next generated token is decoded at.
    n_cur: usize,
    max_new_tokens: usize,
    state: SessionState,
    cancel: CancellationToken,
    batch: DecodeBatch,
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl GenerationSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            cache: TokenCache::new(config.kv_cache_reuse),
            reassembler: Utf8Reassembler::new(config.malformed_utf8),
            stop: StopMatcher::default(),
            generated_text: String::new(),
            prompt_token_count: 0,
            n_cur: 0,
            max_new_tokens: 0,
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
            batch: DecodeBatch::with_capacity(512),
            config,
        }
    }

    /// Tokenize and decode a prompt, reusing the resident cache prefix when
    /// possible. Returns the prompt token count.
    ///
    /// Capacity is checked before anything is touched: a prompt that cannot
    /// fit with its generation budget leaves both engine and session as they
    /// were.
    pub fn ingest<E, T>(
        &mut self,
        engine: &mut E,
        tokenizer: &T,
        request: GenerationRequest,
    ) -> Result<usize, SessionError>
    where
        E: InferenceEngine + ?Sized,
        T: Tokenizer + ?Sized,
    {
        let tokens = tokenizer
            .tokenize(&request.prompt, true, request.parse_special)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;
        if tokens.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        TokenCache::check_capacity(
            tokens.len(),
            request.max_new_tokens,
            engine.context_length(),
        )?;

        self.begin_generation(request.stop_strings, request.max_new_tokens);

        let plan = self.cache.plan(&tokens);
        if plan == ReusePlan::Reset {
            engine.clear_cache(true);
        }
        let start = plan.decode_start();

        self.batch.clear();
        for (pos, &token) in tokens.iter().enumerate().skip(start) {
            self.batch.push(token, pos, SEQ_ID, false);
        }
        self.batch.mark_last_output();

        if !self.batch.is_empty() {
            if let Err(err) = engine.decode(&self.batch) {
                self.cache.invalidate();
                self.state = SessionState::Idle;
                tracing::warn!(%err, prompt_tokens = tokens.len(), "prompt decode failed");
                return Err(SessionError::Decode(err));
            }
        }

        self.cache.assign(&tokens);
        self.prompt_token_count = tokens.len();
        self.n_cur = tokens.len();
        self.state = SessionState::Ready;
        tracing::info!(
            prompt_tokens = tokens.len(),
            reused = start,
            decoded = tokens.len() - start,
            max_new_tokens = self.max_new_tokens,
            "ingested prompt"
        );
        Ok(tokens.len())
    }

    /// Produce the next piece of output.
    ///
    /// Once the session has stopped, every call returns the same
    /// [`StepOutput::Finished`] without touching the sampler or engine.
    pub fn step<E, T, S>(
        &mut self,
        engine: &mut E,
        tokenizer: &T,
        sampler: &mut S,
    ) -> Result<StepOutput, SessionError>
    where
        E: InferenceEngine + ?Sized,
        T: Tokenizer + ?Sized,
        S: Sampler + ?Sized,
    {
        match self.state {
            SessionState::Idle => return Err(SessionError::NotReady),
            SessionState::Stopped(reason) => return Ok(StepOutput::Finished(reason)),
            SessionState::Ready | SessionState::Generating => {}
        }
        if self.cancel.is_cancelled() {
            tracing::debug!(generated = self.generated_count(), "generation cancelled");
            return Ok(self.finish(FinishReason::Cancelled));
        }

        let Some(logits) = engine.logits() else {
            self.state = SessionState::Stopped(FinishReason::Error);
            return Err(SessionError::NoLogits);
        };
        let token = sampler.sample(logits);
        sampler.accept(token);

        if tokenizer.is_end_of_generation(token) {
            return Ok(self.finish(FinishReason::Eos));
        }
        if self.generated_count() >= self.max_new_tokens {
            return Ok(self.finish(FinishReason::Length));
        }

        let piece = match tokenizer.token_to_piece(token) {
            Ok(piece) => piece,
            Err(e) => {
                self.state = SessionState::Stopped(FinishReason::Error);
                return Err(SessionError::Tokenization(e.to_string()));
            }
        };
        self.state = SessionState::Generating;

        let Some(chunk) = self.reassembler.push(&piece) else {
            self.advance(engine, token)?;
            return Ok(StepOutput::Text(String::new()));
        };

        let chunk_start = self.generated_text.len();
        self.generated_text.push_str(&chunk);
        if let Some(found) = self.stop.check(&self.generated_text) {
            let visible = found.visible_part(&chunk, chunk_start).to_owned();
            self.generated_text.truncate(found.start);
            self.state = SessionState::Stopped(FinishReason::Stop);
            tracing::debug!(
                stop = ?self.stop.stop(found.stop_index),
                at = found.start,
                "stop string matched"
            );
            return Ok(StepOutput::Text(visible));
        }

        self.advance(engine, token)?;
        Ok(StepOutput::Text(chunk))
    }

    /// Clear per-generation state. The cache mirror is kept so the next
    /// prompt can still reuse it.
    pub fn reset(&mut self) {
        self.begin_generation(Vec::new(), 0);
        self.state = SessionState::Idle;
    }

    /// Fully clear the engine cache and forget the mirror. The session
    /// returns to `Idle` because no prompt is resident any more.
    pub fn clear_cache<E>(&mut self, engine: &mut E)
    where
        E: InferenceEngine + ?Sized,
    {
        engine.clear_cache(true);
        self.cache.invalidate();
        self.state = SessionState::Idle;
    }

    /// Token observed by [`Self::step`]. Replaced on every ingest and reset,
    /// so fetch it after ingesting.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.state {
            SessionState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn generated_text(&self) -> &str {
        &self.generated_text
    }

    pub fn cached_tokens(&self) -> &[TokenId] {
        self.cache.tokens()
    }

    pub fn prompt_token_count(&self) -> usize {
        self.prompt_token_count
    }

    pub fn generated_count(&self) -> usize {
        self.n_cur - self.prompt_token_count
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn stop_strings(&self) -> &[String] {
        self.stop.stops()
    }

    pub fn pending_bytes(&self) -> usize {
        self.reassembler.pending_len()
    }

    pub fn reuse_stats(&self) -> ReuseStats {
        self.cache.stats()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn begin_generation(&mut self, stop_strings: Vec<String>, max_new_tokens: usize) {
        self.generated_text.clear();
        self.reassembler.clear();
        self.stop = StopMatcher::new(stop_strings);
        self.max_new_tokens = max_new_tokens;
        self.prompt_token_count = 0;
        self.n_cur = 0;
        self.cancel = CancellationToken::new();
    }

    fn finish(&mut self, reason: FinishReason) -> StepOutput {
        self.state = SessionState::Stopped(reason);
        tracing::debug!(
            ?reason,
            generated = self.generated_count(),
            "generation finished"
        );
        StepOutput::Finished(reason)
    }

    /// Decode `token` at the next position.
    fn advance<E>(&mut self, engine: &mut E, token: TokenId) -> Result<(), SessionError>
    where
        E: InferenceEngine + ?Sized,
    {
        let pos = self.n_cur;
        self.batch.clear();
        self.batch.push(token, pos, SEQ_ID, true);
        self.n_cur += 1;

        match engine.decode(&self.batch) {
            Ok(()) => {
                self.cache.record_generated(pos, token);
                Ok(())
            }
            Err(err) => {
                self.cache.invalidate();
                match self.config.decode_failure {
                    DecodeFailurePolicy::Continue => {
                        tracing::warn!(%err, pos, token, "decode failed, continuing");
                        Ok(())
                    }
                    DecodeFailurePolicy::Abort => {
                        self.state = SessionState::Stopped(FinishReason::Error);
                        Err(SessionError::Decode(err))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::testing::{ByteVocab, ScriptedEngine, ScriptedSampler};

    fn vocab() -> ByteVocab {
        ByteVocab::new()
    }

    fn text(out: StepOutput) -> String {
        match out {
            StepOutput::Text(t) => t,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn step_before_ingest_is_rejected() {
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vec![]);
        let err = session.step(&mut engine, &vocab(), &mut sampler).unwrap_err();
        assert!(matches!(err, SessionError::NotReady));
    }

    #[test]
    fn ingest_decodes_prompt_with_last_output() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);

        let n = session
            .ingest(&mut engine, &vocab, GenerationRequest::new("abc", 4))
            .unwrap();
        assert_eq!(n, 4); // BOS + 3 bytes
        assert_eq!(session.state(), SessionState::Ready);

        let batch = &engine.batches()[0];
        let positions: Vec<usize> = batch.iter().map(|e| e.pos).collect();
        let outputs: Vec<bool> = batch.iter().map(|e| e.output).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
        assert_eq!(outputs, vec![false, false, false, true]);
        assert_eq!(session.cached_tokens(), vocab.encode("abc", true).as_slice());
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let vocab = ByteVocab::new().without_bos();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let err = session
            .ingest(&mut engine, &vocab, GenerationRequest::new("", 4))
            .unwrap_err();
        assert!(matches!(err, SessionError::EmptyPrompt));
        assert!(engine.batches().is_empty());
    }

    #[test]
    fn prompt_too_long_leaves_engine_untouched() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(8);
        let err = session
            .ingest(&mut engine, &vocab, GenerationRequest::new("abcd", 4))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::PromptTooLong {
                required: 9,
                capacity: 8
            }
        ));
        assert!(engine.batches().is_empty());
        assert!(engine.clears().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn streams_text_until_length_cap() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vocab.encode("xyz", false));

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("a", 2))
            .unwrap();
        assert_eq!(text(session.step(&mut engine, &vocab, &mut sampler).unwrap()), "x");
        assert_eq!(session.state(), SessionState::Generating);
        assert_eq!(text(session.step(&mut engine, &vocab, &mut sampler).unwrap()), "y");
        assert_eq!(
            session.step(&mut engine, &vocab, &mut sampler).unwrap(),
            StepOutput::Finished(FinishReason::Length)
        );
        assert_eq!(session.generated_text(), "xy");
        assert_eq!(session.generated_count(), 2);
    }

    #[test]
    fn eos_finishes_without_text_or_decode() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vec![vocab.eos()]);

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("a", 8))
            .unwrap();
        let decodes = engine.batches().len();
        assert_eq!(
            session.step(&mut engine, &vocab, &mut sampler).unwrap(),
            StepOutput::Finished(FinishReason::Eos)
        );
        assert_eq!(engine.batches().len(), decodes);
        assert_eq!(session.finish_reason(), Some(FinishReason::Eos));
    }

    #[test]
    fn decode_failure_continue_invalidates_cache() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vocab.encode("xy", false));

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("a", 8))
            .unwrap();
        engine.fail_next_decode();
        assert_eq!(text(session.step(&mut engine, &vocab, &mut sampler).unwrap()), "x");
        assert!(session.cached_tokens().is_empty());
        assert_eq!(text(session.step(&mut engine, &vocab, &mut sampler).unwrap()), "y");
        assert_eq!(session.generated_count(), 2);
    }

    #[test]
    fn decode_failure_abort_stops_session() {
        let vocab = vocab();
        let mut session = GenerationSession::new(SessionConfig {
            decode_failure: DecodeFailurePolicy::Abort,
            ..Default::default()
        });
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vocab.encode("x", false));

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("a", 8))
            .unwrap();
        engine.fail_next_decode();
        let err = session.step(&mut engine, &vocab, &mut sampler).unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
        assert_eq!(session.finish_reason(), Some(FinishReason::Error));
    }

    #[test]
    fn ingest_decode_failure_empties_mirror_and_stays_idle() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vec![]);

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("ab", 8))
            .unwrap();
        engine.fail_next_decodes(1);
        let err = session
            .ingest(&mut engine, &vocab, GenerationRequest::new("abc", 8))
            .unwrap_err();
        assert!(matches!(err, SessionError::Decode(EngineError::Decode(_))));
        assert_eq!(err.to_string(), "decode failed: injected failure");
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.cached_tokens().is_empty());
        assert!(matches!(
            session.step(&mut engine, &vocab, &mut sampler),
            Err(SessionError::NotReady)
        ));

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("abc", 8))
            .unwrap();
        assert_eq!(engine.clears(), &[true, true]);
        let last = engine.batches().last().unwrap();
        assert_eq!(last[0].pos, 0);
        assert_eq!(last[0].token, vocab.bos());
        assert_eq!(last.len(), 4);
    }

    #[test]
    fn unknown_piece_stops_with_error() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vec![999]);

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("a", 8))
            .unwrap();
        let decodes = engine.decode_calls();
        let err = session.step(&mut engine, &vocab, &mut sampler).unwrap_err();
        assert!(matches!(err, SessionError::Tokenization(_)));
        assert_eq!(session.state(), SessionState::Stopped(FinishReason::Error));
        assert_eq!(sampler.accepted(), &[999]);

        assert_eq!(
            session.step(&mut engine, &vocab, &mut sampler).unwrap(),
            StepOutput::Finished(FinishReason::Error)
        );
        assert_eq!(sampler.calls(), 1);
        assert_eq!(engine.decode_calls(), decodes);
    }

    #[test]
    fn reset_keeps_cache_and_returns_to_idle() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        // "x" then the first byte of "é".
        let mut sampler = ScriptedSampler::new(vec![u32::from(b'x'), 0xC3]);

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("ab", 8))
            .unwrap();
        session.step(&mut engine, &vocab, &mut sampler).unwrap();
        assert_eq!(text(session.step(&mut engine, &vocab, &mut sampler).unwrap()), "");
        assert_eq!(session.pending_bytes(), 1);
        let token = session.cancellation_token();
        session.reset();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.generated_text(), "");
        assert_eq!(session.pending_bytes(), 0);
        assert_eq!(session.cached_tokens().len(), 5);
        token.cancel();
        assert!(!session.cancellation_token().is_cancelled());
    }

    #[test]
    fn clear_cache_forces_full_reset_on_next_ingest() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("ab", 8))
            .unwrap();
        session.clear_cache(&mut engine);
        assert!(session.cached_tokens().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(engine.clears(), &[true]);

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("abc", 8))
            .unwrap();
        assert_eq!(engine.clears(), &[true, true]);
        assert_eq!(engine.batches()[1][0].pos, 0);
    }

    #[test]
    fn missing_logits_is_an_error() {
        let vocab = vocab();
        let mut session = GenerationSession::default();
        let mut engine = ScriptedEngine::new(64);
        let mut sampler = ScriptedSampler::new(vec![1]);

        session
            .ingest(&mut engine, &vocab, GenerationRequest::new("a", 8))
            .unwrap();
        engine.drop_logits();
        let err = session.step(&mut engine, &vocab, &mut sampler).unwrap_err();
        assert!(matches!(err, SessionError::NoLogits));
        assert_eq!(sampler.calls(), 0);
    }
}
