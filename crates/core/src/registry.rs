//! Handle-based facade for binding layers.
//!
//! A [`Registry`] owns every engine context and sampler a host creates and
//! hands out [`Handle`]s for them. Each context carries exactly one
//! [`GenerationSession`], so sessions can never outlive or share the
//! context they drive.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::engine::InferenceEngine;
use crate::handles::{Handle, HandleTable};
use crate::sampling::Sampler;
use crate::session::{GenerationRequest, GenerationSession, SessionError, StepOutput};
use crate::tokenizer::Tokenizer;
use crate::TokenId;

/// An inference context together with the session bound to it.
pub struct Context {
    engine: Box<dyn InferenceEngine>,
    tokenizer: Arc<dyn Tokenizer>,
    session: GenerationSession,
}

impl Context {
    pub fn session(&self) -> &GenerationSession {
        &self.session
    }

    pub fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }
}

pub type ContextHandle = Handle<Context>;
pub type SamplerHandle = Handle<Box<dyn Sampler>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stale or unknown {0} handle")]
    StaleHandle(&'static str),
    #[error("tokenization error: {0}")]
    Tokenization(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Default)]
pub struct Registry {
    contexts: HandleTable<Context>,
    samplers: HandleTable<Box<dyn Sampler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_context(
        &mut self,
        engine: Box<dyn InferenceEngine>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SessionConfig,
    ) -> ContextHandle {
        let handle = self.contexts.insert(Context {
            engine,
            tokenizer,
            session: GenerationSession::new(config),
        });
        tracing::debug!(?handle, "created context");
        handle
    }

    /// Drop a context and its session. Any in-flight generation is cancelled.
    pub fn free_context(&mut self, handle: ContextHandle) -> Result<(), RegistryError> {
        let context = self
            .contexts
            .remove(handle)
            .ok_or(RegistryError::StaleHandle("context"))?;
        context.session.cancel();
        tracing::debug!(?handle, "freed context");
        Ok(())
    }

    pub fn create_sampler(&mut self, sampler: Box<dyn Sampler>) -> SamplerHandle {
        self.samplers.insert(sampler)
    }

    pub fn free_sampler(&mut self, handle: SamplerHandle) -> Result<(), RegistryError> {
        self.samplers
            .remove(handle)
            .map(drop)
            .ok_or(RegistryError::StaleHandle("sampler"))
    }

    pub fn context(&self, handle: ContextHandle) -> Result<&Context, RegistryError> {
        self.contexts
            .get(handle)
            .ok_or(RegistryError::StaleHandle("context"))
    }

    fn context_mut(&mut self, handle: ContextHandle) -> Result<&mut Context, RegistryError> {
        self.contexts
            .get_mut(handle)
            .ok_or(RegistryError::StaleHandle("context"))
    }

    pub fn ingest(
        &mut self,
        handle: ContextHandle,
        request: GenerationRequest,
    ) -> Result<usize, RegistryError> {
        let Context {
            engine,
            tokenizer,
            session,
        } = self.context_mut(handle)?;
        Ok(session.ingest(engine.as_mut(), tokenizer.as_ref(), request)?)
    }

    pub fn step(
        &mut self,
        handle: ContextHandle,
        sampler: SamplerHandle,
    ) -> Result<StepOutput, RegistryError> {
        let sampler = self
            .samplers
            .get_mut(sampler)
            .ok_or(RegistryError::StaleHandle("sampler"))?;
        let Context {
            engine,
            tokenizer,
            session,
        } = self
            .contexts
            .get_mut(handle)
            .ok_or(RegistryError::StaleHandle("context"))?;
        Ok(session.step(engine.as_mut(), tokenizer.as_ref(), sampler.as_mut())?)
    }

    pub fn reset(&mut self, handle: ContextHandle) -> Result<(), RegistryError> {
        self.context_mut(handle)?.session.reset();
        Ok(())
    }

    pub fn clear_cache(&mut self, handle: ContextHandle) -> Result<(), RegistryError> {
        let Context {
            engine, session, ..
        } = self.context_mut(handle)?;
        session.clear_cache(engine.as_mut());
        Ok(())
    }

    pub fn context_size(&self, handle: ContextHandle) -> Result<usize, RegistryError> {
        Ok(self.context(handle)?.engine.context_length())
    }

    /// Tokenize with the context's tokenizer. Special-token text is kept
    /// literal.
    pub fn tokenize(
        &self,
        handle: ContextHandle,
        text: &str,
        add_leading: bool,
    ) -> Result<Vec<TokenId>, RegistryError> {
        self.context(handle)?
            .tokenizer
            .tokenize(text, add_leading, false)
            .map_err(|e| RegistryError::Tokenization(e.to_string()))
    }

    pub fn cancellation_token(
        &self,
        handle: ContextHandle,
    ) -> Result<CancellationToken, RegistryError> {
        Ok(self.context(handle)?.session.cancellation_token())
    }

    pub fn num_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn num_samplers(&self) -> usize {
        self.samplers.len()
    }
}
