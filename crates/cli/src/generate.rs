//! Streaming generation for the `generate` and `chat` subcommands.

use std::io::{BufRead, Write};
use std::time::Instant;

use genstream_core::engine::InferenceEngine;
use genstream_core::sampling::Sampler;
use genstream_core::tokenizer::Tokenizer;
use genstream_core::{FinishReason, GenerationRequest, GenerationSession, StepOutput};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::shutdown::shutdown_signal;

/// Token of the generation currently in flight, if any.
pub type ActiveToken = watch::Sender<Option<CancellationToken>>;

/// Run `work` on the blocking pool while listening for shutdown signals.
///
/// A signal cancels the active generation. A signal while nothing is
/// generating exits the process.
pub async fn drive<F>(work: F) -> anyhow::Result<()>
where
    F: FnOnce(&ActiveToken) -> anyhow::Result<()> + Send + 'static,
{
    let (tx, rx) = watch::channel(None);
    let mut worker = tokio::task::spawn_blocking(move || work(&tx));
    loop {
        tokio::select! {
            res = &mut worker => return res?,
            () = shutdown_signal() => {
                let active = rx.borrow().clone();
                match active {
                    Some(token) if !token.is_cancelled() => token.cancel(),
                    _ => {
                        tracing::info!("no generation in flight, exiting");
                        std::process::exit(130);
                    }
                }
            }
        }
    }
}

/// Step `session` until it finishes, writing every fragment to `out`.
pub fn stream_turn<E, T, S, W>(
    session: &mut GenerationSession,
    engine: &mut E,
    tokenizer: &T,
    sampler: &mut S,
    out: &mut W,
) -> anyhow::Result<FinishReason>
where
    E: InferenceEngine + ?Sized,
    T: Tokenizer + ?Sized,
    S: Sampler + ?Sized,
    W: Write,
{
    loop {
        match session.step(engine, tokenizer, sampler)? {
            StepOutput::Text(text) => {
                if !text.is_empty() {
                    out.write_all(text.as_bytes())?;
                    out.flush()?;
                }
            }
            StepOutput::Finished(reason) => return Ok(reason),
        }
    }
}

/// Ingest `request`, publish the session's token and stream the completion.
pub fn generate_once<E, T, S, W>(
    session: &mut GenerationSession,
    engine: &mut E,
    tokenizer: &T,
    sampler: &mut S,
    request: GenerationRequest,
    active: &ActiveToken,
    out: &mut W,
) -> anyhow::Result<FinishReason>
where
    E: InferenceEngine + ?Sized,
    T: Tokenizer + ?Sized,
    S: Sampler + ?Sized,
    W: Write,
{
    let started = Instant::now();
    let n_prompt = session.ingest(engine, tokenizer, request)?;
    let ingest_ms = started.elapsed().as_millis() as u64;
    active.send_replace(Some(session.cancellation_token()));

    let gen_started = Instant::now();
    let reason = stream_turn(session, engine, tokenizer, sampler, out);
    active.send_replace(None);
    let reason = reason?;

    let gen_secs = gen_started.elapsed().as_secs_f64();
    let generated = session.generated_count();
    tracing::info!(
        ?reason,
        n_prompt,
        generated,
        ingest_ms,
        tokens_per_sec = if gen_secs > 0.0 { generated as f64 / gen_secs } else { 0.0 },
        "generation finished"
    );
    tracing::debug!(stats = ?session.reuse_stats(), "prefix reuse");
    Ok(reason)
}

/// Plain-text transcript that grows turn by turn, so each prompt extends the
/// previous one and the cached prefix can be reused.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    text: String,
}

pub const USER_TAG: &str = "User:";
pub const ASSISTANT_TAG: &str = "Assistant:";

impl Transcript {
    pub fn new(system: Option<&str>) -> Self {
        let mut text = String::new();
        if let Some(system) = system.filter(|s| !s.is_empty()) {
            text.push_str(system);
            text.push('\n');
        }
        Self { text }
    }

    /// Append a user turn and return the prompt for the reply.
    pub fn user_turn(&mut self, message: &str) -> &str {
        self.text.push_str(USER_TAG);
        self.text.push(' ');
        self.text.push_str(message.trim());
        self.text.push('\n');
        self.text.push_str(ASSISTANT_TAG);
        &self.text
    }

    pub fn assistant_reply(&mut self, reply: &str) {
        self.text.push_str(reply);
        self.text.push('\n');
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Stop strings that end an assistant turn.
    pub fn stop_strings() -> Vec<String> {
        vec![format!("\n{USER_TAG}")]
    }
}

/// Read user lines from `input` until EOF or `/quit`, streaming a reply to
/// `out` after each one.
#[allow(clippy::too_many_arguments)]
pub fn chat_loop<E, T, S, R, W>(
    session: &mut GenerationSession,
    engine: &mut E,
    tokenizer: &T,
    sampler: &mut S,
    transcript: &mut Transcript,
    max_new_tokens: usize,
    active: &ActiveToken,
    input: R,
    out: &mut W,
) -> anyhow::Result<usize>
where
    E: InferenceEngine + ?Sized,
    T: Tokenizer + ?Sized,
    S: Sampler + ?Sized,
    R: BufRead,
    W: Write,
{
    let mut turns = 0;
    write!(out, "> ")?;
    out.flush()?;
    for line in input.lines() {
        let line = line?;
        let message = line.trim();
        if message == "/quit" {
            break;
        }
        if message.is_empty() {
            write!(out, "> ")?;
            out.flush()?;
            continue;
        }

        let prompt = transcript.user_turn(message).to_string();
        let request =
            GenerationRequest::new(prompt, max_new_tokens).with_stop_strings(Transcript::stop_strings());
        let reason = generate_once(session, engine, tokenizer, sampler, request, active, out)?;
        if reason == FinishReason::Cancelled {
            write!(out, " [cancelled]")?;
        }
        transcript.assistant_reply(session.generated_text());
        turns += 1;
        write!(out, "\n> ")?;
        out.flush()?;
    }
    Ok(turns)
}
