mod config;
mod generate;
mod logging;
mod model;
mod shutdown;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use genstream_core::bench::{run_benchmark, BenchParams};
use genstream_core::engine::ModelEngine;
use genstream_core::sampling::SamplerChain;
use genstream_core::tokenizer::{Tokenizer, TokenizerWrapper};
use genstream_core::{DecodeFailurePolicy, GenerationRequest, GenerationSession, MalformedUtf8Policy};

use crate::config::{default_threads, CliConfig};
use crate::generate::{chat_loop, drive, generate_once, Transcript};
use crate::model::GgufLlama;

#[derive(Parser)]
#[command(name = "genstream", version, about = "Stream text from a local GGUF model")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Read defaults from this file instead of the user config
    #[arg(long = "config", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a completion for a prompt to stdout
    Generate {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        sampling: SamplingArgs,

        #[arg(long, short)]
        prompt: String,

        /// Stop string; repeat for several, earlier ones win ties
        #[arg(long = "stop")]
        stop: Vec<String>,

        #[arg(long)]
        max_tokens: Option<usize>,

        /// Parse special-token markup in the prompt
        #[arg(long)]
        chat: bool,
    },
    /// Interactive conversation; `/quit` or EOF ends it
    Chat {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        sampling: SamplingArgs,

        /// Text placed before the first user turn
        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        max_tokens: Option<usize>,
    },
    /// Print token ids for a piece of text
    Tokenize {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        text: String,

        /// Do not prepend the beginning-of-sequence token
        #[arg(long)]
        no_bos: bool,

        /// Map special-token text to special ids
        #[arg(long)]
        parse_special: bool,
    },
    /// Measure prompt-processing and generation throughput
    Bench {
        #[command(flatten)]
        model: ModelArgs,

        /// Prompt tokens per pp batch
        #[arg(long, default_value_t = 512)]
        pp: usize,

        /// Generation batches per repetition
        #[arg(long, default_value_t = 128)]
        tg: usize,

        /// Parallel sequences per generation batch; GGUF models serve one
        #[arg(long, default_value_t = 1, value_parser = parse_single_sequence)]
        pl: usize,

        /// Repetitions
        #[arg(long, default_value_t = 3)]
        nr: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print backend capabilities
    Info,
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write every default to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ModelArgs {
    /// GGUF model file
    #[arg(long, short)]
    model: Option<PathBuf>,

    /// tokenizer.json; defaults to one next to the model
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Context length in tokens
    #[arg(long)]
    n_ctx: Option<usize>,

    /// CPU worker threads
    #[arg(long, short)]
    threads: Option<usize>,

    /// Always re-decode the whole prompt
    #[arg(long)]
    no_kv_reuse: bool,

    /// Extra end-of-generation token; repeatable
    #[arg(long = "eos-token")]
    eos_tokens: Vec<String>,

    /// Stop the generation when a decode fails instead of continuing
    #[arg(long)]
    abort_on_decode_error: bool,

    /// Hold back text after a malformed byte instead of replacing it
    #[arg(long)]
    retain_malformed_utf8: bool,
}

impl ModelArgs {
    fn overrides(&self) -> CliConfig {
        CliConfig {
            model: self.model.clone(),
            tokenizer: self.tokenizer.clone(),
            n_ctx: self.n_ctx,
            threads: self.threads,
            kv_cache_reuse: self.no_kv_reuse.then_some(false),
            decode_failure: self
                .abort_on_decode_error
                .then_some(DecodeFailurePolicy::Abort),
            malformed_utf8: self
                .retain_malformed_utf8
                .then_some(MalformedUtf8Policy::Retain),
            eos_tokens: self.eos_tokens.clone(),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct SamplingArgs {
    /// Sampling temperature; 0 picks the most likely token
    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f32>,

    /// Window of recent tokens the repetition penalty looks at
    #[arg(long)]
    repeat_last_n: Option<usize>,

    #[arg(long)]
    repeat_penalty: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,
}

impl SamplingArgs {
    fn apply(&self, config: &mut CliConfig) {
        config.merge(&CliConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            penalty_last_n: self.repeat_last_n,
            penalty_repeat: self.repeat_penalty,
            seed: self.seed,
            ..Default::default()
        });
    }
}

fn parse_single_sequence(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(1) => Ok(1),
        Ok(n) => Err(format!(
            "{n} parallel sequences requested, but GGUF models decode a single sequence"
        )),
        Err(e) => Err(e.to_string()),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    match path {
        Some(path) => CliConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(CliConfig::load()),
    }
}

fn resolve(file: &CliConfig, model: &ModelArgs, sampling: Option<&SamplingArgs>) -> CliConfig {
    let mut config = file.clone();
    config.merge(&model.overrides());
    if let Some(sampling) = sampling {
        sampling.apply(&mut config);
    }
    config
}

fn init_threads(threads: usize) {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        Ok(()) => tracing::debug!(threads, "initialized worker pool"),
        Err(e) => tracing::warn!(error = %e, "worker pool already initialized"),
    }
}

fn model_path(config: &CliConfig) -> anyhow::Result<&Path> {
    match config.model.as_deref() {
        Some(path) => Ok(path),
        None => bail!("no model given; pass --model or set `model` in the config file"),
    }
}

fn load_tokenizer(config: &CliConfig) -> anyhow::Result<TokenizerWrapper> {
    let path = match (&config.tokenizer, &config.model) {
        (Some(path), _) => path.clone(),
        (None, Some(model)) => model.with_file_name("tokenizer.json"),
        (None, None) => bail!("no tokenizer given; pass --tokenizer or --model"),
    };
    TokenizerWrapper::from_file(&path)
        .with_context(|| format!("loading tokenizer {}", path.display()))?
        .with_eog_tokens(config.eos_tokens.as_slice())
}

fn load_engine(config: &CliConfig) -> anyhow::Result<ModelEngine<GgufLlama>> {
    init_threads(config.threads());
    let model = GgufLlama::load(model_path(config)?, Device::Cpu)?;
    Ok(ModelEngine::new(model, config.n_ctx()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, logging::LogFormat::from_env())?;
    let file = load_config(cli.config_file.as_deref())?;

    match cli.command {
        Command::Generate {
            model,
            sampling,
            prompt,
            stop,
            max_tokens,
            chat,
        } => {
            let config = resolve(&file, &model, Some(&sampling));
            let tokenizer = load_tokenizer(&config)?;
            let mut engine = load_engine(&config)?;
            let request = GenerationRequest::new(prompt, max_tokens.unwrap_or(config.max_tokens()))
                .with_stop_strings(stop)
                .with_parse_special(chat);

            drive(move |active| {
                let mut session = GenerationSession::new(config.session_config());
                let mut sampler = SamplerChain::new(config.sampling_params());
                let mut out = std::io::stdout().lock();
                let reason = generate_once(
                    &mut session,
                    &mut engine,
                    &tokenizer,
                    &mut sampler,
                    request,
                    active,
                    &mut out,
                )?;
                writeln!(out)?;
                tracing::debug!(?reason, "done");
                Ok(())
            })
            .await
        }
        Command::Chat {
            model,
            sampling,
            system,
            max_tokens,
        } => {
            let config = resolve(&file, &model, Some(&sampling));
            let tokenizer = load_tokenizer(&config)?;
            let mut engine = load_engine(&config)?;
            let max_tokens = max_tokens.unwrap_or(config.max_tokens());

            drive(move |active| {
                let mut session = GenerationSession::new(config.session_config());
                let mut sampler = SamplerChain::new(config.sampling_params());
                let mut transcript = Transcript::new(system.as_deref());
                let mut out = std::io::stdout();
                let turns = chat_loop(
                    &mut session,
                    &mut engine,
                    &tokenizer,
                    &mut sampler,
                    &mut transcript,
                    max_tokens,
                    active,
                    std::io::stdin().lock(),
                    &mut out,
                )?;
                writeln!(out)?;
                tracing::info!(turns, stats = ?session.reuse_stats(), "chat ended");
                Ok(())
            })
            .await
        }
        Command::Tokenize {
            model,
            text,
            no_bos,
            parse_special,
        } => {
            let config = resolve(&file, &model, None);
            let tokenizer = load_tokenizer(&config)?;
            let ids = tokenizer.tokenize(&text, !no_bos, parse_special)?;
            println!("{}", serde_json::to_string(&ids)?);
            Ok(())
        }
        Command::Bench {
            model,
            pp,
            tg,
            pl,
            nr,
            json,
        } => {
            let config = resolve(&file, &model, None);
            let mut engine = load_engine(&config)?;
            let summary = engine.model().summary().clone();
            let params = BenchParams { pp, tg, pl, nr };
            let report = tokio::task::spawn_blocking(move || {
                run_benchmark(&mut engine, params, summary)
            })
            .await??;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
            Ok(())
        }
        Command::Info => {
            println!("genstream {}", env!("CARGO_PKG_VERSION"));
            println!("default threads: {}", default_threads());
            for (feature, enabled) in model::system_info() {
                println!("{feature:>10}: {}", if enabled { "yes" } else { "no" });
            }
            if let Some(path) = CliConfig::default_path() {
                println!("config file: {}", path.display());
            }
            Ok(())
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let mut config = CliConfig::defaults();
                config.merge(&file);
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Init { force } => {
                let path = match cli.config_file {
                    Some(path) => path,
                    None => CliConfig::default_path()
                        .context("no config directory available")?,
                };
                if path.exists() && !force {
                    bail!("{} already exists; pass --force to overwrite", path.display());
                }
                CliConfig::defaults().save_to(&path)?;
                println!("wrote {}", path.display());
                Ok(())
            }
        },
    }
}
