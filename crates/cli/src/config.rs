//! Persistent CLI defaults.
//!
//! Values are resolved in this order:
//! 1. command-line flags
//! 2. the config file (`<config dir>/genstream/config.toml`)
//! 3. built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use genstream_core::sampling::SamplingParams;
use genstream_core::{DecodeFailurePolicy, MalformedUtf8Policy, SessionConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_N_CTX: usize = 4096;
pub const DEFAULT_MAX_TOKENS: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path to a GGUF model file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    /// Path to a `tokenizer.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<usize>,

    /// Worker threads for CPU kernels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_cache_reuse: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_failure: Option<DecodeFailurePolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub malformed_utf8: Option<MalformedUtf8Policy>,

    /// Extra end-of-generation token strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eos_tokens: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_last_n: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_repeat: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no config directory available")]
    NoConfigDir,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("genstream").join("config.toml"))
    }

    /// Load from the default path. A missing file yields an empty config; a
    /// malformed one is reported and ignored.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merge(&mut self, other: &CliConfig) {
        fn overlay<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }
        overlay(&mut self.model, &other.model);
        overlay(&mut self.tokenizer, &other.tokenizer);
        overlay(&mut self.n_ctx, &other.n_ctx);
        overlay(&mut self.threads, &other.threads);
        overlay(&mut self.max_tokens, &other.max_tokens);
        overlay(&mut self.kv_cache_reuse, &other.kv_cache_reuse);
        overlay(&mut self.decode_failure, &other.decode_failure);
        overlay(&mut self.malformed_utf8, &other.malformed_utf8);
        overlay(&mut self.temperature, &other.temperature);
        overlay(&mut self.top_k, &other.top_k);
        overlay(&mut self.top_p, &other.top_p);
        overlay(&mut self.penalty_last_n, &other.penalty_last_n);
        overlay(&mut self.penalty_repeat, &other.penalty_repeat);
        overlay(&mut self.seed, &other.seed);
        if !other.eos_tokens.is_empty() {
            self.eos_tokens.clone_from(&other.eos_tokens);
        }
    }

    /// A config with every field set to its built-in default, for `config init`.
    pub fn defaults() -> Self {
        let session = SessionConfig::default();
        let sampling = SamplingParams::default();
        Self {
            model: None,
            tokenizer: None,
            n_ctx: Some(DEFAULT_N_CTX),
            threads: Some(default_threads()),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            kv_cache_reuse: Some(session.kv_cache_reuse),
            decode_failure: Some(session.decode_failure),
            malformed_utf8: Some(session.malformed_utf8),
            eos_tokens: Vec::new(),
            temperature: Some(sampling.temperature),
            top_k: Some(sampling.top_k),
            top_p: Some(sampling.top_p),
            penalty_last_n: Some(sampling.penalty_last_n),
            penalty_repeat: Some(sampling.penalty_repeat),
            seed: sampling.seed,
        }
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx.unwrap_or(DEFAULT_N_CTX)
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(default_threads)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            kv_cache_reuse: self.kv_cache_reuse.unwrap_or(defaults.kv_cache_reuse),
            decode_failure: self.decode_failure.unwrap_or(defaults.decode_failure),
            malformed_utf8: self.malformed_utf8.unwrap_or(defaults.malformed_utf8),
        }
    }

    pub fn sampling_params(&self) -> SamplingParams {
        let defaults = SamplingParams::default();
        SamplingParams {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            penalty_last_n: self.penalty_last_n.unwrap_or(defaults.penalty_last_n),
            penalty_repeat: self.penalty_repeat.unwrap_or(defaults.penalty_repeat),
            seed: self.seed.or(defaults.seed),
        }
    }
}

/// Leave two cores for the host, capped at eight workers.
pub fn default_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_sub(2).clamp(1, 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = CliConfig {
            model: Some(PathBuf::from("/models/llama.gguf")),
            n_ctx: Some(2048),
            decode_failure: Some(DecodeFailurePolicy::Abort),
            eos_tokens: vec!["<|im_end|>".into()],
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(CliConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn unset_fields_are_not_written() {
        let rendered = toml::to_string_pretty(&CliConfig {
            top_k: Some(10),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(rendered.trim(), "top_k = 10");
    }

    #[test]
    fn policies_use_snake_case() {
        let config: CliConfig =
            toml::from_str("decode_failure = \"abort\"\nmalformed_utf8 = \"retain\"\n").unwrap();
        assert_eq!(
            config.session_config(),
            SessionConfig {
                kv_cache_reuse: true,
                decode_failure: DecodeFailurePolicy::Abort,
                malformed_utf8: MalformedUtf8Policy::Retain,
            }
        );
    }

    #[test]
    fn merge_prefers_set_fields() {
        let mut base = CliConfig {
            model: Some("base.gguf".into()),
            n_ctx: Some(1024),
            eos_tokens: vec!["</s>".into()],
            ..Default::default()
        };
        let flags = CliConfig {
            n_ctx: Some(512),
            temperature: Some(0.0),
            ..Default::default()
        };
        base.merge(&flags);

        assert_eq!(base.model, Some(PathBuf::from("base.gguf")));
        assert_eq!(base.n_ctx(), 512);
        assert_eq!(base.temperature, Some(0.0));
        assert_eq!(base.eos_tokens, vec!["</s>".to_string()]);
        assert!(base.sampling_params().is_greedy());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "n_ctx = \"lots\"").unwrap();
        assert!(matches!(
            CliConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn defaults_fill_every_knob() {
        let config = CliConfig::defaults();
        assert_eq!(config.n_ctx(), DEFAULT_N_CTX);
        assert_eq!(config.sampling_params(), SamplingParams::default());
        assert_eq!(config.session_config(), SessionConfig::default());
        assert!((1..=8).contains(&config.threads()));
    }
}
