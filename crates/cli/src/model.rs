//! GGUF-quantized Llama-family weights behind [`CausalModel`].

use std::fs::File;
use std::path::Path;

use anyhow::Context as _;
use candle_core::quantized::gguf_file;
use candle_core::{Device, IndexOp, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use genstream_core::bench::ModelSummary;
use genstream_core::engine::CausalModel;

pub struct GgufLlama {
    weights: ModelWeights,
    device: Device,
    summary: ModelSummary,
}

impl GgufLlama {
    pub fn load(path: &Path, device: Device) -> anyhow::Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("opening model {}", path.display()))?;
        let size_bytes = file.metadata()?.len();
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| e.with_path(path))
            .with_context(|| format!("reading GGUF header of {}", path.display()))?;

        let summary = ModelSummary {
            desc: describe(&content, path),
            size_bytes,
            n_params: content
                .tensor_infos
                .values()
                .map(|info| info.shape.elem_count() as u64)
                .sum(),
            backend: backend_name(&device).to_string(),
        };
        tracing::info!(
            model = %summary.desc,
            tensors = content.tensor_infos.len(),
            n_params = summary.n_params,
            "loading GGUF weights"
        );

        let weights = ModelWeights::from_gguf(content, &mut file, &device)?;
        Ok(Self {
            weights,
            device,
            summary,
        })
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }
}

impl CausalModel for GgufLlama {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seqlen_offset == 0 || seq_len == 1 {
            return self.weights.forward(input_ids, seqlen_offset);
        }
        // The causal mask only spans the new tokens, so a multi-token suffix
        // on top of a cached prefix goes through one position at a time.
        let mut logits = None;
        for i in 0..seq_len {
            let token = input_ids.i((.., i..i + 1))?;
            logits = Some(self.weights.forward(&token, seqlen_offset + i)?);
        }
        logits.ok_or_else(|| candle_core::Error::Msg("empty input".into()))
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn describe(content: &gguf_file::Content, path: &Path) -> String {
    let meta = |key: &str| {
        content
            .metadata
            .get(key)
            .and_then(|v| v.to_string().ok())
            .cloned()
    };
    meta("general.name")
        .or_else(|| meta("general.architecture"))
        .or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn backend_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Capability flags of the compiled candle backend.
pub fn system_info() -> Vec<(&'static str, bool)> {
    use candle_core::utils;
    vec![
        ("avx", utils::with_avx()),
        ("neon", utils::with_neon()),
        ("simd128", utils::with_simd128()),
        ("f16c", utils::with_f16c()),
        ("cuda", utils::cuda_is_available()),
        ("metal", utils::metal_is_available()),
        ("mkl", utils::has_mkl()),
        ("accelerate", utils::has_accelerate()),
    ]
}
