//! Prompt-processing and text-generation throughput measurement.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::engine::{DecodeBatch, EngineError, InferenceEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BenchParams {
    /// Prompt tokens decoded in one batch.
    pub pp: usize,
    /// Text-generation batches decoded one after another.
    pub tg: usize,
    /// Parallel sequences per text-generation batch.
    pub pl: usize,
    /// Repetitions averaged into the report.
    pub nr: usize,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            pp: 512,
            tg: 128,
            pl: 1,
            nr: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("benchmark needs at least one repetition")]
    NoRepetitions,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Mean and sample standard deviation of a series of speeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub avg: f64,
    pub std: f64,
}

impl Throughput {
    pub fn from_samples(samples: &[f64]) -> Self {
        let n = samples.len() as f64;
        if samples.is_empty() {
            return Self::default();
        }
        let avg = samples.iter().sum::<f64>() / n;
        if samples.len() < 2 {
            return Self { avg, std: 0.0 };
        }
        let sum_sq: f64 = samples.iter().map(|s| s * s).sum();
        let variance = sum_sq / (n - 1.0) - avg * avg * n / (n - 1.0);
        Self {
            avg,
            std: variance.max(0.0).sqrt(),
        }
    }
}

/// Descriptive fields printed next to the measurements.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelSummary {
    pub desc: String,
    pub size_bytes: u64,
    pub n_params: u64,
    pub backend: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub model: ModelSummary,
    pub params: BenchParams,
    pub pp: Throughput,
    pub tg: Throughput,
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size_gib = self.model.size_bytes as f64 / 1024.0 / 1024.0 / 1024.0;
        let params_b = self.model.n_params as f64 / 1e9;
        writeln!(f, "| model | size | params | backend | test | t/s |")?;
        writeln!(f, "| --- | --- | --- | --- | --- | --- |")?;
        for (test, n, speed) in [("pp", self.params.pp, self.pp), ("tg", self.params.tg, self.tg)] {
            writeln!(
                f,
                "| {} | {:.2}GiB | {:.2}B | {} | {} {} | {:.2} ± {:.2} |",
                self.model.desc,
                size_gib,
                params_b,
                self.model.backend,
                test,
                n,
                speed.avg,
                speed.std
            )?;
        }
        Ok(())
    }
}

/// Time `params.nr` rounds of prompt processing and text generation.
///
/// The engine cache is cleared before and after every phase, so the engine
/// holds nothing useful once this returns.
pub fn run_benchmark<E>(
    engine: &mut E,
    params: BenchParams,
    model: ModelSummary,
) -> Result<BenchReport, BenchError>
where
    E: InferenceEngine + ?Sized,
{
    if params.nr == 0 {
        return Err(BenchError::NoRepetitions);
    }

    let mut batch = DecodeBatch::with_capacity(params.pp.max(params.pl));
    let mut pp_speeds = Vec::with_capacity(params.nr);
    let mut tg_speeds = Vec::with_capacity(params.nr);

    for round in 0..params.nr {
        batch.clear();
        for pos in 0..params.pp {
            batch.push(0, pos, 0, false);
        }
        batch.mark_last_output();
        engine.clear_cache(false);

        let t_pp = timed(|| engine.decode(&batch))?;

        engine.clear_cache(false);
        let t_tg = timed(|| {
            for pos in 0..params.tg {
                batch.clear();
                for seq in 0..params.pl {
                    batch.push(0, pos, seq as u32, true);
                }
                engine.decode(&batch)?;
            }
            Ok(())
        })?;
        engine.clear_cache(false);

        let speed_pp = params.pp as f64 / t_pp.as_secs_f64();
        let speed_tg = (params.pl * params.tg) as f64 / t_tg.as_secs_f64();
        tracing::info!(round, speed_pp, speed_tg, "bench round");
        pp_speeds.push(speed_pp);
        tg_speeds.push(speed_tg);
    }

    Ok(BenchReport {
        model,
        params,
        pp: Throughput::from_samples(&pp_speeds),
        tg: Throughput::from_samples(&tg_speeds),
    })
}

fn timed<F>(f: F) -> Result<Duration, EngineError>
where
    F: FnOnce() -> Result<(), EngineError>,
{
    let start = Instant::now();
    f()?;
    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModelEngine;
    use crate::testing::{MockCausalModel, ScriptedEngine};

    #[test]
    fn single_sample_has_zero_std() {
        let t = Throughput::from_samples(&[42.0]);
        assert_eq!(t.avg, 42.0);
        assert_eq!(t.std, 0.0);
    }

    #[test]
    fn sample_standard_deviation() {
        let t = Throughput::from_samples(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((t.avg - 5.0).abs() < 1e-9);
        // Sample (n - 1) deviation of this series is sqrt(32 / 7).
        assert!((t.std - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn zero_repetitions_rejected() {
        let mut engine = ScriptedEngine::new(64);
        let params = BenchParams {
            nr: 0,
            ..Default::default()
        };
        assert!(matches!(
            run_benchmark(&mut engine, params, ModelSummary::default()),
            Err(BenchError::NoRepetitions)
        ));
    }

    #[test]
    fn submits_expected_batches() {
        let mut engine = ScriptedEngine::new(64);
        let params = BenchParams {
            pp: 8,
            tg: 3,
            pl: 2,
            nr: 2,
        };
        let report = run_benchmark(&mut engine, params, ModelSummary::default()).unwrap();
        assert_eq!(report.params, params);

        // Per round: one pp batch and `tg` tg batches.
        assert_eq!(engine.decode_calls(), 2 * (1 + 3));
        let pp = &engine.batches()[0];
        assert_eq!(pp.len(), 8);
        assert!(pp[7].output && !pp[6].output);
        let tg = &engine.batches()[2];
        assert_eq!(tg.iter().map(|e| e.seq_id).collect::<Vec<_>>(), vec![0, 1]);
        assert!(tg.iter().all(|e| e.pos == 1 && e.output));
        assert!(engine.clears().iter().all(|&full| !full));
    }

    #[test]
    fn runs_against_model_engine() {
        let mut engine = ModelEngine::new(MockCausalModel::cpu(32), 64);
        let params = BenchParams {
            pp: 16,
            tg: 4,
            pl: 1,
            nr: 1,
        };
        let report = run_benchmark(&mut engine, params, ModelSummary::default()).unwrap();
        assert!(report.pp.avg > 0.0);
        assert!(report.tg.avg > 0.0);
        assert_eq!(engine.model().offsets(), &[0, 0, 1, 2, 3]);
    }

    #[test]
    fn engine_errors_abort_the_bench() {
        let mut engine = ModelEngine::new(MockCausalModel::cpu(32), 8);
        let params = BenchParams {
            pp: 16,
            tg: 1,
            pl: 1,
            nr: 1,
        };
        assert!(matches!(
            run_benchmark(&mut engine, params, ModelSummary::default()),
            Err(BenchError::Engine(EngineError::ContextOverflow { .. }))
        ));
    }

    #[test]
    fn report_renders_markdown_table() {
        let report = BenchReport {
            model: ModelSummary {
                desc: "llama 7B Q4_0".into(),
                size_bytes: 4 * 1024 * 1024 * 1024,
                n_params: 6_740_000_000,
                backend: "CPU".into(),
            },
            params: BenchParams {
                pp: 512,
                tg: 128,
                pl: 1,
                nr: 3,
            },
            pp: Throughput { avg: 100.0, std: 1.5 },
            tg: Throughput { avg: 10.25, std: 0.0 },
        };
        let rendered = report.to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "| model | size | params | backend | test | t/s |");
        assert_eq!(
            lines[2],
            "| llama 7B Q4_0 | 4.00GiB | 6.74B | CPU | pp 512 | 100.00 ± 1.50 |"
        );
        assert_eq!(
            lines[3],
            "| llama 7B Q4_0 | 4.00GiB | 6.74B | CPU | tg 128 | 10.25 ± 0.00 |"
        );
    }
}
