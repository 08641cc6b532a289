use crate::errors::{Error, Result};
use crate::graph::Graph;
use crate::hmc::{self, ChainResult, HmcConfig};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Configuration for the multi-chain sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub num_chains: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
    /// 0 picks the step size per chain from its starting point.
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    pub seed: u64,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_draws: 1000,
            num_warmup: 500,
            step_size: 0.0,
            num_leapfrog_steps: 15,
            seed: 42,
            num_threads: 0,
        }
    }
}

/// Result of sampling across all chains.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// samples[chain][draw][param]
    pub samples: Vec<Vec<Vec<f64>>>,
    pub accept_rates: Vec<f64>,
    /// Per chain, proposals rejected because evaluation failed.
    pub rejected_errors: Vec<usize>,
    pub param_names: Vec<String>,
}

impl SampleResult {
    fn draw_count(&self) -> usize {
        self.samples.iter().map(Vec::len).sum()
    }

    /// Get posterior mean for each parameter, or `None` if there are no draws.
    pub fn mean(&self) -> Option<Vec<f64>> {
        let count = self.draw_count();
        if count == 0 {
            return None;
        }
        let mut sums = vec![0.0; self.param_names.len()];
        for draw in self.samples.iter().flatten() {
            for (i, v) in draw.iter().enumerate() {
                sums[i] += v;
            }
        }
        Some(sums.iter().map(|s| s / count as f64).collect())
    }

    /// Get posterior standard deviation for each parameter, or `None` if there
    /// are no draws.
    pub fn std(&self) -> Option<Vec<f64>> {
        let means = self.mean()?;
        let count = self.draw_count();
        let mut sum_sq = vec![0.0; self.param_names.len()];
        for draw in self.samples.iter().flatten() {
            for (i, v) in draw.iter().enumerate() {
                let diff = v - means[i];
                sum_sq[i] += diff * diff;
            }
        }
        Some(sum_sq.iter().map(|s| (s / count as f64).sqrt()).collect())
    }

    /// Draws of one parameter from every chain, chain after chain.
    pub fn draws(&self, param: &str) -> Option<Vec<f64>> {
        let idx = self.param_names.iter().position(|n| n == param)?;
        Some(
            self.samples
                .iter()
                .flat_map(|chain| chain.iter().map(move |draw| draw[idx]))
                .collect(),
        )
    }
}

/// Run parallel HMC chains on the given graph.
///
/// The graph is wrapped in an `Arc` and shared read-only across all chains.
/// Each chain gets a deterministic RNG seeded from `config.seed + chain_index`,
/// guaranteeing reproducible results regardless of thread scheduling. A graph
/// with map-reduce nodes keeps its shard data pinned across every gradient
/// evaluation of every chain.
pub fn sample(graph: Graph, config: SamplerConfig) -> Result<SampleResult> {
    let graph = Arc::new(graph);
    let param_names = graph.param_names.clone();

    let hmc_config = HmcConfig {
        step_size: config.step_size,
        num_leapfrog_steps: config.num_leapfrog_steps,
        num_draws: config.num_draws,
        num_warmup: config.num_warmup,
        ..HmcConfig::default()
    };

    info!(
        chains = config.num_chains,
        draws = config.num_draws,
        warmup = config.num_warmup,
        params = param_names.len(),
        "starting sampler"
    );

    let run_all = || -> Result<Vec<ChainResult>> {
        (0..config.num_chains)
            .into_par_iter()
            .map(|chain_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(config.seed + chain_idx as u64);
                hmc::run_chain(&graph, &hmc_config, &mut rng, None)
            })
            .collect()
    };

    let results = if config.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()
            .map_err(Error::from)?
            .install(run_all)?
    } else {
        run_all()?
    };

    let samples: Vec<Vec<Vec<f64>>> = results.iter().map(|r| r.samples.clone()).collect();
    let accept_rates: Vec<f64> = results.iter().map(|r| r.accept_rate).collect();
    let rejected_errors: Vec<usize> = results.iter().map(|r| r.rejected_errors).collect();
    info!(?accept_rates, "sampling finished");

    Ok(SampleResult {
        samples,
        accept_rates,
        rejected_errors,
        param_names,
    })
}
