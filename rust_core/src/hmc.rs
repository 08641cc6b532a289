use crate::autodiff::Evaluator;
use crate::errors::Result;
use crate::graph::Graph;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Configuration for the HMC sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmcConfig {
    /// Initial leapfrog step size. 0 picks one from the starting point.
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
    /// Acceptance rate targeted by step-size adaptation during warmup.
    pub target_accept: f64,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            num_leapfrog_steps: 20,
            num_draws: 1000,
            num_warmup: 500,
            target_accept: 0.65,
        }
    }
}

/// Result of a single HMC chain run.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub samples: Vec<Vec<f64>>,
    pub accept_rate: f64,
    /// Step size used after warmup.
    pub step_size: f64,
    /// Proposals rejected because the log density could not be evaluated.
    pub rejected_errors: usize,
}

#[derive(Debug, Clone)]
struct PhasePoint {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

impl PhasePoint {
    fn hamiltonian(&self) -> f64 {
        -self.logp + self.p.iter().map(|pi| 0.5 * pi * pi).sum::<f64>()
    }
}

/// `n_steps` leapfrog steps from `start`. Fails if the log density or its
/// gradient cannot be evaluated anywhere along the trajectory.
fn leapfrog(
    graph: &Graph,
    evaluator: &mut Evaluator,
    start: &PhasePoint,
    eps: f64,
    n_steps: usize,
) -> Result<PhasePoint> {
    let mut q = start.q.clone();
    let mut p = start.p.clone();
    let mut grad = start.grad.clone();
    let mut logp = start.logp;

    for (pi, g) in p.iter_mut().zip(&grad) {
        *pi += 0.5 * eps * g;
    }
    for step in 0..n_steps {
        for (qi, pi) in q.iter_mut().zip(&p) {
            *qi += eps * pi;
        }
        evaluator.compute(graph, &q)?;
        grad.clone_from(&evaluator.grad);
        logp = evaluator.total_logp;

        let scale = if step + 1 < n_steps { 1.0 } else { 0.5 };
        for (pi, g) in p.iter_mut().zip(&grad) {
            *pi += scale * eps * g;
        }
    }

    Ok(PhasePoint { q, p, grad, logp })
}

fn sample_momentum(dim: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
    (0..dim).map(|_| StandardNormal.sample(rng)).collect()
}

/// Double or halve a unit step until one leapfrog step changes the
/// acceptance probability across 1/2.
fn find_initial_step_size(
    graph: &Graph,
    evaluator: &mut Evaluator,
    current: &PhasePoint,
    rng: &mut ChaCha8Rng,
) -> f64 {
    let start = PhasePoint {
        p: sample_momentum(current.q.len(), rng),
        ..current.clone()
    };
    let h0 = start.hamiltonian();
    let log_ratio = |evaluator: &mut Evaluator, eps: f64| {
        leapfrog(graph, evaluator, &start, eps, 1)
            .map(|end| h0 - end.hamiltonian())
            .unwrap_or(f64::NEG_INFINITY)
    };

    let threshold = 0.5_f64.ln();
    let mut eps = 1.0;
    let direction = if log_ratio(evaluator, eps) > threshold {
        1.0
    } else {
        -1.0
    };

    for _ in 0..50 {
        let lr = log_ratio(evaluator, eps);
        if !lr.is_finite() && direction > 0.0 {
            eps *= 0.5;
            break;
        }
        if direction > 0.0 && lr < threshold {
            break;
        }
        if direction < 0.0 && lr > threshold {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }

    eps.clamp(1e-10, 1e3)
}

/// Run a single HMC chain.
///
/// The graph is only read during sampling.
/// Each chain gets its own RNG for reproducibility. The starting point must
/// be evaluable; later proposals that fail to evaluate are rejected.
pub fn run_chain(
    graph: &Graph,
    config: &HmcConfig,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
) -> Result<ChainResult> {
    let dim = graph.param_count;
    let mut evaluator = Evaluator::new(graph);
    let q0 = init.unwrap_or_else(|| vec![0.0; dim]);
    evaluator.compute(graph, &q0)?;
    let mut current = PhasePoint {
        q: q0,
        p: Vec::new(),
        grad: evaluator.grad.clone(),
        logp: evaluator.total_logp,
    };

    let total_iters = config.num_warmup + config.num_draws;
    let mut samples = Vec::with_capacity(config.num_draws);
    let mut accepted = 0u64;
    let mut total = 0u64;
    let mut rejected_errors = 0usize;

    // Dual-averaging step-size adaptation during warmup
    let mut step_size = if config.step_size > 0.0 {
        config.step_size
    } else {
        find_initial_step_size(graph, &mut evaluator, &current, rng)
    };
    let mu = (10.0 * step_size).ln();
    let gamma = 0.05;
    let t0 = 10.0;
    let kappa = 0.75;
    let mut log_eps_bar = step_size.ln();
    let mut h_bar = 0.0f64;

    for iter in 0..total_iters {
        let is_warmup = iter < config.num_warmup;

        let start = PhasePoint {
            p: sample_momentum(dim, rng),
            ..current.clone()
        };
        let h_current = start.hamiltonian();

        let proposal = match leapfrog(
            graph,
            &mut evaluator,
            &start,
            step_size,
            config.num_leapfrog_steps,
        ) {
            Ok(end) => Some((h_current - end.hamiltonian(), end)),
            Err(e) => {
                trace!(iter, error = %e, "proposal could not be evaluated");
                rejected_errors += 1;
                None
            }
        };

        let accept_prob = match &proposal {
            Some((log_ratio, _)) if log_ratio.is_finite() => log_ratio.min(0.0).exp(),
            _ => 0.0,
        };

        total += 1;
        if let Some((log_ratio, end)) = proposal {
            if log_ratio.is_finite() && rng.gen::<f64>().ln() < log_ratio {
                current = end;
                accepted += 1;
            }
        }

        if is_warmup {
            let m = (iter + 1) as f64;
            let w = 1.0 / (m + t0);
            h_bar = (1.0 - w) * h_bar + w * (config.target_accept - accept_prob);
            let log_eps = mu - (m.sqrt() / gamma) * h_bar;
            step_size = log_eps.exp();
            let m_pow = m.powf(-kappa);
            log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * log_eps_bar;
        }

        // After warmup, fix step size
        if iter == config.num_warmup.saturating_sub(1) && config.num_warmup > 0 {
            step_size = log_eps_bar.exp();
        }

        if !is_warmup {
            samples.push(current.q.clone());
        }
    }

    let accept_rate = if total > 0 {
        accepted as f64 / total as f64
    } else {
        0.0
    };
    debug!(accept_rate, step_size, rejected_errors, "chain finished");

    Ok(ChainResult {
        samples,
        accept_rate,
        step_size,
        rejected_errors,
    })
}
