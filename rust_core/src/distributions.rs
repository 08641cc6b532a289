use crate::errors::EvalError;
use crate::graph::{Graph, NodeId};

// ── Normal (unconstrained) ──────────────────────────────────────────

pub struct Normal;

impl Normal {
    /// New parameter `name` with a Normal(mu, sigma) prior.
    pub fn prior(graph: &mut Graph, name: &str, mu: f64, sigma: f64) -> NodeId {
        let param = graph.add_param(name);
        Self::prior_on(graph, param, mu, sigma);
        param
    }

    /// Normal(mu, sigma) prior on an existing scalar node, e.g. a shard's
    /// local parameter.
    pub fn prior_on(graph: &mut Graph, x: NodeId, mu: f64, sigma: f64) -> NodeId {
        let mu_node = graph.add_constant(mu);
        let sigma_node = graph.add_constant(sigma);
        graph.normal_logp(x, mu_node, sigma_node)
    }

    pub fn observed(graph: &mut Graph, mu_vec: NodeId, sigma: NodeId, obs: Vec<f64>) -> NodeId {
        let obs_idx = graph.add_obs_data(obs);
        graph.normal_obs_logp(mu_vec, sigma, obs_idx)
    }
}

// ── HalfNormal (x > 0, log-transform) ──────────────────────────────

pub struct HalfNormal;

impl HalfNormal {
    /// Samples raw on (-∞, +∞), transforms via x = exp(raw).
    ///
    /// The density of x is `2 * Normal(x | 0, sigma)` and the Jacobian term
    /// log|dx/draw| = raw is added to the log density.
    pub fn prior(graph: &mut Graph, name: &str, sigma: f64) -> NodeId {
        let raw = graph.add_param(name);
        let x = graph.exp(raw);
        let zero = graph.add_constant(0.0);
        let sigma_node = graph.add_constant(sigma);
        graph.normal_logp(x, zero, sigma_node);
        let log_two = graph.add_constant(std::f64::consts::LN_2);
        let jacobian = graph.add(raw, log_two);
        graph.add_logp_term(jacobian);
        x
    }
}

// ── Bernoulli with logit link ───────────────────────────────────────

pub struct BernoulliLogit;

impl BernoulliLogit {
    /// Log-mass of 0/1 outcomes `obs` given logit-scale predictors `eta_vec`.
    pub fn observed(graph: &mut Graph, eta_vec: NodeId, obs: &[i64]) -> Result<NodeId, EvalError> {
        if let Some(bad) = obs.iter().find(|y| **y != 0 && **y != 1) {
            return Err(EvalError::domain(
                "bernoulli_logit_lpmf",
                format!("outcome {bad} is not 0 or 1"),
            ));
        }
        let obs_idx = graph.add_obs_data(obs.iter().map(|y| *y as f64).collect());
        Ok(graph.bernoulli_logit_obs_logp(eta_vec, obs_idx))
    }
}

// ── Poisson with log link ───────────────────────────────────────────

pub struct PoissonLog;

impl PoissonLog {
    /// Log-mass of counts `obs` given log-rates `eta_vec`.
    pub fn observed(graph: &mut Graph, eta_vec: NodeId, obs: &[i64]) -> Result<NodeId, EvalError> {
        if let Some(bad) = obs.iter().find(|y| **y < 0) {
            return Err(EvalError::domain(
                "poisson_log_lpmf",
                format!("count {bad} is negative"),
            ));
        }
        let obs_idx = graph.add_obs_data(obs.iter().map(|y| *y as f64).collect());
        Ok(graph.poisson_log_obs_logp(eta_vec, obs_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::eval_logp;

    #[test]
    fn test_normal_prior_registers_param() {
        let mut g = Graph::new();
        let mu = Normal::prior(&mut g, "mu", 0.0, 1.0);
        assert_eq!(g.param_names, vec!["mu".to_string()]);
        assert_eq!(g.node_by_name("mu"), Some(mu));
        let lp = eval_logp(&g, &[0.0]).unwrap();
        assert!((lp + 0.5 * std::f64::consts::TAU.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_half_normal_density_at_one() {
        let mut g = Graph::new();
        HalfNormal::prior(&mut g, "sigma", 2.0);
        // raw = 0 → x = 1, Jacobian 0
        let expected = std::f64::consts::LN_2 - 0.5 * 0.25 - 2.0_f64.ln()
            - 0.5 * std::f64::consts::TAU.ln();
        let lp = eval_logp(&g, &[0.0]).unwrap();
        assert!((lp - expected).abs() < 1e-12);
    }

    #[test]
    fn test_bernoulli_rejects_non_binary() {
        let mut g = Graph::new();
        let eta = g.add_data("eta", vec![0.0, 0.0]);
        let err = BernoulliLogit::observed(&mut g, eta, &[0, 2]).unwrap_err();
        assert!(matches!(err, EvalError::Domain { op: "bernoulli_logit_lpmf", .. }));
        assert!(BernoulliLogit::observed(&mut g, eta, &[0, 1]).is_ok());
    }

    #[test]
    fn test_poisson_rejects_negative_counts() {
        let mut g = Graph::new();
        let eta = g.add_data("eta", vec![0.0]);
        assert!(PoissonLog::observed(&mut g, eta, &[-1]).is_err());
        PoissonLog::observed(&mut g, eta, &[3]).unwrap();
        // log(e^-1 / 3!) at rate 1
        let lp = eval_logp(&g, &[]).unwrap();
        assert!((lp - (-1.0 - 6.0_f64.ln())).abs() < 1e-12);
    }
}
