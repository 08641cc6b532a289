//! Ready-made per-shard functions.
//!
//! Both models follow the padding convention: every shard's data row has the
//! same capacity, and the first int entry tells the function how many
//! observations in the row are real.

use crate::distributions::{BernoulliLogit, Normal};
use crate::errors::{self, DataArray, Error, EvalError};
use crate::graph::{Graph, NodeId};
use crate::shard::{ShardArgs, ShardFunction};

/// Observation count from `int_data[0]`, checked against the row capacity.
fn observation_count(op: &'static str, int_data: &[i64], capacity: usize) -> Result<usize, EvalError> {
    let n = *int_data
        .first()
        .ok_or_else(|| EvalError::domain(op, "int data must start with the observation count"))?;
    if n < 0 || n as usize > capacity {
        return Err(EvalError::domain(
            op,
            format!("observation count {n} outside 0..={capacity}"),
        ));
    }
    Ok(n as usize)
}

/// Bernoulli-logit regression log-mass of one shard.
///
/// - shared params: `[β0, β1, .., βK]` (intercept first)
/// - local params: none
/// - real data: `capacity * K` predictors, observation-major
/// - int data: `[n_obs, y_0, .., y_{capacity-1}]`
///
/// Output: one element, the log-mass of the shard's `n_obs` outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogisticShard;

impl LogisticShard {
    const OP: &'static str = "logistic_shard";

    /// Split `(x, y)` into `shards` contiguous blocks, padded to a common
    /// capacity. Returns `(real_data, int_data)` rows for a job set.
    ///
    /// Fails with [`Error::ShapeMismatch`] when `x` and `y` hold a different
    /// number of observations and with [`Error::RaggedRow`] when the rows of
    /// `x` differ in length.
    pub fn pack(x: &[Vec<f64>], y: &[i64], shards: usize) -> errors::Result<(Vec<Vec<f64>>, Vec<Vec<i64>>)> {
        if x.len() != y.len() {
            return Err(Error::ShapeMismatch {
                local: y.len(),
                real: x.len(),
                int: y.len(),
            });
        }
        let k = x.first().map(Vec::len).unwrap_or(0);
        if let Some((row, obs)) = x.iter().enumerate().find(|(_, obs)| obs.len() != k) {
            return Err(Error::RaggedRow {
                array: DataArray::Real,
                row,
                expected: k,
                found: obs.len(),
            });
        }
        if shards == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let capacity = y.len().div_ceil(shards);
        let mut real = Vec::with_capacity(shards);
        let mut int = Vec::with_capacity(shards);

        for s in 0..shards {
            let start = (s * capacity).min(y.len());
            let end = ((s + 1) * capacity).min(y.len());
            let mut row = vec![0.0; capacity * k];
            for (i, obs) in x[start..end].iter().enumerate() {
                row[i * k..(i + 1) * k].copy_from_slice(obs);
            }
            let mut ints = vec![0; capacity + 1];
            ints[0] = (end - start) as i64;
            ints[1..=end - start].copy_from_slice(&y[start..end]);
            real.push(row);
            int.push(ints);
        }
        Ok((real, int))
    }
}

impl ShardFunction for LogisticShard {
    fn build(&self, graph: &mut Graph, args: &ShardArgs<'_>) -> Result<Vec<NodeId>, EvalError> {
        let Some((&intercept, coefs)) = args.shared.split_first() else {
            return Err(EvalError::domain(Self::OP, "missing intercept"));
        };
        let k = coefs.len();
        if k == 0 || args.real_data.len() % k != 0 {
            return Err(EvalError::LengthMismatch {
                op: Self::OP,
                left: args.real_data.len(),
                right: k,
            });
        }
        let capacity = args.real_data.len() / k;
        let n = observation_count(Self::OP, args.int_data, capacity)?;
        let outcomes = args
            .int_data
            .get(1..=n)
            .ok_or(EvalError::LengthMismatch {
                op: Self::OP,
                left: args.int_data.len(),
                right: n + 1,
            })?;

        let columns: Vec<usize> = (0..k)
            .map(|j| {
                let column = (0..n).map(|i| args.real_data[i * k + j]).collect();
                graph.store_data_vec(column)
            })
            .collect();
        let eta = graph.fused_linear_mu(coefs.to_vec(), columns, Some(intercept));
        let logp = BernoulliLogit::observed(graph, eta, outcomes)?;
        Ok(vec![logp])
    }
}

/// Normal group model: one local mean per shard.
///
/// - shared params: `[mu, log_tau]`
/// - local params: `[theta]`
/// - real data: the group's observations, padded
/// - int data: `[n_obs]`
///
/// Output: `Normal(theta | mu, exp(log_tau)) + Σ Normal(y_i | theta, sigma)`.
#[derive(Debug, Clone, Copy)]
pub struct HierarchicalNormalShard {
    pub sigma: f64,
}

impl Default for HierarchicalNormalShard {
    fn default() -> Self {
        Self { sigma: 1.0 }
    }
}

impl ShardFunction for HierarchicalNormalShard {
    fn build(&self, graph: &mut Graph, args: &ShardArgs<'_>) -> Result<Vec<NodeId>, EvalError> {
        const OP: &str = "hierarchical_normal_shard";
        if args.shared.len() != 2 || args.local.len() != 1 {
            return Err(EvalError::LengthMismatch {
                op: OP,
                left: args.shared.len() + args.local.len(),
                right: 3,
            });
        }
        let n = observation_count(OP, args.int_data, args.real_data.len())?;
        let (mu, log_tau, theta) = (args.shared[0], args.shared[1], args.local[0]);

        let tau = graph.exp(log_tau);
        let prior = graph.normal_logp(theta, mu, tau);

        let zeros = graph.add_data("zeros", vec![0.0; n]);
        let means = graph.scalar_broadcast_add(theta, zeros);
        let sigma = graph.add_constant(self.sigma);
        let lik = Normal::observed(graph, means, sigma, args.real_data[..n].to_vec());

        Ok(vec![graph.add(prior, lik)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::log1p_exp;
    use crate::shard::ShardEvaluator;

    fn direct_log_mass(beta: &[f64], x: &[Vec<f64>], y: &[i64]) -> f64 {
        x.iter()
            .zip(y)
            .map(|(xi, yi)| {
                let eta = beta[0] + beta[1..].iter().zip(xi).map(|(b, v)| b * v).sum::<f64>();
                *yi as f64 * eta - log1p_exp(eta)
            })
            .sum()
    }

    #[test]
    fn test_pack_pads_last_shard() {
        let x: Vec<Vec<f64>> = (0..5).map(|i| vec![i as f64, -(i as f64)]).collect();
        let y = vec![1, 0, 1, 1, 0];
        let (real, int) = LogisticShard::pack(&x, &y, 2).unwrap();
        assert_eq!(real.len(), 2);
        assert_eq!(real[0].len(), 6);
        assert_eq!(real[1], vec![3.0, -3.0, 4.0, -4.0, 0.0, 0.0]);
        assert_eq!(int[0], vec![3, 1, 0, 1]);
        assert_eq!(int[1], vec![2, 1, 0, 0]);
    }

    #[test]
    fn test_padding_does_not_change_log_mass() {
        let x = vec![vec![0.5], vec![-1.0], vec![2.0]];
        let y = vec![1, 0, 1];
        let beta = [0.3, -0.7];
        let evaluator = ShardEvaluator::new(LogisticShard);

        let (real, int) = LogisticShard::pack(&x, &y, 1).unwrap();
        let tight = evaluator.evaluate(&beta, &[], &real[0], &int[0]).unwrap();

        let mut padded_real = real[0].clone();
        padded_real.extend([9.0, 9.0]);
        let mut padded_int = int[0].clone();
        padded_int.extend([1, 1]);
        let padded = evaluator
            .evaluate(&beta, &[], &padded_real, &padded_int)
            .unwrap();

        let expected = direct_log_mass(&beta, &x, &y);
        assert!((tight[0] - expected).abs() < 1e-12);
        assert!((padded[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_pack_rejects_malformed_input() {
        let ragged = LogisticShard::pack(&[vec![1.0, 2.0], vec![3.0]], &[1, 0], 1);
        assert!(matches!(
            ragged,
            Err(Error::RaggedRow {
                array: DataArray::Real,
                row: 1,
                expected: 2,
                found: 1
            })
        ));
        let short = LogisticShard::pack(&[vec![1.0]], &[1, 0, 1], 1);
        assert!(matches!(
            short,
            Err(Error::ShapeMismatch { real: 1, int: 3, .. })
        ));
    }

    #[test]
    fn test_logistic_rejects_bad_rows() {
        let evaluator = ShardEvaluator::new(LogisticShard);
        // count larger than capacity
        assert!(evaluator.evaluate(&[0.0, 1.0], &[], &[1.0], &[2, 1, 0]).is_err());
        // outcome outside {0, 1}
        assert!(evaluator.evaluate(&[0.0, 1.0], &[], &[1.0], &[1, 3]).is_err());
        // no coefficients
        assert!(evaluator.evaluate(&[0.0], &[], &[1.0], &[1, 1]).is_err());
    }

    #[test]
    fn test_hierarchical_gradient() {
        let evaluator = ShardEvaluator::new(HierarchicalNormalShard { sigma: 2.0 });
        let (mu, log_tau, theta) = (0.5, 0.0, 1.5);
        let y = [1.0, 2.0, 100.0];
        let (out, jac) = evaluator
            .evaluate_with_jacobian(&[mu, log_tau], &[theta], &y, &[2])
            .unwrap();
        assert_eq!(out.len(), 1);

        // d/dmu = (theta - mu) / tau^2
        assert!((jac.shared(0)[0] - (theta - mu)).abs() < 1e-12);
        // d/dtheta = -(theta - mu) / tau^2 + Σ (y_i - theta) / sigma^2 over the real rows
        let d_theta = -(theta - mu) + ((1.0 - theta) + (2.0 - theta)) / 4.0;
        assert!((jac.local(0)[0] - d_theta).abs() < 1e-12);
    }
}
