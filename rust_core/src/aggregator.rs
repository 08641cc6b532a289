use crate::errors::{Error, Result};
use crate::shard::ShardResult;

/// Gradient of a map-reduce call: one summed block for the shared
/// parameters and one block per shard for its local parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedGradient {
    pub shared: Vec<f64>,
    pub local: Vec<Vec<f64>>,
}

impl AggregatedGradient {
    /// `[shared, local_0, local_1, ...]` as one vector.
    pub fn flatten(&self) -> Vec<f64> {
        let mut flat = self.shared.clone();
        for block in &self.local {
            flat.extend_from_slice(block);
        }
        flat
    }
}

/// Combines per-shard derivative records into one gradient.
///
/// Shared-parameter contributions are summed in ascending shard order, so the
/// result does not depend on which worker finished first. Local blocks are
/// never mixed across shards.
pub struct GradientAggregator;

impl GradientAggregator {
    /// Gradient of the sum of all outputs.
    pub fn aggregate(results: &[ShardResult]) -> Result<AggregatedGradient> {
        let n_shared = Self::shared_width(results)?;
        let mut shared = vec![0.0; n_shared];
        let mut local = Vec::with_capacity(results.len());

        for result in results {
            if result.jacobian.is_none() {
                return Err(Error::MissingGradient {
                    shard: result.shard,
                });
            }
            for (s, g) in shared.iter_mut().zip(&result.shared_grad_contribution) {
                *s += g;
            }
            local.push(result.local_grad.clone());
        }

        Ok(AggregatedGradient { shared, local })
    }

    /// Gradient of `Σ_i upstream[i] * output[i]` over the concatenated output.
    pub fn aggregate_weighted(
        results: &[ShardResult],
        upstream: &[f64],
    ) -> Result<AggregatedGradient> {
        let total: usize = results.iter().map(|r| r.output.len()).sum();
        if upstream.len() != total {
            return Err(Error::AdjointLength {
                expected: total,
                found: upstream.len(),
            });
        }

        let n_shared = Self::shared_width(results)?;
        let mut shared = vec![0.0; n_shared];
        let mut local = Vec::with_capacity(results.len());
        let mut offset = 0;

        for result in results {
            let jacobian = result.jacobian.as_ref().ok_or(Error::MissingGradient {
                shard: result.shard,
            })?;
            let mut block = vec![0.0; jacobian.n_local];
            for row in 0..jacobian.rows.len() {
                let w = upstream[offset + row];
                if w == 0.0 {
                    continue;
                }
                for (s, g) in shared.iter_mut().zip(jacobian.shared(row)) {
                    *s += w * g;
                }
                for (l, g) in block.iter_mut().zip(jacobian.local(row)) {
                    *l += w * g;
                }
            }
            offset += result.output.len();
            local.push(block);
        }

        Ok(AggregatedGradient { shared, local })
    }

    fn shared_width(results: &[ShardResult]) -> Result<usize> {
        match results.first() {
            None => Ok(0),
            Some(first) => first
                .jacobian
                .as_ref()
                .map(|j| j.n_shared)
                .ok_or(Error::MissingGradient { shard: first.shard }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardJacobian;

    fn result(shard: usize, output: Vec<f64>, rows: Vec<Vec<f64>>, n_shared: usize) -> ShardResult {
        let n_local = rows.first().map(|r| r.len() - n_shared).unwrap_or(0);
        let mut shared_sum = vec![0.0; n_shared];
        let mut local_sum = vec![0.0; n_local];
        for row in &rows {
            for (s, v) in shared_sum.iter_mut().zip(&row[..n_shared]) {
                *s += v;
            }
            for (s, v) in local_sum.iter_mut().zip(&row[n_shared..]) {
                *s += v;
            }
        }
        ShardResult {
            shard,
            output,
            shared_grad_contribution: shared_sum,
            local_grad: local_sum,
            jacobian: Some(ShardJacobian {
                n_shared,
                n_local,
                rows,
            }),
        }
    }

    #[test]
    fn test_shared_summed_local_kept() {
        let results = vec![
            result(0, vec![1.0], vec![vec![1.0, 2.0, 10.0]], 2),
            result(1, vec![2.0], vec![vec![3.0, 4.0, 20.0]], 2),
        ];
        let grad = GradientAggregator::aggregate(&results).unwrap();
        assert_eq!(grad.shared, vec![4.0, 6.0]);
        assert_eq!(grad.local, vec![vec![10.0], vec![20.0]]);
        assert_eq!(grad.flatten(), vec![4.0, 6.0, 10.0, 20.0]);
    }

    #[test]
    fn test_weighted_with_ones_matches_sum() {
        let results = vec![
            result(0, vec![1.0, 2.0], vec![vec![1.0, 0.5], vec![2.0, 1.5]], 1),
            result(1, vec![3.0], vec![vec![-1.0, 4.0]], 1),
        ];
        let plain = GradientAggregator::aggregate(&results).unwrap();
        let weighted = GradientAggregator::aggregate_weighted(&results, &[1.0; 3]).unwrap();
        assert_eq!(plain, weighted);

        let picked = GradientAggregator::aggregate_weighted(&results, &[0.0, 2.0, 0.0]).unwrap();
        assert_eq!(picked.shared, vec![4.0]);
        assert_eq!(picked.local, vec![vec![3.0], vec![0.0]]);
    }

    #[test]
    fn test_missing_derivatives() {
        let mut results = vec![result(0, vec![1.0], vec![vec![1.0]], 1)];
        results[0].jacobian = None;
        assert!(matches!(
            GradientAggregator::aggregate(&results),
            Err(Error::MissingGradient { shard: 0 })
        ));
    }

    #[test]
    fn test_adjoint_length_checked() {
        let results = vec![result(0, vec![1.0, 2.0], vec![vec![1.0], vec![1.0]], 1)];
        assert!(matches!(
            GradientAggregator::aggregate_weighted(&results, &[1.0]),
            Err(Error::AdjointLength {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn test_empty_results() {
        let grad = GradientAggregator::aggregate(&[]).unwrap();
        assert!(grad.shared.is_empty());
        assert!(grad.local.is_empty());
    }
}
