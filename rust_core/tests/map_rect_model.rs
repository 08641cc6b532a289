use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use shardmc_core::autodiff::{eval_logp, grad_logp};
use shardmc_core::distributions::Normal;
use shardmc_core::graph::{Graph, NodeId};
use shardmc_core::models::{HierarchicalNormalShard, LogisticShard};
use shardmc_core::sampler::{sample, SamplerConfig};
use shardmc_core::{
    Error, EvalError, EvalMode, ExecutorConfig, MapReduceExecutor, RectangularJobSet, ShardArgs,
    ShardEvaluator, ShardedData,
};

fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn bernoulli_logit_log_mass(beta: &[f64], x: &[f64], y: &[i64]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(xi, yi)| {
            let eta = beta[0] + beta[1] * xi;
            *yi as f64 * eta - log1p_exp(eta)
        })
        .sum()
}

const X: [f64; 12] = [-1.2, 0.4, 2.2, -0.3, 0.9, -2.0, 1.1, 0.05, -0.7, 1.6, -1.4, 0.3];
const Y: [i64; 12] = [0, 1, 1, 0, 1, 0, 1, 1, 0, 1, 0, 0];

#[test]
fn three_shard_logistic_matches_full_dataset() {
    let beta = vec![0.25, 1.3];
    let expected = bernoulli_logit_log_mass(&beta, &X, &Y);

    // f(shared, local, x_r, x_i) = Σ bernoulli_logit(x_i | β0 + β1 x_r)
    let f = |graph: &mut Graph, args: &ShardArgs<'_>| {
        let mut total = graph.add_constant(0.0);
        for (x, y) in args.real_data.iter().zip(args.int_data) {
            let xc = graph.add_constant(*x);
            let slope = graph.mul(args.shared[1], xc);
            let eta = graph.add(args.shared[0], slope);
            let softplus = graph.log1p_exp(eta);
            let term = if *y == 1 {
                graph.sub(eta, softplus)
            } else {
                graph.neg(softplus)
            };
            total = graph.add(total, term);
        }
        Ok::<_, EvalError>(vec![total])
    };

    let jobs = RectangularJobSet::new(
        beta.clone(),
        vec![vec![]; 3],
        X.chunks(4).map(<[f64]>::to_vec).collect(),
        Y.chunks(4).map(<[i64]>::to_vec).collect(),
    )
    .unwrap();
    let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(3)).unwrap();
    let output = executor
        .run(&ShardEvaluator::new(f), &jobs, EvalMode::Values)
        .unwrap();

    assert_eq!(output.values.len(), 3);
    for (k, value) in output.values.iter().enumerate() {
        let direct = bernoulli_logit_log_mass(&beta, &X[4 * k..4 * k + 4], &Y[4 * k..4 * k + 4]);
        assert!((value - direct).abs() < 1e-12);
    }
    assert!((output.total() - expected).abs() < 1e-10);

    // the packaged model gives the same numbers
    let x_rows: Vec<Vec<f64>> = X.iter().map(|x| vec![*x]).collect();
    let (real, int) = LogisticShard::pack(&x_rows, &Y, 3).unwrap();
    let jobs = RectangularJobSet::new(beta, vec![vec![]; 3], real, int).unwrap();
    let packaged = executor
        .run(&ShardEvaluator::new(LogisticShard), &jobs, EvalMode::Values)
        .unwrap();
    for (a, b) in packaged.values.iter().zip(&output.values) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn sharding_does_not_change_the_result() {
    let x_rows: Vec<Vec<f64>> = X.iter().map(|x| vec![*x]).collect();
    let beta = vec![-0.4, 0.8];
    let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();
    let evaluator = ShardEvaluator::new(LogisticShard);

    let totals: Vec<(f64, Vec<f64>)> = [1, 2, 4, 5]
        .iter()
        .map(|&shards| {
            let (real, int) = LogisticShard::pack(&x_rows, &Y, shards).unwrap();
            let jobs = RectangularJobSet::new(beta.clone(), vec![vec![]; shards], real, int).unwrap();
            let out = executor.run(&evaluator, &jobs, EvalMode::Gradient).unwrap();
            (out.total(), out.gradient.unwrap().shared)
        })
        .collect();

    for (total, grad) in &totals[1..] {
        assert!((total - totals[0].0).abs() < 1e-10);
        for (g, g0) in grad.iter().zip(&totals[0].1) {
            assert!((g - g0).abs() < 1e-10);
        }
    }
}

/// Outer model: normal priors on (mu, log_tau, theta_k) plus one shard per
/// group through a map-rect node.
fn hierarchical_model(executor: &Arc<MapReduceExecutor>) -> Graph {
    let groups: Vec<Vec<f64>> = vec![vec![1.0, 1.5, 0.0], vec![-0.5, 0.2, 0.0], vec![2.5, 3.0, 2.0]];
    let counts: Vec<Vec<i64>> = vec![vec![2], vec![2], vec![3]];

    let mut g = Graph::new();
    let mu = Normal::prior(&mut g, "mu", 0.0, 5.0);
    let log_tau = Normal::prior(&mut g, "log_tau", 0.0, 1.0);
    let thetas: Vec<NodeId> = (0..groups.len())
        .map(|k| Normal::prior(&mut g, &format!("theta[{k}]"), 0.0, 10.0))
        .collect();

    let real: Vec<Vec<NodeId>> = groups
        .iter()
        .map(|row| row.iter().map(|v| g.add_constant(*v)).collect())
        .collect();
    let node = g
        .map_rect(
            ShardEvaluator::new(HierarchicalNormalShard { sigma: 0.7 }),
            Arc::clone(executor),
            vec![mu, log_tau],
            thetas.iter().map(|t| vec![*t]).collect(),
            real,
            counts,
        )
        .unwrap();
    let total = g.sum(node);
    g.add_logp_term(total);
    g
}

#[test]
fn outer_gradient_matches_finite_differences() {
    let executor = Arc::new(MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap());
    let g = hierarchical_model(&executor);
    let params = [0.3, -0.2, 1.1, 0.1, 2.4];

    let (_, grad) = grad_logp(&g, &params).unwrap();
    let eps = 1e-6;
    for i in 0..params.len() {
        let mut plus = params.to_vec();
        let mut minus = params.to_vec();
        plus[i] += eps;
        minus[i] -= eps;
        let fd = (eval_logp(&g, &plus).unwrap() - eval_logp(&g, &minus).unwrap()) / (2.0 * eps);
        assert!(
            (grad[i] - fd).abs() < 1e-5,
            "param {i}: autodiff {} vs finite difference {fd}",
            grad[i]
        );
    }

    // data was pinned on the first call and reused afterwards
    let stats = executor.placement().stats();
    assert_eq!(stats.transfers, 3);
    assert!(stats.hits >= 3 * 2 * params.len());
}

#[test]
fn parameter_dependent_data_is_rejected() {
    let executor = Arc::new(MapReduceExecutor::new(ExecutorConfig::with_workers(1)).unwrap());
    let mut g = Graph::new();
    let mu = g.add_param("mu");
    let log_tau = g.add_param("log_tau");
    let theta = g.add_param("theta");
    let c = g.add_constant(1.0);
    let derived = g.mul(mu, c);

    let err = g
        .map_rect(
            ShardEvaluator::new(HierarchicalNormalShard::default()),
            executor,
            vec![mu, log_tau],
            vec![vec![theta]],
            vec![vec![c, derived]],
            vec![vec![2]],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ConstantDataViolation {
            shard: 0,
            column: 1
        }
    ));
}

#[test]
fn sampling_a_sharded_logistic_regression() {
    let true_beta = [0.5, -1.5];
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let n = 160;
    let x: Vec<Vec<f64>> = (0..n).map(|_| vec![rng.gen_range(-2.0..2.0)]).collect();
    let y: Vec<i64> = x
        .iter()
        .map(|xi| {
            let p = 1.0 / (1.0 + (-(true_beta[0] + true_beta[1] * xi[0])).exp());
            i64::from(rng.gen::<f64>() < p)
        })
        .collect();

    let shards = 4;
    let (real, int) = LogisticShard::pack(&x, &y, shards).unwrap();
    let data = Arc::new(ShardedData::new(real, int).unwrap());
    let executor = Arc::new(MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap());

    let mut g = Graph::new();
    let b0 = Normal::prior(&mut g, "beta0", 0.0, 2.5);
    let b1 = Normal::prior(&mut g, "beta1", 0.0, 2.5);
    let node = g
        .map_rect_with_data(
            ShardEvaluator::new(LogisticShard),
            Arc::clone(&executor),
            vec![b0, b1],
            vec![vec![]; shards],
            data,
        )
        .unwrap();
    let total = g.sum(node);
    g.add_logp_term(total);

    let config = SamplerConfig {
        num_chains: 2,
        num_draws: 200,
        num_warmup: 200,
        num_leapfrog_steps: 8,
        seed: 5,
        ..SamplerConfig::default()
    };
    let result = sample(g, config).unwrap();
    let mean = result.mean().unwrap();
    assert!((mean[0] - true_beta[0]).abs() < 0.8, "beta0 mean {}", mean[0]);
    assert!(mean[1] < -0.5, "beta1 mean {}", mean[1]);
    assert!(result.rejected_errors.iter().all(|r| *r == 0));

    let stats = executor.placement().stats();
    assert!(stats.transfers <= 2 * shards);
    assert!(stats.hits > 100 * stats.transfers);
}

#[test]
fn flat_buffers_split_into_shards() {
    let data = ShardedData::from_flat(3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[7, 8, 9]).unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data.real_row(2), &[5.0, 6.0]);
    assert_eq!(data.int_row(1), &[8]);
    assert!(matches!(
        ShardedData::from_flat(4, &[1.0, 2.0, 3.0], &[]),
        Err(Error::RaggedRow { .. })
    ));
}
