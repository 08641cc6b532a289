use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::aggregator::{AggregatedGradient, GradientAggregator};
use crate::errors::{Error, EvalError, Result};
use crate::jobset::RectangularJobSet;
use crate::placement::DataPlacement;
use crate::shard::{ShardEvaluator, ShardFunction, ShardResult};

/// Whether a run only produces values or also derivative records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalMode {
    Values,
    Gradient,
}

/// Configuration for a [`MapReduceExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of workers. 0 means one per available core.
    pub num_workers: usize,
    pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            thread_name_prefix: "shardmc-worker".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    fn resolved_workers(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a running
/// evaluation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of one map-reduce call.
#[derive(Debug, Clone)]
pub struct MapRectOutput {
    /// Every shard's output, concatenated in shard order.
    pub values: Vec<f64>,
    /// `values[offsets[k]..offsets[k + 1]]` is shard k's output.
    pub offsets: Vec<usize>,
    pub shard_results: Vec<ShardResult>,
    /// Present when the run was made with [`EvalMode::Gradient`].
    pub gradient: Option<AggregatedGradient>,
}

impl MapRectOutput {
    pub fn shard_output(&self, shard: usize) -> &[f64] {
        &self.values[self.offsets[shard]..self.offsets[shard + 1]]
    }

    /// Sum of all outputs, the usual log-density increment.
    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// Dispatches a per-shard function over every shard of a job set.
///
/// Shard k always runs on logical worker `k % workers`, so the worker that
/// pinned a shard's data keeps serving it across calls. Workers run on a
/// private rayon pool.
pub struct MapReduceExecutor {
    pool: rayon::ThreadPool,
    workers: usize,
    placement: DataPlacement,
}

impl fmt::Debug for MapReduceExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapReduceExecutor")
            .field("workers", &self.workers)
            .field("placement", &self.placement.stats())
            .finish()
    }
}

impl MapReduceExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let workers = config.resolved_workers();
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()?;
        debug!(workers, "created map-reduce executor");
        Ok(Self {
            pool,
            workers,
            placement: DataPlacement::new(workers),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn worker_for(&self, shard: usize) -> usize {
        shard % self.workers
    }

    pub fn placement(&self) -> &DataPlacement {
        &self.placement
    }

    pub fn run(
        &self,
        evaluator: &ShardEvaluator,
        jobs: &RectangularJobSet,
        mode: EvalMode,
    ) -> Result<MapRectOutput> {
        self.run_with_cancel(evaluator, jobs, mode, &CancelToken::new())
    }

    /// Evaluate every shard and concatenate the outputs in shard order.
    ///
    /// All-or-nothing: if any shard fails, the call fails with
    /// [`Error::ShardEvaluation`] naming the lowest failing shard that ran,
    /// and no output is returned. Shards not yet started when a failure or
    /// cancellation is observed are skipped.
    pub fn run_with_cancel(
        &self,
        evaluator: &ShardEvaluator,
        jobs: &RectangularJobSet,
        mode: EvalMode,
        cancel: &CancelToken,
    ) -> Result<MapRectOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let n = jobs.len();
        if n == 0 {
            return Ok(MapRectOutput {
                values: Vec::new(),
                offsets: vec![0],
                shard_results: Vec::new(),
                gradient: (mode == EvalMode::Gradient).then(|| AggregatedGradient {
                    shared: vec![0.0; jobs.shared_params().len()],
                    local: Vec::new(),
                }),
            });
        }

        debug!(shards = n, workers = self.workers, ?mode, "map_rect run");

        let mut assignments: Vec<Vec<usize>> = vec![Vec::new(); self.workers];
        for k in 0..n {
            assignments[self.worker_for(k)].push(k);
        }

        let abort = AtomicBool::new(false);
        let per_worker: Vec<Vec<(usize, std::result::Result<ShardResult, EvalError>)>> =
            self.pool.install(|| {
                assignments
                    .par_iter()
                    .enumerate()
                    .map(|(worker, shards)| {
                        let mut done = Vec::with_capacity(shards.len());
                        for &k in shards {
                            if abort.load(Ordering::Relaxed) || cancel.is_cancelled() {
                                break;
                            }
                            let outcome = self.evaluate_shard(worker, evaluator, jobs, k, mode);
                            if let Err(ref e) = outcome {
                                warn!(shard = k, worker, error = %e, "shard evaluation failed");
                                abort.store(true, Ordering::Relaxed);
                            }
                            done.push((k, outcome));
                        }
                        done
                    })
                    .collect()
            });

        let mut slots: Vec<Option<ShardResult>> = vec![None; n];
        let mut first_error: Option<(usize, EvalError)> = None;
        for (k, outcome) in per_worker.into_iter().flatten() {
            match outcome {
                Ok(result) => slots[k] = Some(result),
                Err(e) => {
                    if first_error.as_ref().map_or(true, |(j, _)| k < *j) {
                        first_error = Some((k, e));
                    }
                }
            }
        }
        if let Some((shard, source)) = first_error {
            return Err(Error::ShardEvaluation { shard, source });
        }

        let shard_results: Vec<ShardResult> = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(Error::Cancelled)?;

        let mut values = Vec::with_capacity(shard_results.iter().map(|r| r.output.len()).sum());
        let mut offsets = Vec::with_capacity(n + 1);
        offsets.push(0);
        for result in &shard_results {
            values.extend_from_slice(&result.output);
            offsets.push(values.len());
        }

        let gradient = match mode {
            EvalMode::Gradient => Some(GradientAggregator::aggregate(&shard_results)?),
            EvalMode::Values => None,
        };

        Ok(MapRectOutput {
            values,
            offsets,
            shard_results,
            gradient,
        })
    }

    fn evaluate_shard(
        &self,
        worker: usize,
        evaluator: &ShardEvaluator,
        jobs: &RectangularJobSet,
        k: usize,
        mode: EvalMode,
    ) -> std::result::Result<ShardResult, EvalError> {
        let pinned = self.placement.pinned(worker, evaluator, jobs, k)?;
        let shard = jobs.shard(k);
        trace!(shard = k, worker, "evaluating shard");
        pinned
            .compiled
            .run(k, shard.shared_params, shard.local_params, mode)
    }
}

/// One-shot map-reduce with the documented call shape
/// `map_rect(f, shared, local, x_r, x_i)`.
///
/// Builds a default executor for this call only; hold a
/// [`MapReduceExecutor`] instead when evaluating repeatedly so shard data
/// stays pinned.
pub fn map_rect(
    f: impl ShardFunction + 'static,
    shared_params: Vec<f64>,
    local_params: Vec<Vec<f64>>,
    real_data: Vec<Vec<f64>>,
    int_data: Vec<Vec<i64>>,
) -> Result<Vec<f64>> {
    let jobs = RectangularJobSet::new(shared_params, local_params, real_data, int_data)?;
    let executor = MapReduceExecutor::new(ExecutorConfig::default())?;
    let output = executor.run(&ShardEvaluator::new(f), &jobs, EvalMode::Values)?;
    Ok(output.values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, NodeId};
    use crate::jobset::ShardedData;
    use crate::shard::ShardArgs;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    /// out = [shared[0] * Σ x + local[0], int[0]] per shard.
    fn scaled_sum(graph: &mut Graph, args: &ShardArgs<'_>) -> std::result::Result<Vec<NodeId>, EvalError> {
        let x = graph.add_data("x", args.real_data.to_vec());
        let scaled = graph.scalar_mul_data(args.shared[0], x);
        let total = graph.sum(scaled);
        let shifted = graph.add(total, args.local[0]);
        let tag = graph.add_constant(args.int_data[0] as f64);
        Ok(vec![shifted, tag])
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl ShardFunction for Counting {
        fn build(
            &self,
            graph: &mut Graph,
            args: &ShardArgs<'_>,
        ) -> std::result::Result<Vec<NodeId>, EvalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            scaled_sum(graph, args)
        }
    }

    fn sample_jobs(n: usize) -> RectangularJobSet {
        RectangularJobSet::new(
            vec![2.0],
            (0..n).map(|k| vec![k as f64]).collect(),
            (0..n).map(|k| vec![k as f64, 1.0]).collect(),
            (0..n).map(|k| vec![100 + k as i64]).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_concatenates_in_shard_order() {
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(3)).unwrap();
        let output = executor
            .run(&ShardEvaluator::new(scaled_sum), &sample_jobs(5), EvalMode::Values)
            .unwrap();
        // shard k: 2 * (k + 1) + k = 3k + 2, then its tag
        let expected: Vec<f64> = (0..5)
            .flat_map(|k| [3.0 * k as f64 + 2.0, 100.0 + k as f64])
            .collect();
        assert_eq!(output.values, expected);
        assert_eq!(output.offsets, vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(output.shard_output(3), &[11.0, 103.0]);
        assert!(output.gradient.is_none());
    }

    #[test]
    fn test_zero_shards_returns_empty() {
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();
        let jobs = RectangularJobSet::new(vec![1.0], vec![], vec![], vec![]).unwrap();
        let output = executor
            .run(&ShardEvaluator::new(scaled_sum), &jobs, EvalMode::Gradient)
            .unwrap();
        assert!(output.values.is_empty());
        assert_eq!(output.gradient.unwrap().shared, vec![0.0]);
    }

    #[test]
    fn test_shape_error_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let evaluator = ShardEvaluator::new(Counting {
            calls: Arc::clone(&calls),
        });
        let result = RectangularJobSet::new(
            vec![1.0],
            vec![vec![0.0]; 3],
            vec![vec![1.0]; 4],
            vec![vec![1]; 4],
        );
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // the same function does run once the shapes agree
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();
        executor
            .run(&evaluator, &sample_jobs(4), EvalMode::Values)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_failing_shard_aborts_call() {
        // log(local[0]) fails for the negative local parameter of shard 2
        let f = |graph: &mut Graph, args: &ShardArgs<'_>| {
            let lg = graph.log(args.local[0]);
            Ok::<_, EvalError>(vec![lg])
        };
        let jobs = RectangularJobSet::new(
            vec![],
            vec![vec![1.0], vec![2.0], vec![-3.0], vec![4.0]],
            vec![vec![]; 4],
            vec![vec![]; 4],
        )
        .unwrap();
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();
        let err = executor
            .run(&ShardEvaluator::new(f), &jobs, EvalMode::Values)
            .unwrap_err();
        match err {
            Error::ShardEvaluation { shard, source } => {
                assert_eq!(shard, 2);
                assert!(matches!(source, EvalError::Domain { op: "log", .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let evaluator = ShardEvaluator::new(Counting {
            calls: Arc::clone(&calls),
        });
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = executor
            .run_with_cancel(&evaluator, &sample_jobs(3), EvalMode::Values, &token)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_during_run() {
        let token = CancelToken::new();
        let trip = token.clone();
        // shard 0 cancels the run while it is being built
        let f = move |graph: &mut Graph, args: &ShardArgs<'_>| {
            if args.int_data[0] == 100 {
                trip.cancel();
            }
            scaled_sum(graph, args)
        };
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(1)).unwrap();
        let err = executor
            .run_with_cancel(&ShardEvaluator::new(f), &sample_jobs(3), EvalMode::Values, &token)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_data_pinned_once_per_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let evaluator = ShardEvaluator::new(Counting {
            calls: Arc::clone(&calls),
        });
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();
        let data = Arc::new(
            ShardedData::new(
                (0..4).map(|k| vec![k as f64]).collect(),
                (0..4).map(|k| vec![k as i64]).collect(),
            )
            .unwrap(),
        );

        for step in 0..5 {
            let jobs = RectangularJobSet::with_data(
                vec![step as f64],
                vec![vec![0.0]; 4],
                Arc::clone(&data),
            )
            .unwrap();
            let output = executor.run(&evaluator, &jobs, EvalMode::Gradient).unwrap();
            assert_eq!(output.shard_output(3)[0], 3.0 * step as f64);
        }

        let stats = executor.placement().stats();
        assert_eq!(stats.transfers, 4);
        assert_eq!(stats.hits, 16);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(executor.placement().pinned_shards(0), vec![0, 2]);
        assert_eq!(executor.placement().pinned_shards(1), vec![1, 3]);
    }

    #[test]
    fn test_job_sets_rebuilt_from_same_arrays_reuse_pins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let evaluator = ShardEvaluator::new(Counting {
            calls: Arc::clone(&calls),
        });
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();

        for step in 0..5 {
            let jobs = RectangularJobSet::new(
                vec![step as f64],
                vec![vec![0.0]; 4],
                (0..4).map(|k| vec![k as f64]).collect(),
                (0..4).map(|k| vec![k as i64]).collect(),
            )
            .unwrap();
            let output = executor.run(&evaluator, &jobs, EvalMode::Values).unwrap();
            assert_eq!(output.shard_output(2)[0], 2.0 * step as f64);
        }

        let stats = executor.placement().stats();
        assert_eq!(stats.transfers, 4);
        assert_eq!(stats.hits, 16);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_gradient_of_two_shard_model() {
        // shard k: out = shared[0]^2 * x_k + shared[1] * local_k[0]
        let f = |graph: &mut Graph, args: &ShardArgs<'_>| {
            let x = graph.add_constant(args.real_data[0]);
            let a2 = graph.square(args.shared[0]);
            let term1 = graph.mul(a2, x);
            let term2 = graph.mul(args.shared[1], args.local[0]);
            Ok::<_, EvalError>(vec![graph.add(term1, term2)])
        };
        let (a, b) = (1.5, -0.5);
        let (l0, l1) = (2.0, 3.0);
        let (x0, x1) = (4.0, -1.0);
        let jobs = RectangularJobSet::new(
            vec![a, b],
            vec![vec![l0], vec![l1]],
            vec![vec![x0], vec![x1]],
            vec![vec![], vec![]],
        )
        .unwrap();
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(2)).unwrap();
        let output = executor
            .run(&ShardEvaluator::new(f), &jobs, EvalMode::Gradient)
            .unwrap();
        let grad = output.gradient.unwrap();

        let d_a = 2.0 * a * (x0 + x1);
        let d_b = l0 + l1;
        assert!((grad.shared[0] - d_a).abs() < 1e-12);
        assert!((grad.shared[1] - d_b).abs() < 1e-12);
        assert_eq!(grad.local, vec![vec![b], vec![b]]);
        assert_eq!(grad.flatten().len(), 4);
    }

    #[test]
    fn test_map_rect_entry_point() {
        let values = map_rect(
            scaled_sum,
            vec![1.0],
            vec![vec![0.5], vec![0.25]],
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            vec![vec![1], vec![2]],
        )
        .unwrap();
        assert_eq!(values, vec![3.5, 1.0, 7.25, 2.0]);
    }

    #[test]
    fn test_config_from_json() {
        let config: ExecutorConfig = serde_json::from_str(r#"{"num_workers": 3}"#).unwrap();
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.thread_name_prefix, "shardmc-worker");
    }

    proptest! {
        #[test]
        fn prop_order_independent_of_workers(
            n in 0_usize..24,
            workers in 1_usize..8,
            beta in -3.0_f64..3.0,
        ) {
            let jobs = RectangularJobSet::new(
                vec![beta],
                (0..n).map(|k| vec![k as f64 * 0.5]).collect(),
                (0..n).map(|k| vec![k as f64, -1.0, 0.25]).collect(),
                (0..n).map(|k| vec![k as i64]).collect(),
            )
            .unwrap();
            let evaluator = ShardEvaluator::new(scaled_sum);
            let serial = MapReduceExecutor::new(ExecutorConfig::with_workers(1)).unwrap();
            let parallel = MapReduceExecutor::new(ExecutorConfig::with_workers(workers)).unwrap();

            let a = serial.run(&evaluator, &jobs, EvalMode::Gradient).unwrap();
            let b = parallel.run(&evaluator, &jobs, EvalMode::Gradient).unwrap();
            prop_assert_eq!(a.values.len(), 2 * n);
            prop_assert_eq!(&a.values, &b.values);
            prop_assert_eq!(a.gradient, b.gradient);
        }
    }
}
