use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::autodiff::{forward, output_jacobian, output_values};
use crate::errors::EvalError;
use crate::executor::EvalMode;
use crate::graph::{Graph, NodeId};

/// Borrowed view of one unit of work inside a [`RectangularJobSet`].
///
/// [`RectangularJobSet`]: crate::jobset::RectangularJobSet
#[derive(Debug, Clone, Copy)]
pub struct ShardDescriptor<'a> {
    pub index: usize,
    pub shared_params: &'a [f64],
    pub local_params: &'a [f64],
    pub real_data: &'a [f64],
    pub int_data: &'a [i64],
}

/// What a per-shard function sees when it builds its graph.
///
/// Parameters arrive as graph nodes and can be differentiated; real and int
/// data arrive as plain numbers and can only enter the graph as constants.
#[derive(Debug)]
pub struct ShardArgs<'a> {
    pub shared: Vec<NodeId>,
    pub local: Vec<NodeId>,
    pub real_data: &'a [f64],
    pub int_data: &'a [i64],
}

/// The per-shard function `f(shared, local, real_data, int_data) -> vector`.
///
/// `build` records the computation on `graph` and returns the nodes whose
/// values, flattened in order, form the shard's output. It must be a pure
/// function of its arguments: the executor builds each shard once per worker
/// and replays the graph for every new parameter value.
pub trait ShardFunction: Send + Sync {
    fn build(&self, graph: &mut Graph, args: &ShardArgs<'_>) -> Result<Vec<NodeId>, EvalError>;
}

impl<F> ShardFunction for F
where
    F: Fn(&mut Graph, &ShardArgs<'_>) -> Result<Vec<NodeId>, EvalError> + Send + Sync,
{
    fn build(&self, graph: &mut Graph, args: &ShardArgs<'_>) -> Result<Vec<NodeId>, EvalError> {
        self(graph, args)
    }
}

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a [`ShardEvaluator`] (shared by its clones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(u64);

/// A per-shard function plus the identity the placement cache keys on.
#[derive(Clone)]
pub struct ShardEvaluator {
    id: FunctionId,
    function: Arc<dyn ShardFunction>,
}

impl fmt::Debug for ShardEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardEvaluator").field("id", &self.id).finish()
    }
}

impl ShardEvaluator {
    pub fn new(function: impl ShardFunction + 'static) -> Self {
        Self::from_arc(Arc::new(function))
    }

    pub fn from_arc(function: Arc<dyn ShardFunction>) -> Self {
        Self {
            id: FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed)),
            function,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    /// Weak handle that dies with the last clone of this evaluator.
    pub(crate) fn liveness(&self) -> Weak<dyn ShardFunction> {
        Arc::downgrade(&self.function)
    }

    /// Build the shard's graph for the given parameter arity and data.
    pub fn compile(
        &self,
        n_shared: usize,
        n_local: usize,
        real_data: &[f64],
        int_data: &[i64],
    ) -> Result<CompiledShard, EvalError> {
        let mut graph = Graph::new();
        let shared = (0..n_shared)
            .map(|i| graph.add_param(&format!("shared[{i}]")))
            .collect();
        let local = (0..n_local)
            .map(|i| graph.add_param(&format!("local[{i}]")))
            .collect();
        let args = ShardArgs {
            shared,
            local,
            real_data,
            int_data,
        };
        let outputs = self.function.build(&mut graph, &args)?;
        if let Some(bad) = outputs.iter().find(|id| id.0 >= graph.nodes.len()) {
            return Err(EvalError::InvalidOutput(format!(
                "output node {} does not exist",
                bad.0
            )));
        }
        Ok(CompiledShard {
            graph,
            outputs,
            n_shared,
            n_local,
        })
    }

    /// Evaluate `f` once on plain inputs.
    pub fn evaluate(
        &self,
        shared_params: &[f64],
        local_params: &[f64],
        real_data: &[f64],
        int_data: &[i64],
    ) -> Result<Vec<f64>, EvalError> {
        let compiled = self.compile(
            shared_params.len(),
            local_params.len(),
            real_data,
            int_data,
        )?;
        let result = compiled.run(0, shared_params, local_params, EvalMode::Values)?;
        Ok(result.output)
    }

    /// Evaluate `f` and its Jacobian with respect to `[shared, local]`.
    pub fn evaluate_with_jacobian(
        &self,
        shared_params: &[f64],
        local_params: &[f64],
        real_data: &[f64],
        int_data: &[i64],
    ) -> Result<(Vec<f64>, ShardJacobian), EvalError> {
        let compiled = self.compile(
            shared_params.len(),
            local_params.len(),
            real_data,
            int_data,
        )?;
        let result = compiled.run(0, shared_params, local_params, EvalMode::Gradient)?;
        let jacobian = result
            .jacobian
            .ok_or_else(|| EvalError::InvalidOutput("no jacobian recorded".to_string()))?;
        Ok((result.output, jacobian))
    }
}

/// A shard's graph, built once and replayed for every parameter value.
#[derive(Debug, Clone)]
pub struct CompiledShard {
    graph: Graph,
    outputs: Vec<NodeId>,
    n_shared: usize,
    n_local: usize,
}

impl CompiledShard {
    pub fn arity(&self) -> (usize, usize) {
        (self.n_shared, self.n_local)
    }

    pub fn run(
        &self,
        shard: usize,
        shared_params: &[f64],
        local_params: &[f64],
        mode: EvalMode,
    ) -> Result<ShardResult, EvalError> {
        let params: Vec<f64> = shared_params
            .iter()
            .chain(local_params)
            .copied()
            .collect();
        let fwd = forward(&self.graph, &params, mode)?;

        match mode {
            EvalMode::Values => Ok(ShardResult {
                shard,
                output: output_values(&fwd, &self.outputs),
                shared_grad_contribution: Vec::new(),
                local_grad: Vec::new(),
                jacobian: None,
            }),
            EvalMode::Gradient => {
                let (output, rows) = output_jacobian(&self.graph, &fwd, &self.outputs)?;
                let jacobian = ShardJacobian {
                    n_shared: self.n_shared,
                    n_local: self.n_local,
                    rows,
                };
                Ok(ShardResult {
                    shard,
                    output,
                    shared_grad_contribution: jacobian.shared_column_sums(),
                    local_grad: jacobian.local_column_sums(),
                    jacobian: Some(jacobian),
                })
            }
        }
    }
}

/// Partial derivatives of each output element with respect to
/// `[shared_params, local_params]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardJacobian {
    pub n_shared: usize,
    pub n_local: usize,
    pub rows: Vec<Vec<f64>>,
}

impl ShardJacobian {
    pub fn shared(&self, row: usize) -> &[f64] {
        &self.rows[row][..self.n_shared]
    }

    pub fn local(&self, row: usize) -> &[f64] {
        &self.rows[row][self.n_shared..]
    }

    fn shared_column_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.n_shared];
        for r in 0..self.rows.len() {
            for (s, v) in sums.iter_mut().zip(self.shared(r)) {
                *s += v;
            }
        }
        sums
    }

    fn local_column_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.n_local];
        for r in 0..self.rows.len() {
            for (s, v) in sums.iter_mut().zip(self.local(r)) {
                *s += v;
            }
        }
        sums
    }
}

/// Output of one shard, with derivative records when evaluated under
/// [`EvalMode::Gradient`].
///
/// `shared_grad_contribution` and `local_grad` are the derivatives of the sum
/// of `output`; `jacobian` keeps the per-element rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardResult {
    pub shard: usize,
    pub output: Vec<f64>,
    pub shared_grad_contribution: Vec<f64>,
    pub local_grad: Vec<f64>,
    pub jacobian: Option<ShardJacobian>,
}
