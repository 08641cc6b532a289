use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{Error, EvalError, Result};
use crate::executor::MapReduceExecutor;
use crate::jobset::ShardedData;
use crate::shard::ShardEvaluator;

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Operations supported in the computation graph.
#[derive(Debug, Clone)]
pub enum Op {
    /// A differentiable input (index into the parameter vector).
    Param(usize),
    /// A constant scalar value baked into the graph.
    Constant(f64),
    /// Constant data vector (index into the data table).
    Data(usize),
    Add(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Div(NodeId, NodeId),
    Neg(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Square(NodeId),
    /// `log(1 + exp(x))`, evaluated without overflow.
    Log1pExp(NodeId),
    /// Element-wise multiply: scalar * data vector.
    ScalarMulData(NodeId, NodeId),
    /// Element-wise addition of two vectors.
    VectorAdd(NodeId, NodeId),
    /// Broadcast scalar + vector → vector.
    ScalarBroadcastAdd(NodeId, NodeId),
    /// Sum of a vector's elements.
    Sum(NodeId),
    /// One element of a vector.
    Index(NodeId, usize),
    /// Log-probability of a Normal distribution: logp(x | mu, sigma).
    NormalLogP {
        x: NodeId,
        mu: NodeId,
        sigma: NodeId,
    },
    /// Sum-of-log-probabilities for observed data under Normal(mu_vec, sigma).
    NormalObsLogP {
        mu_vec: NodeId,
        sigma: NodeId,
        obs_data_idx: usize,
    },
    /// Sum of Bernoulli log-masses of 0/1 outcomes with logit-scale linear
    /// predictor `eta_vec`.
    BernoulliLogitObsLogP { eta_vec: NodeId, obs_data_idx: usize },
    /// Sum of Poisson log-masses of counts with log-rate `eta_vec`.
    PoissonLogObsLogP { eta_vec: NodeId, obs_data_idx: usize },
    /// Fused linear combination: mu[i] = intercept + Σ_k params[k] * data[k][i]
    ///
    /// Replaces a chain of ScalarMulData + VectorAdd + ScalarBroadcastAdd with
    /// a single pass over the data.
    FusedLinearMu {
        param_nodes: Vec<NodeId>,
        data_indices: Vec<usize>,
        intercept: Option<NodeId>,
    },
    /// Sharded map-reduce over a per-shard function; produces the
    /// concatenation of all shard outputs.
    MapRect {
        job: usize,
        shared: Vec<NodeId>,
        local: Vec<Vec<NodeId>>,
    },
}

impl Op {
    /// Nodes this operation reads from.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            Op::Param(_) | Op::Constant(_) | Op::Data(_) => Vec::new(),
            Op::Add(a, b)
            | Op::Mul(a, b)
            | Op::Sub(a, b)
            | Op::Div(a, b)
            | Op::ScalarMulData(a, b)
            | Op::VectorAdd(a, b)
            | Op::ScalarBroadcastAdd(a, b) => vec![*a, *b],
            Op::Neg(a)
            | Op::Exp(a)
            | Op::Log(a)
            | Op::Square(a)
            | Op::Log1pExp(a)
            | Op::Sum(a)
            | Op::Index(a, _) => vec![*a],
            Op::NormalLogP { x, mu, sigma } => vec![*x, *mu, *sigma],
            Op::NormalObsLogP { mu_vec, sigma, .. } => vec![*mu_vec, *sigma],
            Op::BernoulliLogitObsLogP { eta_vec, .. } | Op::PoissonLogObsLogP { eta_vec, .. } => {
                vec![*eta_vec]
            }
            Op::FusedLinearMu {
                param_nodes,
                intercept,
                ..
            } => param_nodes.iter().copied().chain(*intercept).collect(),
            Op::MapRect { shared, local, .. } => shared
                .iter()
                .copied()
                .chain(local.iter().flatten().copied())
                .collect(),
        }
    }
}

/// A single node in the computation graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub name: Option<String>,
}

/// Everything a `MapRect` node needs to run its shards.
#[derive(Debug, Clone)]
pub struct MapRectJob {
    pub evaluator: ShardEvaluator,
    pub executor: Arc<MapReduceExecutor>,
    pub data: Arc<ShardedData>,
}

/// The computational graph representing a probabilistic model or a single
/// shard's log-density contribution.
///
/// Stores nodes in topological order (each node only references earlier nodes).
/// Data vectors and observed values are stored separately from the graph
/// structure so the graph itself stays lightweight and shareable across threads.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub param_count: usize,
    pub data_vectors: Vec<Vec<f64>>,
    pub obs_vectors: Vec<Vec<f64>>,
    pub param_names: Vec<String>,
    pub logp_terms: Vec<NodeId>,
    pub map_rect_jobs: Vec<MapRectJob>,
    name_to_node: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            param_count: 0,
            data_vectors: Vec::new(),
            obs_vectors: Vec::new(),
            param_names: Vec::new(),
            logp_terms: Vec::new(),
            map_rect_jobs: Vec::new(),
            name_to_node: HashMap::new(),
        }
    }

    fn add_node(&mut self, op: Op, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(ref n) = name {
            self.name_to_node.insert(n.clone(), id);
        }
        self.nodes.push(Node { id, op, name });
        id
    }

    pub fn add_param(&mut self, name: &str) -> NodeId {
        let idx = self.param_count;
        self.param_count += 1;
        self.param_names.push(name.to_string());
        self.add_node(Op::Param(idx), Some(name.to_string()))
    }

    pub fn add_constant(&mut self, value: f64) -> NodeId {
        self.add_node(Op::Constant(value), None)
    }

    pub fn add_data(&mut self, name: &str, values: Vec<f64>) -> NodeId {
        let idx = self.data_vectors.len();
        self.data_vectors.push(values);
        self.add_node(Op::Data(idx), Some(name.to_string()))
    }

    pub fn add_obs_data(&mut self, values: Vec<f64>) -> usize {
        let idx = self.obs_vectors.len();
        self.obs_vectors.push(values);
        idx
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Add(a, b), None)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Mul(a, b), None)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Sub(a, b), None)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Div(a, b), None)
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Neg(a), None)
    }

    pub fn exp(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Exp(a), None)
    }

    pub fn log(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Log(a), None)
    }

    pub fn square(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Square(a), None)
    }

    pub fn log1p_exp(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Log1pExp(a), None)
    }

    pub fn scalar_mul_data(&mut self, scalar: NodeId, data: NodeId) -> NodeId {
        self.add_node(Op::ScalarMulData(scalar, data), None)
    }

    pub fn vector_add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::VectorAdd(a, b), None)
    }

    pub fn scalar_broadcast_add(&mut self, scalar: NodeId, vec: NodeId) -> NodeId {
        self.add_node(Op::ScalarBroadcastAdd(scalar, vec), None)
    }

    pub fn sum(&mut self, vec: NodeId) -> NodeId {
        self.add_node(Op::Sum(vec), None)
    }

    pub fn index(&mut self, vec: NodeId, i: usize) -> NodeId {
        self.add_node(Op::Index(vec, i), None)
    }

    /// Mark an existing scalar node as a term of the model's log density.
    pub fn add_logp_term(&mut self, node: NodeId) {
        self.logp_terms.push(node);
    }

    pub fn normal_logp(&mut self, x: NodeId, mu: NodeId, sigma: NodeId) -> NodeId {
        let node = self.add_node(Op::NormalLogP { x, mu, sigma }, None);
        self.logp_terms.push(node);
        node
    }

    pub fn normal_obs_logp(
        &mut self,
        mu_vec: NodeId,
        sigma: NodeId,
        obs_data_idx: usize,
    ) -> NodeId {
        let node = self.add_node(
            Op::NormalObsLogP {
                mu_vec,
                sigma,
                obs_data_idx,
            },
            None,
        );
        self.logp_terms.push(node);
        node
    }

    pub fn bernoulli_logit_obs_logp(&mut self, eta_vec: NodeId, obs_data_idx: usize) -> NodeId {
        let node = self.add_node(
            Op::BernoulliLogitObsLogP {
                eta_vec,
                obs_data_idx,
            },
            None,
        );
        self.logp_terms.push(node);
        node
    }

    pub fn poisson_log_obs_logp(&mut self, eta_vec: NodeId, obs_data_idx: usize) -> NodeId {
        let node = self.add_node(
            Op::PoissonLogObsLogP {
                eta_vec,
                obs_data_idx,
            },
            None,
        );
        self.logp_terms.push(node);
        node
    }

    /// Store a data vector without creating a graph node (used by FusedLinearMu).
    pub fn store_data_vec(&mut self, values: Vec<f64>) -> usize {
        let idx = self.data_vectors.len();
        self.data_vectors.push(values);
        idx
    }

    pub fn fused_linear_mu(
        &mut self,
        param_nodes: Vec<NodeId>,
        data_indices: Vec<usize>,
        intercept: Option<NodeId>,
    ) -> NodeId {
        self.add_node(
            Op::FusedLinearMu {
                param_nodes,
                data_indices,
                intercept,
            },
            None,
        )
    }

    /// Add a map-reduce node whose constant data is already plain numbers.
    ///
    /// `shared` and each `local[k]` must be scalar nodes. The returned node is
    /// a vector holding every shard's output in shard order.
    pub fn map_rect_with_data(
        &mut self,
        evaluator: ShardEvaluator,
        executor: Arc<MapReduceExecutor>,
        shared: Vec<NodeId>,
        local: Vec<Vec<NodeId>>,
        data: Arc<ShardedData>,
    ) -> Result<NodeId> {
        if local.len() != data.len() {
            return Err(Error::ShapeMismatch {
                local: local.len(),
                real: data.len(),
                int: data.len(),
            });
        }
        let job = self.map_rect_jobs.len();
        self.map_rect_jobs.push(MapRectJob {
            evaluator,
            executor,
            data,
        });
        Ok(self.add_node(Op::MapRect { job, shared, local }, None))
    }

    /// Add a map-reduce node whose real data is given as graph nodes.
    ///
    /// Every real-data node must be computable without parameters; one that
    /// depends on a parameter is rejected with
    /// [`Error::ConstantDataViolation`] before anything is evaluated.
    pub fn map_rect(
        &mut self,
        evaluator: ShardEvaluator,
        executor: Arc<MapReduceExecutor>,
        shared: Vec<NodeId>,
        local: Vec<Vec<NodeId>>,
        real: Vec<Vec<NodeId>>,
        int: Vec<Vec<i64>>,
    ) -> Result<NodeId> {
        if local.len() != real.len() || real.len() != int.len() {
            return Err(Error::ShapeMismatch {
                local: local.len(),
                real: real.len(),
                int: int.len(),
            });
        }

        let depends = self.param_dependence();
        let mut real_values = Vec::with_capacity(real.len());
        for (shard, row) in real.iter().enumerate() {
            let mut values = Vec::with_capacity(row.len());
            for (column, node) in row.iter().enumerate() {
                if depends[node.0] {
                    return Err(Error::ConstantDataViolation { shard, column });
                }
                values.push(self.fold_constant(*node)?);
            }
            real_values.push(values);
        }

        let data = Arc::new(ShardedData::new(real_values, int)?);
        self.map_rect_with_data(evaluator, executor, shared, local, data)
    }

    /// For every node, whether its value depends on any parameter.
    pub fn param_dependence(&self) -> Vec<bool> {
        let mut depends = vec![false; self.nodes.len()];
        for node in &self.nodes {
            depends[node.id.0] = match &node.op {
                Op::Param(_) => true,
                op => op.operands().iter().any(|o| depends[o.0]),
            };
        }
        depends
    }

    /// Evaluate a parameter-free scalar node.
    fn fold_constant(&self, id: NodeId) -> std::result::Result<f64, EvalError> {
        let scalar = |e: NodeId| self.fold_constant(e);
        let value = match &self.nodes[id.0].op {
            Op::Constant(c) => *c,
            Op::Add(a, b) => scalar(*a)? + scalar(*b)?,
            Op::Sub(a, b) => scalar(*a)? - scalar(*b)?,
            Op::Mul(a, b) => scalar(*a)? * scalar(*b)?,
            Op::Div(a, b) => scalar(*a)? / scalar(*b)?,
            Op::Neg(a) => -scalar(*a)?,
            Op::Exp(a) => scalar(*a)?.exp(),
            Op::Log(a) => scalar(*a)?.ln(),
            Op::Square(a) => scalar(*a)?.powi(2),
            Op::Log1pExp(a) => crate::autodiff::log1p_exp(scalar(*a)?),
            Op::Index(v, i) => match &self.nodes[v.0].op {
                Op::Data(idx) => self.data_vectors[*idx]
                    .get(*i)
                    .copied()
                    .ok_or(EvalError::LengthMismatch {
                        op: "index",
                        left: self.data_vectors[*idx].len(),
                        right: *i,
                    })?,
                _ => {
                    return Err(EvalError::TypeMismatch {
                        node: id.0,
                        expected: "constant scalar",
                    })
                }
            },
            _ => {
                return Err(EvalError::TypeMismatch {
                    node: id.0,
                    expected: "constant scalar",
                })
            }
        };
        Ok(value)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
