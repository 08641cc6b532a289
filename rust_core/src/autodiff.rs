use std::collections::HashMap;

use crate::aggregator::GradientAggregator;
use crate::errors::{EvalError, Result};
use crate::executor::{EvalMode, MapRectOutput};
use crate::graph::{Graph, NodeId, Op};
use crate::jobset::RectangularJobSet;

/// Value produced by evaluating a node. Scalars and vectors are tracked
/// separately so the graph can mix element-wise data operations with
/// scalar parameter operations without unnecessary heap allocation for
/// the common scalar case.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    pub fn as_scalar(&self, node: usize) -> std::result::Result<f64, EvalError> {
        match self {
            Value::Scalar(v) => Ok(*v),
            Value::Vector(_) => Err(EvalError::TypeMismatch {
                node,
                expected: "scalar",
            }),
        }
    }

    pub fn as_vector(&self, node: usize) -> std::result::Result<&[f64], EvalError> {
        match self {
            Value::Vector(v) => Ok(v),
            Value::Scalar(_) => Err(EvalError::TypeMismatch {
                node,
                expected: "vector",
            }),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Vector(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flatten_into(&self, out: &mut Vec<f64>) {
        match self {
            Value::Scalar(v) => out.push(*v),
            Value::Vector(v) => out.extend_from_slice(v),
        }
    }
}

/// Result of a forward pass: one value per node, plus the shard results of
/// every `MapRect` node so the reverse pass can reuse their derivatives.
#[derive(Debug)]
pub struct Forward {
    pub values: Vec<Value>,
    map_rect: HashMap<usize, MapRectOutput>,
}

fn scalar(values: &[Value], id: NodeId) -> std::result::Result<f64, EvalError> {
    values[id.0].as_scalar(id.0)
}

fn vector(values: &[Value], id: NodeId) -> std::result::Result<&[f64], EvalError> {
    values[id.0].as_vector(id.0)
}

fn check_len(op: &'static str, left: usize, right: usize) -> std::result::Result<(), EvalError> {
    if left == right {
        Ok(())
    } else {
        Err(EvalError::LengthMismatch { op, left, right })
    }
}

fn check_scale(op: &'static str, sigma: f64) -> std::result::Result<(), EvalError> {
    if sigma > 0.0 && sigma.is_finite() {
        Ok(())
    } else {
        Err(EvalError::domain(
            op,
            format!("scale {sigma} must be positive and finite"),
        ))
    }
}

/// Forward-evaluate every node in the graph and return the per-node values.
///
/// `mode` decides whether embedded map-reduce nodes also record shard
/// derivatives for a later [`reverse`] pass.
pub fn forward(graph: &Graph, params: &[f64], mode: EvalMode) -> Result<Forward> {
    check_len("params", params.len(), graph.param_count)?;

    let mut values: Vec<Value> = Vec::with_capacity(graph.nodes.len());
    let mut map_rect = HashMap::new();

    for node in &graph.nodes {
        let val = match &node.op {
            Op::Param(idx) => Value::Scalar(params[*idx]),
            Op::Constant(c) => Value::Scalar(*c),
            Op::Data(idx) => Value::Vector(graph.data_vectors[*idx].clone()),
            Op::Add(a, b) => Value::Scalar(scalar(&values, *a)? + scalar(&values, *b)?),
            Op::Sub(a, b) => Value::Scalar(scalar(&values, *a)? - scalar(&values, *b)?),
            Op::Mul(a, b) => Value::Scalar(scalar(&values, *a)? * scalar(&values, *b)?),
            Op::Div(a, b) => {
                let vb = scalar(&values, *b)?;
                if vb == 0.0 {
                    return Err(EvalError::domain("div", "division by zero").into());
                }
                Value::Scalar(scalar(&values, *a)? / vb)
            }
            Op::Neg(a) => Value::Scalar(-scalar(&values, *a)?),
            Op::Exp(a) => Value::Scalar(scalar(&values, *a)?.exp()),
            Op::Log(a) => {
                let va = scalar(&values, *a)?;
                // zero is rejected too: its adjoint would be infinite
                if va.is_nan() || va <= 0.0 {
                    return Err(
                        EvalError::domain("log", format!("argument {va} is not positive")).into(),
                    );
                }
                Value::Scalar(va.ln())
            }
            Op::Square(a) => {
                let v = scalar(&values, *a)?;
                Value::Scalar(v * v)
            }
            Op::Log1pExp(a) => Value::Scalar(log1p_exp(scalar(&values, *a)?)),
            Op::ScalarMulData(s, data) => {
                let s = scalar(&values, *s)?;
                let d = vector(&values, *data)?;
                Value::Vector(d.iter().map(|x| s * x).collect())
            }
            Op::VectorAdd(a, b) => {
                let va = vector(&values, *a)?;
                let vb = vector(&values, *b)?;
                check_len("vector_add", va.len(), vb.len())?;
                Value::Vector(va.iter().zip(vb).map(|(x, y)| x + y).collect())
            }
            Op::ScalarBroadcastAdd(s, v) => {
                let s = scalar(&values, *s)?;
                let v = vector(&values, *v)?;
                Value::Vector(v.iter().map(|x| s + x).collect())
            }
            Op::Sum(v) => Value::Scalar(vector(&values, *v)?.iter().sum()),
            Op::Index(v, i) => {
                let v = vector(&values, *v)?;
                let x = v.get(*i).copied().ok_or(EvalError::LengthMismatch {
                    op: "index",
                    left: v.len(),
                    right: *i,
                })?;
                Value::Scalar(x)
            }
            Op::NormalLogP { x, mu, sigma } => {
                let xv = scalar(&values, *x)?;
                let mv = scalar(&values, *mu)?;
                let sv = scalar(&values, *sigma)?;
                check_scale("normal_lpdf", sv)?;
                Value::Scalar(normal_logp_scalar(xv, mv, sv))
            }
            Op::NormalObsLogP {
                mu_vec,
                sigma,
                obs_data_idx,
            } => {
                let mu = vector(&values, *mu_vec)?;
                let sv = scalar(&values, *sigma)?;
                let obs = &graph.obs_vectors[*obs_data_idx];
                check_scale("normal_lpdf", sv)?;
                check_len("normal_lpdf", mu.len(), obs.len())?;
                Value::Scalar(normal_obs_logp_sum(mu, sv, obs))
            }
            Op::BernoulliLogitObsLogP {
                eta_vec,
                obs_data_idx,
            } => {
                let eta = vector(&values, *eta_vec)?;
                let obs = &graph.obs_vectors[*obs_data_idx];
                check_len("bernoulli_logit_lpmf", eta.len(), obs.len())?;
                let lp: f64 = eta
                    .iter()
                    .zip(obs.iter())
                    .map(|(e, y)| y * e - log1p_exp(*e))
                    .sum();
                Value::Scalar(lp)
            }
            Op::PoissonLogObsLogP {
                eta_vec,
                obs_data_idx,
            } => {
                let eta = vector(&values, *eta_vec)?;
                let obs = &graph.obs_vectors[*obs_data_idx];
                check_len("poisson_log_lpmf", eta.len(), obs.len())?;
                let lp: f64 = eta
                    .iter()
                    .zip(obs.iter())
                    .map(|(e, y)| y * e - e.exp() - ln_factorial(*y as u64))
                    .sum();
                Value::Scalar(lp)
            }
            Op::FusedLinearMu {
                param_nodes,
                data_indices,
                intercept,
            } => {
                let n = data_indices
                    .first()
                    .map(|idx| graph.data_vectors[*idx].len())
                    .unwrap_or(0);
                let mut mu = match intercept {
                    Some(id) => vec![scalar(&values, *id)?; n],
                    None => vec![0.0; n],
                };
                for (p, idx) in param_nodes.iter().zip(data_indices) {
                    let coef = scalar(&values, *p)?;
                    let data = &graph.data_vectors[*idx];
                    check_len("fused_linear_mu", data.len(), n)?;
                    for (m, x) in mu.iter_mut().zip(data) {
                        *m += coef * x;
                    }
                }
                Value::Vector(mu)
            }
            Op::MapRect { job, shared, local } => {
                let job = &graph.map_rect_jobs[*job];
                let shared_values = shared
                    .iter()
                    .map(|id| scalar(&values, *id))
                    .collect::<std::result::Result<Vec<f64>, EvalError>>()?;
                let local_values = local
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|id| scalar(&values, *id))
                            .collect::<std::result::Result<Vec<f64>, EvalError>>()
                    })
                    .collect::<std::result::Result<Vec<_>, EvalError>>()?;
                let jobs =
                    RectangularJobSet::with_data(shared_values, local_values, job.data.clone())?;
                let output = job.executor.run(&job.evaluator, &jobs, mode)?;
                let val = Value::Vector(output.values.clone());
                map_rect.insert(node.id.0, output);
                val
            }
        };
        values.push(val);
    }

    Ok(Forward { values, map_rect })
}

/// Adjoint storage for one reverse pass. Vector nodes get vector adjoints via
/// a separate table.
#[derive(Debug, Clone)]
pub struct Adjoints {
    pub scalar: Vec<f64>,
    pub vector: Vec<Option<Vec<f64>>>,
}

impl Adjoints {
    pub fn new(n: usize) -> Self {
        Self {
            scalar: vec![0.0; n],
            vector: vec![None; n],
        }
    }

    fn reset(&mut self, n: usize) {
        self.scalar.clear();
        self.scalar.resize(n, 0.0);
        self.vector.clear();
        self.vector.resize(n, None);
    }
}

/// Reverse pass: propagate the seeded adjoints back to the parameters.
pub fn reverse(graph: &Graph, fwd: &Forward, adj: &mut Adjoints) -> Result<()> {
    let values = &fwd.values;

    for node in graph.nodes.iter().rev() {
        let idx = node.id.0;
        let a_s = adj.scalar[idx];

        match &node.op {
            Op::Param(_) | Op::Constant(_) | Op::Data(_) => {}

            Op::Add(a, b) => {
                adj.scalar[a.0] += a_s;
                adj.scalar[b.0] += a_s;
            }
            Op::Sub(a, b) => {
                adj.scalar[a.0] += a_s;
                adj.scalar[b.0] -= a_s;
            }
            Op::Mul(a, b) => {
                let va = scalar(values, *a)?;
                let vb = scalar(values, *b)?;
                adj.scalar[a.0] += a_s * vb;
                adj.scalar[b.0] += a_s * va;
            }
            Op::Div(a, b) => {
                let va = scalar(values, *a)?;
                let vb = scalar(values, *b)?;
                adj.scalar[a.0] += a_s / vb;
                adj.scalar[b.0] -= a_s * va / (vb * vb);
            }
            Op::Neg(a) => {
                adj.scalar[a.0] -= a_s;
            }
            Op::Exp(a) => {
                adj.scalar[a.0] += a_s * scalar(values, *a)?.exp();
            }
            Op::Log(a) => {
                adj.scalar[a.0] += a_s / scalar(values, *a)?;
            }
            Op::Square(a) => {
                adj.scalar[a.0] += a_s * 2.0 * scalar(values, *a)?;
            }
            Op::Log1pExp(a) => {
                adj.scalar[a.0] += a_s * sigmoid(scalar(values, *a)?);
            }
            Op::ScalarMulData(s, data) => {
                let Some(upstream) = adj.vector[idx].take() else {
                    continue;
                };
                let sv = scalar(values, *s)?;
                let d = vector(values, *data)?;
                // d(output_i)/d(scalar) = data_i  =>  adj(scalar) += sum(upstream_i * data_i)
                adj.scalar[s.0] += upstream.iter().zip(d).map(|(u, di)| u * di).sum::<f64>();
                let dd: Vec<f64> = upstream.iter().map(|u| u * sv).collect();
                merge_vec_adj(&mut adj.vector[data.0], &dd);
            }
            Op::VectorAdd(a, b) => {
                let Some(upstream) = adj.vector[idx].take() else {
                    continue;
                };
                merge_vec_adj(&mut adj.vector[a.0], &upstream);
                merge_vec_adj(&mut adj.vector[b.0], &upstream);
            }
            Op::ScalarBroadcastAdd(s, v) => {
                let Some(upstream) = adj.vector[idx].take() else {
                    continue;
                };
                adj.scalar[s.0] += upstream.iter().sum::<f64>();
                merge_vec_adj(&mut adj.vector[v.0], &upstream);
            }
            Op::Sum(v) => {
                let n = vector(values, *v)?.len();
                merge_vec_adj(&mut adj.vector[v.0], &vec![a_s; n]);
            }
            Op::Index(v, i) => {
                let mut one_hot = vec![0.0; vector(values, *v)?.len()];
                one_hot[*i] = a_s;
                merge_vec_adj(&mut adj.vector[v.0], &one_hot);
            }
            Op::NormalLogP { x, mu, sigma } => {
                let xv = scalar(values, *x)?;
                let mv = scalar(values, *mu)?;
                let sv = scalar(values, *sigma)?;
                let diff = xv - mv;
                let s2 = sv * sv;
                // d logp / d x = -(x - mu) / sigma^2
                adj.scalar[x.0] += a_s * (-diff / s2);
                // d logp / d mu = (x - mu) / sigma^2
                adj.scalar[mu.0] += a_s * (diff / s2);
                // d logp / d sigma = (x - mu)^2 / sigma^3 - 1/sigma
                adj.scalar[sigma.0] += a_s * (diff * diff / (s2 * sv) - 1.0 / sv);
            }
            Op::NormalObsLogP {
                mu_vec,
                sigma,
                obs_data_idx,
            } => {
                let mu = vector(values, *mu_vec)?;
                let sv = scalar(values, *sigma)?;
                let obs = &graph.obs_vectors[*obs_data_idx];
                let s2 = sv * sv;

                let dmu: Vec<f64> = mu
                    .iter()
                    .zip(obs.iter())
                    .map(|(m, o)| a_s * (o - m) / s2)
                    .collect();
                merge_vec_adj(&mut adj.vector[mu_vec.0], &dmu);

                let dsigma: f64 = mu
                    .iter()
                    .zip(obs.iter())
                    .map(|(m, o)| {
                        let diff = o - m;
                        diff * diff / (s2 * sv) - 1.0 / sv
                    })
                    .sum();
                adj.scalar[sigma.0] += a_s * dsigma;
            }
            Op::BernoulliLogitObsLogP {
                eta_vec,
                obs_data_idx,
            } => {
                let eta = vector(values, *eta_vec)?;
                let obs = &graph.obs_vectors[*obs_data_idx];
                // d/d eta_i = y_i - sigmoid(eta_i)
                let deta: Vec<f64> = eta
                    .iter()
                    .zip(obs.iter())
                    .map(|(e, y)| a_s * (y - sigmoid(*e)))
                    .collect();
                merge_vec_adj(&mut adj.vector[eta_vec.0], &deta);
            }
            Op::PoissonLogObsLogP {
                eta_vec,
                obs_data_idx,
            } => {
                let eta = vector(values, *eta_vec)?;
                let obs = &graph.obs_vectors[*obs_data_idx];
                let deta: Vec<f64> = eta
                    .iter()
                    .zip(obs.iter())
                    .map(|(e, y)| a_s * (y - e.exp()))
                    .collect();
                merge_vec_adj(&mut adj.vector[eta_vec.0], &deta);
            }
            Op::FusedLinearMu {
                param_nodes,
                data_indices,
                intercept,
            } => {
                let Some(upstream) = adj.vector[idx].take() else {
                    continue;
                };
                for (p, data_idx) in param_nodes.iter().zip(data_indices) {
                    let data = &graph.data_vectors[*data_idx];
                    adj.scalar[p.0] += upstream.iter().zip(data).map(|(u, x)| u * x).sum::<f64>();
                }
                if let Some(id) = intercept {
                    adj.scalar[id.0] += upstream.iter().sum::<f64>();
                }
            }
            Op::MapRect { shared, local, .. } => {
                let Some(upstream) = adj.vector[idx].take() else {
                    continue;
                };
                let Some(output) = fwd.map_rect.get(&idx) else {
                    continue;
                };
                let grad = GradientAggregator::aggregate_weighted(&output.shard_results, &upstream)?;
                for (id, g) in shared.iter().zip(&grad.shared) {
                    adj.scalar[id.0] += g;
                }
                for (ids, block) in local.iter().zip(&grad.local) {
                    for (id, g) in ids.iter().zip(block) {
                        adj.scalar[id.0] += g;
                    }
                }
            }
        }
    }

    Ok(())
}

fn param_gradient(graph: &Graph, adj: &Adjoints) -> Vec<f64> {
    let mut grad = vec![0.0; graph.param_count];
    for node in &graph.nodes {
        if let Op::Param(pidx) = node.op {
            grad[pidx] += adj.scalar[node.id.0];
        }
    }
    grad
}

/// Reusable evaluator for the total log-probability and its gradient.
#[derive(Debug, Clone)]
pub struct Evaluator {
    adj: Adjoints,
    pub total_logp: f64,
    pub grad: Vec<f64>,
}

impl Evaluator {
    pub fn new(graph: &Graph) -> Self {
        Self {
            adj: Adjoints::new(graph.nodes.len()),
            total_logp: 0.0,
            grad: vec![0.0; graph.param_count],
        }
    }

    pub fn compute(&mut self, graph: &Graph, params: &[f64]) -> Result<()> {
        let fwd = forward(graph, params, EvalMode::Gradient)?;
        self.total_logp = total_logp(graph, &fwd)?;

        self.adj.reset(graph.nodes.len());
        // Seed: d(total_logp)/d(logp_term) = 1.0
        for &id in &graph.logp_terms {
            self.adj.scalar[id.0] += 1.0;
        }
        reverse(graph, &fwd, &mut self.adj)?;
        self.grad = param_gradient(graph, &self.adj);
        Ok(())
    }
}

fn total_logp(graph: &Graph, fwd: &Forward) -> Result<f64> {
    let mut total = 0.0;
    for id in &graph.logp_terms {
        total += scalar(&fwd.values, *id)?;
    }
    Ok(total)
}

/// Compute the total log-probability (sum of all logp_terms).
pub fn eval_logp(graph: &Graph, params: &[f64]) -> Result<f64> {
    let fwd = forward(graph, params, EvalMode::Values)?;
    total_logp(graph, &fwd)
}

/// Reverse-mode autodiff: compute gradient of total log-probability w.r.t. params.
pub fn grad_logp(graph: &Graph, params: &[f64]) -> Result<(f64, Vec<f64>)> {
    let mut evaluator = Evaluator::new(graph);
    evaluator.compute(graph, params)?;
    Ok((evaluator.total_logp, evaluator.grad))
}

/// Values of `outputs` flattened in order, and the Jacobian of that flat
/// vector with respect to every parameter (one row per output element).
pub fn output_jacobian(
    graph: &Graph,
    fwd: &Forward,
    outputs: &[NodeId],
) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
    let n = graph.nodes.len();
    let mut flat = Vec::new();
    for o in outputs {
        fwd.values[o.0].flatten_into(&mut flat);
    }

    let mut adj = Adjoints::new(n);
    let mut rows = Vec::with_capacity(flat.len());
    for o in outputs {
        match &fwd.values[o.0] {
            Value::Scalar(_) => {
                adj.reset(n);
                adj.scalar[o.0] = 1.0;
                reverse(graph, fwd, &mut adj)?;
                rows.push(param_gradient(graph, &adj));
            }
            Value::Vector(v) => {
                for j in 0..v.len() {
                    adj.reset(n);
                    let mut seed = vec![0.0; v.len()];
                    seed[j] = 1.0;
                    adj.vector[o.0] = Some(seed);
                    reverse(graph, fwd, &mut adj)?;
                    rows.push(param_gradient(graph, &adj));
                }
            }
        }
    }

    Ok((flat, rows))
}

/// Flattened values of `outputs` after a forward pass.
pub fn output_values(fwd: &Forward, outputs: &[NodeId]) -> Vec<f64> {
    let mut flat = Vec::new();
    for o in outputs {
        fwd.values[o.0].flatten_into(&mut flat);
    }
    flat
}

fn merge_vec_adj(slot: &mut Option<Vec<f64>>, incoming: &[f64]) {
    match slot {
        Some(ref mut existing) => {
            for (e, i) in existing.iter_mut().zip(incoming.iter()) {
                *e += i;
            }
        }
        None => {
            *slot = Some(incoming.to_vec());
        }
    }
}

pub(crate) fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn ln_factorial(n: u64) -> f64 {
    if n < 2 {
        return 0.0;
    }
    if n <= 32 {
        return (2..=n).map(|k| (k as f64).ln()).sum();
    }
    // Stirling series; the truncation error is far below f64 precision here.
    let x = n as f64;
    x * x.ln() - x + 0.5 * (std::f64::consts::TAU * x).ln() + 1.0 / (12.0 * x)
        - 1.0 / (360.0 * x.powi(3))
}

fn normal_logp_scalar(x: f64, mu: f64, sigma: f64) -> f64 {
    let diff = x - mu;
    -0.5 * (diff * diff) / (sigma * sigma) - sigma.ln() - 0.5 * std::f64::consts::TAU.ln()
}

fn normal_obs_logp_sum(mu: &[f64], sigma: f64, obs: &[f64]) -> f64 {
    let s2 = sigma * sigma;
    let log_norm = -0.5 * std::f64::consts::TAU.ln() - sigma.ln();
    let n = obs.len() as f64;
    let sum_sq: f64 = mu
        .iter()
        .zip(obs.iter())
        .map(|(m, o)| {
            let d = o - m;
            d * d
        })
        .sum();
    n * log_norm - 0.5 * sum_sq / s2
}
