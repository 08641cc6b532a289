use ndarray::Array2;
use numpy::{IntoPyArray, PyArray1, PyArray2};
use pyo3::create_exception;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use shardmc_core::distributions::Normal;
use shardmc_core::executor::{EvalMode, ExecutorConfig, MapRectOutput, MapReduceExecutor};
use shardmc_core::graph::Graph;
use shardmc_core::jobset::{RectangularJobSet, ShardedData};
use shardmc_core::models::{HierarchicalNormalShard, LogisticShard};
use shardmc_core::ode::{self, OdeMethod, OdeProblem, OdeSystem, Tolerances};
use shardmc_core::sampler::{self, SampleResult, SamplerConfig};
use shardmc_core::shard::ShardEvaluator;
use shardmc_core::{Error, EvalError};
use std::sync::Arc;

create_exception!(shardmc, ShapeMismatchError, PyValueError);
create_exception!(shardmc, RaggedRowError, ShapeMismatchError);
create_exception!(shardmc, ConstantDataViolationError, PyValueError);
create_exception!(shardmc, ShardEvaluationError, PyRuntimeError);
create_exception!(shardmc, SolverDivergenceError, PyRuntimeError);

/// Python exception class raised for each core error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    ShapeMismatch,
    RaggedRow,
    ConstantDataViolation,
    ShardEvaluation,
    SolverDivergence,
    Value,
    Runtime,
}

fn classify(e: &Error) -> ErrorClass {
    match e {
        Error::ShapeMismatch { .. } => ErrorClass::ShapeMismatch,
        Error::RaggedRow { .. } => ErrorClass::RaggedRow,
        Error::ConstantDataViolation { .. } => ErrorClass::ConstantDataViolation,
        Error::ShardEvaluation { .. } => ErrorClass::ShardEvaluation,
        Error::SolverDivergence { .. } => ErrorClass::SolverDivergence,
        Error::InvalidSolverConfig(_) | Error::AdjointLength { .. } => ErrorClass::Value,
        _ => ErrorClass::Runtime,
    }
}

fn to_py_err(e: Error) -> PyErr {
    let msg = e.to_string();
    match classify(&e) {
        ErrorClass::ShapeMismatch => ShapeMismatchError::new_err(msg),
        ErrorClass::RaggedRow => RaggedRowError::new_err(msg),
        ErrorClass::ConstantDataViolation => ConstantDataViolationError::new_err(msg),
        ErrorClass::ShardEvaluation => ShardEvaluationError::new_err(msg),
        ErrorClass::SolverDivergence => SolverDivergenceError::new_err(msg),
        ErrorClass::Value => PyValueError::new_err(msg),
        ErrorClass::Runtime => PyRuntimeError::new_err(msg),
    }
}

/// Built-in per-shard functions selectable by name.
fn shard_model(model: &str, sigma: f64) -> PyResult<ShardEvaluator> {
    match model {
        "logistic" => Ok(ShardEvaluator::new(LogisticShard)),
        "hierarchical_normal" => Ok(ShardEvaluator::new(HierarchicalNormalShard { sigma })),
        other => Err(PyValueError::new_err(format!(
            "Unknown model '{}', expected 'logistic' or 'hierarchical_normal'",
            other
        ))),
    }
}

#[pyclass]
struct MapRectResult {
    output: MapRectOutput,
}

#[pymethods]
impl MapRectResult {
    #[getter]
    fn values<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        PyArray1::from_vec(py, self.output.values.clone())
    }

    #[getter]
    fn offsets(&self) -> Vec<usize> {
        self.output.offsets.clone()
    }

    /// Gradient of the summed output w.r.t. the shared parameters, if requested.
    #[getter]
    fn shared_grad<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyArray1<f64>>> {
        self.output
            .gradient
            .as_ref()
            .map(|g| PyArray1::from_vec(py, g.shared.clone()))
    }

    /// One gradient block per shard for its local parameters, if requested.
    #[getter]
    fn local_grad(&self) -> Option<Vec<Vec<f64>>> {
        self.output.gradient.as_ref().map(|g| g.local.clone())
    }

    fn shard_output<'py>(&self, py: Python<'py>, shard: usize) -> PyResult<Bound<'py, PyArray1<f64>>> {
        if shard + 1 >= self.output.offsets.len() {
            return Err(PyValueError::new_err(format!(
                "Shard {} out of range for {} shards",
                shard,
                self.output.offsets.len() - 1
            )));
        }
        Ok(PyArray1::from_vec(py, self.output.shard_output(shard).to_vec()))
    }

    fn total(&self) -> f64 {
        self.output.total()
    }

    fn __len__(&self) -> usize {
        self.output.values.len()
    }

    fn __repr__(&self) -> String {
        format!(
            "shardmc MapRectResult ({} shards, {} values, gradient={})",
            self.output.offsets.len() - 1,
            self.output.values.len(),
            self.output.gradient.is_some()
        )
    }
}

/// A built-in shard model bound to its data set, evaluated on a private
/// worker pool. Shard data stays pinned on the workers across calls.
#[pyclass]
struct MapReduce {
    executor: Arc<MapReduceExecutor>,
    evaluator: ShardEvaluator,
    data: Arc<ShardedData>,
}

#[pymethods]
impl MapReduce {
    #[new]
    #[pyo3(signature = (model, x_r, x_i, workers=0, sigma=1.0))]
    fn new(
        model: &str,
        x_r: Vec<Vec<f64>>,
        x_i: Vec<Vec<i64>>,
        workers: usize,
        sigma: f64,
    ) -> PyResult<Self> {
        let evaluator = shard_model(model, sigma)?;
        let data = Arc::new(ShardedData::new(x_r, x_i).map_err(to_py_err)?);
        let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(workers)).map_err(to_py_err)?;
        Ok(Self {
            executor: Arc::new(executor),
            evaluator,
            data,
        })
    }

    #[pyo3(signature = (shared, local, gradient=false))]
    fn run(
        &self,
        py: Python<'_>,
        shared: Vec<f64>,
        local: Vec<Vec<f64>>,
        gradient: bool,
    ) -> PyResult<MapRectResult> {
        let jobs = RectangularJobSet::with_data(shared, local, Arc::clone(&self.data))
            .map_err(to_py_err)?;
        let mode = if gradient {
            EvalMode::Gradient
        } else {
            EvalMode::Values
        };
        let output = py
            .allow_threads(|| self.executor.run(&self.evaluator, &jobs, mode))
            .map_err(to_py_err)?;
        Ok(MapRectResult { output })
    }

    #[getter]
    fn workers(&self) -> usize {
        self.executor.workers()
    }

    fn placement_stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.executor.placement().stats();
        let dict = PyDict::new(py);
        dict.set_item("transfers", stats.transfers)?;
        dict.set_item("bytes_transferred", stats.bytes_transferred)?;
        dict.set_item("hits", stats.hits)?;
        Ok(dict)
    }
}

/// One-shot `map_rect(model, shared, local, x_r, x_i)`.
#[pyfunction]
#[pyo3(signature = (model, shared, local, x_r, x_i, workers=0, gradient=false, sigma=1.0))]
#[allow(clippy::too_many_arguments)]
fn map_rect(
    py: Python<'_>,
    model: &str,
    shared: Vec<f64>,
    local: Vec<Vec<f64>>,
    x_r: Vec<Vec<f64>>,
    x_i: Vec<Vec<i64>>,
    workers: usize,
    gradient: bool,
    sigma: f64,
) -> PyResult<MapRectResult> {
    if local.len() != x_r.len() || x_r.len() != x_i.len() {
        return Err(to_py_err(Error::ShapeMismatch {
            local: local.len(),
            real: x_r.len(),
            int: x_i.len(),
        }));
    }
    MapReduce::new(model, x_r, x_i, workers, sigma)?.run(py, shared, local, gradient)
}

/// Right-hand side implemented by a Python callable
/// `f(t, y, theta, x_r, x_i) -> sequence of floats`.
struct PyOdeSystem {
    f: PyObject,
}

impl OdeSystem for PyOdeSystem {
    fn derivative(
        &self,
        t: f64,
        y: &[f64],
        theta: &[f64],
        x_r: &[f64],
        x_i: &[i64],
    ) -> Result<Vec<f64>, EvalError> {
        Python::with_gil(|py| {
            let out = self
                .f
                .call1(py, (t, y.to_vec(), theta.to_vec(), x_r.to_vec(), x_i.to_vec()))
                .map_err(|e| EvalError::Nested(e.to_string()))?;
            out.extract::<Vec<f64>>(py)
                .map_err(|e| EvalError::InvalidOutput(e.to_string()))
        })
    }
}

#[pyfunction]
#[pyo3(signature = (f, y0, t0, ts, theta=Vec::new(), x_r=Vec::new(), x_i=Vec::new(), method="rk45", rtol=None, atol=None, max_steps=None))]
#[allow(clippy::too_many_arguments)]
fn solve_ode<'py>(
    py: Python<'py>,
    f: PyObject,
    y0: Vec<f64>,
    t0: f64,
    ts: Vec<f64>,
    theta: Vec<f64>,
    x_r: Vec<f64>,
    x_i: Vec<i64>,
    method: &str,
    rtol: Option<f64>,
    atol: Option<f64>,
    max_steps: Option<u64>,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let method: OdeMethod = method.parse().map_err(to_py_err)?;
    let tolerances = match (rtol, atol, max_steps) {
        (None, None, None) => None,
        (Some(relative), Some(absolute), Some(max_steps)) => Some(Tolerances {
            relative,
            absolute,
            max_steps,
        }),
        _ => {
            return Err(PyValueError::new_err(
                "rtol, atol and max_steps must be given together",
            ))
        }
    };

    let system = PyOdeSystem { f };
    let n = y0.len();
    let problem = OdeProblem::new(&system, y0, t0, ts).with_inputs(theta, x_r, x_i);
    let solution = py
        .allow_threads(|| ode::solve(method, &problem, tolerances))
        .map_err(to_py_err)?;

    let rows = solution.states.len();
    let flat: Vec<f64> = solution.states.into_iter().flatten().collect();
    let arr = Array2::from_shape_vec((rows, n), flat)
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(arr.into_pyarray(py))
}

#[pyclass]
struct FitResult {
    result: SampleResult,
}

#[pymethods]
impl FitResult {
    fn get_samples<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for name in &self.result.param_names {
            let all_samples = self.result.draws(name).unwrap_or_default();
            dict.set_item(name, PyArray1::from_vec(py, all_samples))?;
        }
        Ok(dict)
    }

    fn get_samples_2d<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        let n_chains = self.result.samples.len();
        let n_draws = self.result.samples.first().map_or(0, Vec::len);
        for (pidx, name) in self.result.param_names.iter().enumerate() {
            let mut arr = Array2::<f64>::zeros((n_chains, n_draws));
            for (ci, chain) in self.result.samples.iter().enumerate() {
                for (di, draw) in chain.iter().enumerate() {
                    arr[[ci, di]] = draw[pidx];
                }
            }
            dict.set_item(name, arr.into_pyarray(py))?;
        }
        Ok(dict)
    }

    fn mean<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let means = self.result.mean().unwrap_or_default();
        let dict = PyDict::new(py);
        for (name, val) in self.result.param_names.iter().zip(means.iter()) {
            dict.set_item(name, val)?;
        }
        Ok(dict)
    }

    fn std<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stds = self.result.std().unwrap_or_default();
        let dict = PyDict::new(py);
        for (name, val) in self.result.param_names.iter().zip(stds.iter()) {
            dict.set_item(name, val)?;
        }
        Ok(dict)
    }

    fn accept_rates<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyList>> {
        PyList::new(py, &self.result.accept_rates)
    }

    fn rejected_errors(&self) -> Vec<usize> {
        self.result.rejected_errors.clone()
    }

    fn __repr__(&self) -> String {
        let means = self.result.mean().unwrap_or_default();
        let stds = self.result.std().unwrap_or_default();
        let parts: Vec<String> = self
            .result
            .param_names
            .iter()
            .zip(means.iter().zip(&stds))
            .map(|(name, (m, s))| format!("  {}: mean={:.4}, std={:.4}", name, m, s))
            .collect();
        let n_chains = self.result.samples.len();
        let n_draws = self.result.samples.first().map_or(0, Vec::len);
        format!(
            "shardmc FitResult ({} chains × {} draws)\n{}",
            n_chains,
            n_draws,
            parts.join("\n")
        )
    }
}

/// Bayesian logistic regression whose likelihood is split into `shards`
/// map-rect shards. Coefficients are `beta0` (intercept) to `betaK`.
#[pyfunction]
#[pyo3(signature = (x, y, shards=4, workers=0, chains=4, draws=1000, warmup=500, seed=42, threads=0, step_size=0.0, num_leapfrog_steps=15, prior_sigma=2.5))]
#[allow(clippy::too_many_arguments)]
fn sample_logistic(
    py: Python<'_>,
    x: Vec<Vec<f64>>,
    y: Vec<i64>,
    shards: usize,
    workers: usize,
    chains: usize,
    draws: usize,
    warmup: usize,
    seed: u64,
    threads: usize,
    step_size: f64,
    num_leapfrog_steps: usize,
    prior_sigma: f64,
) -> PyResult<FitResult> {
    if shards == 0 {
        return Err(PyValueError::new_err("shards must be positive"));
    }
    let k = x.first().map_or(0, Vec::len);

    let (real, int) = LogisticShard::pack(&x, &y, shards).map_err(to_py_err)?;
    let data = Arc::new(ShardedData::new(real, int).map_err(to_py_err)?);
    let executor = MapReduceExecutor::new(ExecutorConfig::with_workers(workers)).map_err(to_py_err)?;

    let mut graph = Graph::new();
    let betas: Vec<_> = (0..=k)
        .map(|j| Normal::prior(&mut graph, &format!("beta{}", j), 0.0, prior_sigma))
        .collect();
    let node = graph
        .map_rect_with_data(
            ShardEvaluator::new(LogisticShard),
            Arc::new(executor),
            betas,
            vec![Vec::new(); shards],
            data,
        )
        .map_err(to_py_err)?;
    let total = graph.sum(node);
    graph.add_logp_term(total);

    let config = SamplerConfig {
        num_chains: chains,
        num_draws: draws,
        num_warmup: warmup,
        step_size,
        num_leapfrog_steps,
        seed,
        num_threads: threads,
    };

    let result = py
        .allow_threads(|| sampler::sample(graph, config))
        .map_err(to_py_err)?;

    Ok(FitResult { result })
}

#[pyfunction]
#[pyo3(signature = (level="info"))]
fn init_logging(level: &str) -> PyResult<()> {
    shardmc_core::logging::init_logging(level).map_err(to_py_err)
}

#[pymodule]
fn shardmc(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add_class::<MapReduce>()?;
    m.add_class::<MapRectResult>()?;
    m.add_class::<FitResult>()?;
    m.add_function(wrap_pyfunction!(map_rect, m)?)?;
    m.add_function(wrap_pyfunction!(solve_ode, m)?)?;
    m.add_function(wrap_pyfunction!(sample_logistic, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add("ShapeMismatchError", py.get_type::<ShapeMismatchError>())?;
    m.add("RaggedRowError", py.get_type::<RaggedRowError>())?;
    m.add(
        "ConstantDataViolationError",
        py.get_type::<ConstantDataViolationError>(),
    )?;
    m.add("ShardEvaluationError", py.get_type::<ShardEvaluationError>())?;
    m.add("SolverDivergenceError", py.get_type::<SolverDivergenceError>())?;
    Ok(())
}
