use thiserror::Error;

use crate::ode::OdeMethod;

/// Failure raised while evaluating a computation graph.
///
/// These are the errors a per-shard function or an ODE right-hand side can
/// produce. The executor wraps them in [`Error::ShardEvaluation`] together
/// with the index of the shard that raised them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// An argument left the domain of a function (e.g. `log` of a negative
    /// number, a non-positive scale).
    #[error("domain error in {op}: {detail}")]
    Domain { op: &'static str, detail: String },

    /// A node produced a scalar where a vector was expected, or vice versa.
    #[error("node {node} has the wrong kind: expected {expected}")]
    TypeMismatch { node: usize, expected: &'static str },

    /// Two vectors that are combined element-wise have different lengths.
    #[error("length mismatch in {op}: {left} vs {right}")]
    LengthMismatch {
        op: &'static str,
        left: usize,
        right: usize,
    },

    /// A function returned something that cannot be used as its output.
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    /// A nested map-reduce or solver call inside the graph failed.
    #[error("nested evaluation failed: {0}")]
    Nested(String),
}

impl EvalError {
    pub fn domain(op: &'static str, detail: impl Into<String>) -> Self {
        EvalError::Domain {
            op,
            detail: detail.into(),
        }
    }
}

impl From<Error> for EvalError {
    fn from(e: Error) -> Self {
        match e {
            Error::Eval(inner) => inner,
            Error::ShardEvaluation { source, .. } => source,
            other => EvalError::Nested(other.to_string()),
        }
    }
}

/// Which of the two constant data arrays a shape error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataArray {
    Real,
    Int,
}

impl std::fmt::Display for DataArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataArray::Real => write!(f, "real data"),
            DataArray::Int => write!(f, "int data"),
        }
    }
}

/// Errors surfaced by map-reduce evaluation, ODE solving and sampling.
#[derive(Error, Debug)]
pub enum Error {
    /// The parallel input arrays do not have the same number of shards.
    #[error(
        "shape mismatch: {local} local parameter vectors, {real} real data rows, {int} int data rows"
    )]
    ShapeMismatch { local: usize, real: usize, int: usize },

    /// A row of a 2-D data array has a different length than the first row.
    #[error("ragged {array} array: row {row} has length {found}, expected {expected}")]
    RaggedRow {
        array: DataArray,
        row: usize,
        expected: usize,
        found: usize,
    },

    /// A value that depends on parameters was passed where only constant data
    /// is allowed.
    #[error("real data for shard {shard}, column {column} depends on a parameter")]
    ConstantDataViolation { shard: usize, column: usize },

    /// The per-shard function failed; the whole call is aborted.
    #[error("shard {shard} failed: {source}")]
    ShardEvaluation {
        shard: usize,
        #[source]
        source: EvalError,
    },

    /// The ODE integrator could not reach the requested time within its
    /// step budget.
    #[error("{method} solver failed at t = {t} after {steps} steps")]
    SolverDivergence {
        method: OdeMethod,
        t: f64,
        steps: u64,
    },

    #[error("invalid solver configuration: {0}")]
    InvalidSolverConfig(String),

    /// A gradient was requested from a shard result that carries no
    /// derivative information.
    #[error("shard {shard} has no derivative record")]
    MissingGradient { shard: usize },

    #[error("adjoint has length {found}, expected {expected}")]
    AdjointLength { expected: usize, found: usize },

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

/// Result type alias for shardmc operations.
pub type Result<T> = std::result::Result<T, Error>;
