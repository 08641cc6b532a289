pub mod aggregator;
pub mod autodiff;
pub mod distributions;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod hmc;
pub mod jobset;
pub mod logging;
pub mod models;
pub mod ode;
pub mod placement;
pub mod sampler;
pub mod shard;

pub use errors::{Error, EvalError, Result};
pub use executor::{map_rect, CancelToken, EvalMode, ExecutorConfig, MapRectOutput, MapReduceExecutor};
pub use jobset::{RectangularJobSet, ShardedData};
pub use shard::{ShardArgs, ShardEvaluator, ShardFunction, ShardResult};

// Future: sensitivities through the ODE solvers so a solve can sit inside a
// differentiable shard function.
