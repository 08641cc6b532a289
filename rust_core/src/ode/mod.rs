//! Initial value problem solvers.
//!
//! Two integrators share one interface: an explicit Dormand–Prince 5(4)
//! method for non-stiff systems and an implicit BDF method for stiff ones.
//! Both control the local error per step and land exactly on every
//! requested output time.

mod bdf;
mod rk45;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Error, EvalError, Result};

/// Right-hand side `dy/dt = f(t, y, theta, x_r, x_i)`.
pub trait OdeSystem: Sync {
    fn derivative(
        &self,
        t: f64,
        y: &[f64],
        theta: &[f64],
        x_r: &[f64],
        x_i: &[i64],
    ) -> std::result::Result<Vec<f64>, EvalError>;
}

impl<F> OdeSystem for F
where
    F: Fn(f64, &[f64], &[f64], &[f64], &[i64]) -> std::result::Result<Vec<f64>, EvalError> + Sync,
{
    fn derivative(
        &self,
        t: f64,
        y: &[f64],
        theta: &[f64],
        x_r: &[f64],
        x_i: &[i64],
    ) -> std::result::Result<Vec<f64>, EvalError> {
        self(t, y, theta, x_r, x_i)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OdeMethod {
    Rk45,
    Bdf,
}

impl fmt::Display for OdeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OdeMethod::Rk45 => write!(f, "rk45"),
            OdeMethod::Bdf => write!(f, "bdf"),
        }
    }
}

impl std::str::FromStr for OdeMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rk45" => Ok(OdeMethod::Rk45),
            "bdf" => Ok(OdeMethod::Bdf),
            other => Err(Error::InvalidSolverConfig(format!(
                "unknown method '{other}', expected 'rk45' or 'bdf'"
            ))),
        }
    }
}

/// Error tolerances and step budget. Overriding any of them means supplying
/// all three, so a config that names only some of the fields is rejected;
/// leave the whole value out (`None` in [`solve`]) to get the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    pub relative: f64,
    pub absolute: f64,
    /// Maximum number of attempted steps, rejected ones included.
    pub max_steps: u64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            relative: 1e-6,
            absolute: 1e-6,
            max_steps: 1_000_000,
        }
    }
}

/// An initial value problem together with the fixed inputs passed to the
/// right-hand side.
pub struct OdeProblem<'a> {
    pub system: &'a dyn OdeSystem,
    pub y0: Vec<f64>,
    pub t0: f64,
    /// Output times, strictly increasing and all after `t0`.
    pub ts: Vec<f64>,
    pub theta: Vec<f64>,
    pub x_r: Vec<f64>,
    pub x_i: Vec<i64>,
}

impl fmt::Debug for OdeProblem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OdeProblem")
            .field("y0", &self.y0)
            .field("t0", &self.t0)
            .field("ts", &self.ts)
            .field("theta", &self.theta)
            .finish_non_exhaustive()
    }
}

impl<'a> OdeProblem<'a> {
    pub fn new(system: &'a dyn OdeSystem, y0: Vec<f64>, t0: f64, ts: Vec<f64>) -> Self {
        Self {
            system,
            y0,
            t0,
            ts,
            theta: Vec::new(),
            x_r: Vec::new(),
            x_i: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, theta: Vec<f64>, x_r: Vec<f64>, x_i: Vec<i64>) -> Self {
        self.theta = theta;
        self.x_r = x_r;
        self.x_i = x_i;
        self
    }

    fn validate(&self, tol: &Tolerances) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidSolverConfig(msg));
        if self.y0.is_empty() {
            return invalid("initial state is empty".to_string());
        }
        if let Some(i) = self.y0.iter().position(|v| !v.is_finite()) {
            return invalid(format!("initial state component {i} is not finite"));
        }
        if !self.t0.is_finite() {
            return invalid(format!("initial time {} is not finite", self.t0));
        }
        let Some(&first) = self.ts.first() else {
            return invalid("no output times given".to_string());
        };
        if let Some(t) = self.ts.iter().find(|t| !t.is_finite()) {
            return invalid(format!("output time {t} is not finite"));
        }
        if first <= self.t0 {
            return invalid(format!(
                "first output time {first} is not after the initial time {}",
                self.t0
            ));
        }
        if let Some(w) = self.ts.windows(2).find(|w| w[1] <= w[0]) {
            return invalid(format!(
                "output times are not strictly increasing: {} then {}",
                w[0], w[1]
            ));
        }
        for (name, value) in [("relative", tol.relative), ("absolute", tol.absolute)] {
            if !(value > 0.0 && value.is_finite()) {
                return invalid(format!("{name} tolerance {value} must be positive and finite"));
            }
        }
        if tol.max_steps == 0 {
            return invalid("max_steps must be positive".to_string());
        }
        Ok(())
    }

    /// Evaluate the right-hand side, checking the returned length.
    fn rhs(&self, t: f64, y: &[f64], stats: &mut SolverStats) -> Result<Vec<f64>> {
        stats.rhs_evaluations += 1;
        let dy = self
            .system
            .derivative(t, y, &self.theta, &self.x_r, &self.x_i)?;
        if dy.len() != y.len() {
            return Err(Error::InvalidSolverConfig(format!(
                "derivative has length {}, state has length {}",
                dy.len(),
                y.len()
            )));
        }
        Ok(dy)
    }
}

/// Work done by one solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverStats {
    pub accepted_steps: u64,
    pub rejected_steps: u64,
    pub rhs_evaluations: u64,
    pub jacobian_evaluations: u64,
    pub lu_decompositions: u64,
}

impl SolverStats {
    pub fn attempted_steps(&self) -> u64 {
        self.accepted_steps + self.rejected_steps
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OdeSolution {
    pub ts: Vec<f64>,
    /// `states[i]` is the state at `ts[i]`.
    pub states: Vec<Vec<f64>>,
    pub stats: SolverStats,
}

/// Integrate `problem` from `t0` through every output time.
pub fn solve(
    method: OdeMethod,
    problem: &OdeProblem<'_>,
    tolerances: Option<Tolerances>,
) -> Result<OdeSolution> {
    let tol = tolerances.unwrap_or_default();
    problem.validate(&tol)?;

    let result = match method {
        OdeMethod::Rk45 => rk45::integrate(problem, &tol),
        OdeMethod::Bdf => bdf::integrate(problem, &tol),
    };

    match &result {
        Ok(solution) => debug!(
            %method,
            steps = solution.stats.accepted_steps,
            rejected = solution.stats.rejected_steps,
            rhs = solution.stats.rhs_evaluations,
            "ode solve finished"
        ),
        Err(e) => warn!(%method, error = %e, "ode solve failed"),
    }
    result
}

/// Weighted RMS norm of `v` with per-component scale `atol + rtol * max(|a|, |b|)`.
fn error_norm(v: &[f64], a: &[f64], b: &[f64], tol: &Tolerances) -> f64 {
    let sum: f64 = v
        .iter()
        .zip(a.iter().zip(b))
        .map(|(e, (x, y))| {
            let scale = tol.absolute + tol.relative * x.abs().max(y.abs());
            (e / scale).powi(2)
        })
        .sum();
    (sum / v.len() as f64).sqrt()
}

/// Starting step size for a method of the given order.
fn initial_step(
    problem: &OdeProblem<'_>,
    f0: &[f64],
    order: i32,
    span: f64,
    tol: &Tolerances,
    stats: &mut SolverStats,
) -> Result<f64> {
    let y0 = &problem.y0;
    let d0 = error_norm(y0, y0, y0, tol);
    let d1 = error_norm(f0, y0, y0, tol);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
    .min(span);

    let y1: Vec<f64> = y0.iter().zip(f0).map(|(y, f)| y + h0 * f).collect();
    let f1 = problem.rhs(problem.t0 + h0, &y1, stats)?;
    let df: Vec<f64> = f1.iter().zip(f0).map(|(a, b)| (a - b) / h0).collect();
    let d2 = error_norm(&df, y0, y0, tol);

    let dmax = d1.max(d2);
    let h1 = if dmax <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / dmax).powf(1.0 / f64::from(order + 1))
    };
    Ok((100.0 * h0).min(h1).min(span))
}

fn divergence(method: OdeMethod, t: f64, stats: &SolverStats) -> Error {
    Error::SolverDivergence {
        method,
        t,
        steps: stats.attempted_steps(),
    }
}

/// Smallest step that still moves `t` forward in floating point.
fn min_step(t: f64) -> f64 {
    16.0 * f64::EPSILON * t.abs().max(1.0)
}
