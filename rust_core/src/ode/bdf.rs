use super::{divergence, error_norm, initial_step, min_step, OdeMethod, OdeProblem, OdeSolution, SolverStats, Tolerances};
use crate::errors::Result;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
/// Variable-step BDF2 stays zero-stable for step ratios below 1 + √2.
const MAX_FACTOR: f64 = 2.0;
const NEWTON_MAX_ITERS: usize = 6;
const NEWTON_TOL: f64 = 0.03;

/// Accepted points kept for the predictor and the BDF2 formula.
struct History {
    points: Vec<(f64, Vec<f64>)>,
}

impl History {
    fn push(&mut self, t: f64, y: Vec<f64>) {
        if self.points.len() == 3 {
            self.points.remove(0);
        }
        self.points.push((t, y));
    }

    fn order(&self) -> usize {
        if self.points.len() >= 3 {
            2
        } else {
            1
        }
    }

    /// Polynomial extrapolation through the last `order + 1` points.
    fn predict(&self, t_new: f64, f_last: &[f64]) -> Vec<f64> {
        let (t_n, y_n) = &self.points[self.points.len() - 1];
        if self.points.len() == 1 {
            let h = t_new - t_n;
            return y_n.iter().zip(f_last).map(|(y, f)| y + h * f).collect();
        }
        let used = &self.points[self.points.len() - (self.order() + 1)..];
        let mut pred = vec![0.0; y_n.len()];
        for (j, (t_j, y_j)) in used.iter().enumerate() {
            let weight: f64 = used
                .iter()
                .enumerate()
                .filter(|(m, _)| *m != j)
                .map(|(_, (t_m, _))| (t_new - t_m) / (t_j - t_m))
                .product();
            for (p, y) in pred.iter_mut().zip(y_j) {
                *p += weight * y;
            }
        }
        pred
    }

    /// Corrector-minus-predictor multiplier giving the local error estimate.
    fn error_constant(&self) -> f64 {
        match self.points.len() {
            1 => 0.5,
            2 => 1.0 / 3.0,
            _ => 2.0 / 11.0,
        }
    }
}

/// The implicit stage `y - beta * h * f(t, y) = psi` of one BDF step.
struct Stage<'p, 'a> {
    problem: &'p OdeProblem<'a>,
    t: f64,
    beta_h: f64,
    psi: Vec<f64>,
}

enum NewtonOutcome {
    Converged(Vec<f64>),
    Failed,
}

impl Stage<'_, '_> {
    fn residual(&self, y: &[f64], stats: &mut SolverStats) -> Result<Vec<f64>> {
        let f = self.problem.rhs(self.t, y, stats)?;
        Ok(y
            .iter()
            .zip(&f)
            .zip(&self.psi)
            .map(|((yi, fi), pi)| yi - self.beta_h * fi - pi)
            .collect())
    }

    fn newton(
        &self,
        mut y: Vec<f64>,
        tol: &Tolerances,
        stats: &mut SolverStats,
    ) -> Result<NewtonOutcome> {
        let n = y.len();
        let jac = finite_difference_jacobian(self.problem, self.t, &y, stats)?;
        let mut m: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let identity = if i == j { 1.0 } else { 0.0 };
                        identity - self.beta_h * jac[i][j]
                    })
                    .collect()
            })
            .collect();
        stats.lu_decompositions += 1;
        let Some(pivots) = lu_factor(&mut m) else {
            return Ok(NewtonOutcome::Failed);
        };

        for _ in 0..NEWTON_MAX_ITERS {
            let mut delta = self.residual(&y, stats)?;
            if delta.iter().any(|d| !d.is_finite()) {
                return Ok(NewtonOutcome::Failed);
            }
            lu_solve(&m, &pivots, &mut delta);
            for (yi, d) in y.iter_mut().zip(&delta) {
                *yi -= d;
            }
            if error_norm(&delta, &y, &y, tol) < NEWTON_TOL {
                return Ok(NewtonOutcome::Converged(y));
            }
        }
        Ok(NewtonOutcome::Failed)
    }
}

fn finite_difference_jacobian(
    problem: &OdeProblem<'_>,
    t: f64,
    y: &[f64],
    stats: &mut SolverStats,
) -> Result<Vec<Vec<f64>>> {
    stats.jacobian_evaluations += 1;
    let n = y.len();
    let f0 = problem.rhs(t, y, stats)?;
    let mut jac = vec![vec![0.0; n]; n];
    let mut shifted = y.to_vec();
    for j in 0..n {
        let dy = f64::EPSILON.sqrt() * y[j].abs().max(1.0);
        shifted[j] = y[j] + dy;
        let f1 = problem.rhs(t, &shifted, stats)?;
        shifted[j] = y[j];
        for i in 0..n {
            jac[i][j] = (f1[i] - f0[i]) / dy;
        }
    }
    Ok(jac)
}

/// In-place LU factorization with partial pivoting. `None` if singular.
fn lu_factor(m: &mut [Vec<f64>]) -> Option<Vec<usize>> {
    let n = m.len();
    let mut pivots = Vec::with_capacity(n);
    for col in 0..n {
        let (p, max) = (col..n)
            .map(|r| (r, m[r][col].abs()))
            .fold((col, -1.0), |best, cur| if cur.1 > best.1 { cur } else { best });
        if max <= 0.0 || !max.is_finite() {
            return None;
        }
        m.swap(col, p);
        pivots.push(p);
        for r in col + 1..n {
            let factor = m[r][col] / m[col][col];
            m[r][col] = factor;
            for c in col + 1..n {
                m[r][c] -= factor * m[col][c];
            }
        }
    }
    Some(pivots)
}

fn lu_solve(lu: &[Vec<f64>], pivots: &[usize], b: &mut [f64]) {
    let n = lu.len();
    for (col, &p) in pivots.iter().enumerate() {
        b.swap(col, p);
    }
    for r in 0..n {
        let s: f64 = (0..r).map(|c| lu[r][c] * b[c]).sum();
        b[r] -= s;
    }
    for r in (0..n).rev() {
        let s: f64 = (r + 1..n).map(|c| lu[r][c] * b[c]).sum();
        b[r] = (b[r] - s) / lu[r][r];
    }
}

pub(super) fn integrate(problem: &OdeProblem<'_>, tol: &Tolerances) -> Result<OdeSolution> {
    let mut stats = SolverStats::default();
    let mut t = problem.t0;
    let mut f = problem.rhs(t, &problem.y0, &mut stats)?;
    let span = problem.ts[problem.ts.len() - 1] - t;
    let mut h = initial_step(problem, &f, 1, span, tol, &mut stats)?;

    let mut history = History {
        points: vec![(t, problem.y0.clone())],
    };
    let mut states = Vec::with_capacity(problem.ts.len());

    for &target in &problem.ts {
        while t < target {
            if stats.attempted_steps() >= tol.max_steps || h < min_step(t) {
                return Err(divergence(OdeMethod::Bdf, t, &stats));
            }
            if let [.., (t_prev, _), (t_last, _)] = history.points.as_slice() {
                h = h.min(MAX_FACTOR * (t_last - t_prev));
            }
            let clipped = t + h >= target;
            let h_step = if clipped { target - t } else { h };
            let t_new = if clipped { target } else { t + h_step };

            let (t_n, y_n) = &history.points[history.points.len() - 1];
            let stage = if history.order() == 2 {
                let (t_prev, y_prev) = &history.points[history.points.len() - 2];
                let omega = h_step / (t_n - t_prev);
                let denom = 1.0 + 2.0 * omega;
                let a = (1.0 + omega).powi(2) / denom;
                let b = omega * omega / denom;
                Stage {
                    problem,
                    t: t_new,
                    beta_h: h_step * (1.0 + omega) / denom,
                    psi: y_n.iter().zip(y_prev).map(|(yn, yp)| a * yn - b * yp).collect(),
                }
            } else {
                Stage {
                    problem,
                    t: t_new,
                    beta_h: h_step,
                    psi: y_n.clone(),
                }
            };
            let y_n = y_n.clone();
            let predicted = history.predict(t_new, &f);

            let corrected = match stage.newton(predicted.clone(), tol, &mut stats)? {
                NewtonOutcome::Converged(y) => y,
                NewtonOutcome::Failed => {
                    stats.rejected_steps += 1;
                    h = h_step * 0.25;
                    continue;
                }
            };

            let err: Vec<f64> = corrected
                .iter()
                .zip(&predicted)
                .map(|(c, p)| history.error_constant() * (c - p))
                .collect();
            let norm = error_norm(&err, &y_n, &corrected, tol);
            let exponent = -1.0 / (history.order() as f64 + 1.0);

            if norm <= 1.0 {
                stats.accepted_steps += 1;
                f = problem.rhs(t_new, &corrected, &mut stats)?;
                history.push(t_new, corrected);
                t = t_new;
                let factor = if norm == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * norm.powf(exponent)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                if !clipped {
                    h = h_step * factor;
                }
            } else {
                stats.rejected_steps += 1;
                let factor = if norm.is_finite() {
                    (SAFETY * norm.powf(exponent)).clamp(MIN_FACTOR, 1.0)
                } else {
                    MIN_FACTOR
                };
                h = h_step * factor;
            }
        }
        states.push(history.points[history.points.len() - 1].1.clone());
    }

    Ok(OdeSolution {
        ts: problem.ts.clone(),
        states,
        stats,
    })
}
