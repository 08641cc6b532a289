use super::{divergence, error_norm, initial_step, min_step, OdeMethod, OdeProblem, OdeSolution, SolverStats, Tolerances};
use crate::errors::Result;

// Dormand–Prince 5(4) tableau.
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];
/// Difference between the 5th and 4th order weights.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

pub(super) fn integrate(problem: &OdeProblem<'_>, tol: &Tolerances) -> Result<OdeSolution> {
    let n = problem.y0.len();
    let mut stats = SolverStats::default();
    let mut t = problem.t0;
    let mut y = problem.y0.clone();
    let mut k: [Vec<f64>; 7] = Default::default();
    k[0] = problem.rhs(t, &y, &mut stats)?;

    let span = problem.ts[problem.ts.len() - 1] - t;
    let mut h = initial_step(problem, &k[0], 5, span, tol, &mut stats)?;
    let mut states = Vec::with_capacity(problem.ts.len());
    let mut stage = vec![0.0; n];
    let mut err = vec![0.0; n];

    for &target in &problem.ts {
        while t < target {
            if stats.attempted_steps() >= tol.max_steps {
                return Err(divergence(OdeMethod::Rk45, t, &stats));
            }
            if h < min_step(t) {
                return Err(divergence(OdeMethod::Rk45, t, &stats));
            }
            let clipped = t + h >= target;
            let h_step = if clipped { target - t } else { h };

            for s in 1..7 {
                for i in 0..n {
                    let incr: f64 = (0..s).map(|j| A[s][j] * k[j][i]).sum();
                    stage[i] = y[i] + h_step * incr;
                }
                k[s] = problem.rhs(t + C[s] * h_step, &stage, &mut stats)?;
            }
            // stage now holds the 5th order solution (row 6 of A).
            for i in 0..n {
                err[i] = h_step * (0..7).map(|j| E[j] * k[j][i]).sum::<f64>();
            }
            let norm = error_norm(&err, &y, &stage, tol);

            if norm <= 1.0 {
                stats.accepted_steps += 1;
                t = if clipped { target } else { t + h_step };
                y.copy_from_slice(&stage);
                k.swap(0, 6);
                let factor = if norm == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * norm.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                if !clipped {
                    h = h_step * factor;
                }
            } else {
                stats.rejected_steps += 1;
                let factor = if norm.is_finite() {
                    (SAFETY * norm.powf(-0.2)).clamp(MIN_FACTOR, 1.0)
                } else {
                    MIN_FACTOR
                };
                h = h_step * factor;
            }
        }
        states.push(y.clone());
    }

    Ok(OdeSolution {
        ts: problem.ts.clone(),
        states,
        stats,
    })
}
