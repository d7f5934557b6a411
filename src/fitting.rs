// Fitting Module
// Bounded nonlinear least squares and one-dimensional maximum search

use argmin::core::{
    CostFunction, Error as ArgminError, Executor, IterState, Problem, Solver, State, TerminationReason, KV,
};
use argmin::solver::brent::BrentOpt;
use argmin::solver::neldermead::NelderMead;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::trace;

use crate::config::SolverOptions;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("degenerate fit input: {0}")]
    Degenerate(String),

    #[error("initial value {value} of parameter {index} outside bounds [{lower}, {upper}]")]
    Infeasible {
        index: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error("singular covariance: J^T J is not invertible")]
    Singular,

    #[error("no convergence after {iterations} iterations")]
    Convergence { iterations: u64 },
}

/// Discriminant of [`FitError`], used to describe which failures a caller tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitErrorKind {
    Degenerate,
    Infeasible,
    Singular,
    Convergence,
}

impl FitError {
    pub fn kind(&self) -> FitErrorKind {
        match self {
            FitError::Degenerate(_) => FitErrorKind::Degenerate,
            FitError::Infeasible { .. } => FitErrorKind::Infeasible,
            FitError::Singular => FitErrorKind::Singular,
            FitError::Convergence { .. } => FitErrorKind::Convergence,
        }
    }
}

/// A pure model function `y = f(x; params)`.
pub trait Model {
    fn n_params(&self) -> usize;

    fn eval(&self, x: f64, params: &[f64]) -> f64;
}

/// Straight line `params[0] + params[1] * x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearModel;

impl Model for LinearModel {
    fn n_params(&self) -> usize {
        2
    }

    fn eval(&self, x: f64, params: &[f64]) -> f64 {
        params[0] + params[1] * x
    }
}

/// Box constraints, one `(lower, upper)` pair per parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Bounds { lower, upper }
    }

    pub fn unbounded(n: usize) -> Self {
        Bounds {
            lower: vec![f64::NEG_INFINITY; n],
            upper: vec![f64::INFINITY; n],
        }
    }

    pub fn clamp(&self, params: &mut [f64]) {
        for ((p, &lo), &hi) in params.iter_mut().zip(&self.lower).zip(&self.upper) {
            *p = p.clamp(lo, hi);
        }
    }

    fn check(&self, params: &[f64]) -> Result<(), FitError> {
        if self.lower.len() != params.len() || self.upper.len() != params.len() {
            return Err(FitError::Degenerate(format!(
                "{} parameters but {}/{} bounds",
                params.len(),
                self.lower.len(),
                self.upper.len()
            )));
        }
        for (index, ((&value, &lower), &upper)) in params.iter().zip(&self.lower).zip(&self.upper).enumerate() {
            if !(lower <= value && value <= upper) {
                return Err(FitError::Infeasible {
                    index,
                    value,
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }
}

/// Best-fit parameters and their covariance.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    pub covariance: DMatrix<f64>,
    /// Sum of squared (weighted) residuals at the solution.
    pub cost: f64,
    pub iterations: u64,
}

impl FitOutcome {
    /// Standard errors, the square roots of the covariance diagonal.
    pub fn std_errors(&self) -> Vec<f64> {
        self.covariance.diagonal().iter().map(|v| v.sqrt()).collect()
    }
}

const DIAG_FLOOR: f64 = 1e-12;
const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;

type LmState = IterState<Vec<f64>, (), (), (), (), f64>;

struct LeastSquares<'a> {
    model: &'a dyn Model,
    x: &'a [f64],
    y: &'a [f64],
    weights: Option<Vec<f64>>,
}

impl LeastSquares<'_> {
    fn residuals(&self, params: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            self.x.len(),
            self.x.iter().zip(self.y).enumerate().map(|(i, (&x, &y))| {
                let r = y - self.model.eval(x, params);
                match &self.weights {
                    Some(w) => r * w[i],
                    None => r,
                }
            }),
        )
    }

    /// Forward-difference Jacobian of the model (weighted like the residuals).
    fn jacobian(&self, params: &[f64], bounds: &Bounds) -> DMatrix<f64> {
        let m = self.x.len();
        let n = params.len();
        let base: Vec<f64> = self.x.iter().map(|&x| self.model.eval(x, params)).collect();
        let mut jac = DMatrix::zeros(m, n);
        let mut shifted = params.to_vec();

        for k in 0..n {
            let mut h = f64::EPSILON.sqrt() * params[k].abs().max(1.0);
            if params[k] + h > bounds.upper[k] {
                h = -h;
            }
            shifted[k] = params[k] + h;
            for i in 0..m {
                let d = (self.model.eval(self.x[i], &shifted) - base[i]) / h;
                jac[(i, k)] = match &self.weights {
                    Some(w) => d * w[i],
                    None => d,
                };
            }
            shifted[k] = params[k];
        }
        jac
    }
}

impl CostFunction for LeastSquares<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(self.residuals(params).norm_squared())
    }
}

/// Levenberg-Marquardt restricted to a box.
///
/// A parameter sitting on a bound with the descent direction pointing out of
/// the box is held there; the damped normal equations are solved for the
/// remaining ones and the trial point is clamped into the box.
struct ProjectedLm<'b> {
    bounds: &'b Bounds,
    lambda: f64,
    ftol: f64,
    xtol: f64,
}

impl ProjectedLm<'_> {
    /// Indices of parameters free to move from `params`.
    fn free_set(&self, params: &[f64], descent: &DVector<f64>) -> Vec<usize> {
        (0..params.len())
            .filter(|&k| {
                let held_low = params[k] <= self.bounds.lower[k] && descent[k] < 0.0;
                let held_high = params[k] >= self.bounds.upper[k] && descent[k] > 0.0;
                !(held_low || held_high)
            })
            .collect()
    }
}

impl<'a> Solver<LeastSquares<'a>, LmState> for ProjectedLm<'_> {
    const NAME: &'static str = "Projected Levenberg-Marquardt";

    fn init(
        &mut self,
        problem: &mut Problem<LeastSquares<'a>>,
        mut state: LmState,
    ) -> Result<(LmState, Option<KV>), ArgminError> {
        let params = state
            .take_param()
            .ok_or_else(|| ArgminError::msg("no initial parameters"))?;
        let cost = problem.cost(&params)?;
        Ok((state.param(params).cost(cost), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<LeastSquares<'a>>,
        mut state: LmState,
    ) -> Result<(LmState, Option<KV>), ArgminError> {
        let params = state
            .take_param()
            .ok_or_else(|| ArgminError::msg("no current parameters"))?;
        let cost = state.get_cost();
        if cost == 0.0 {
            return Ok((state.param(params).terminate_with(TerminationReason::SolverConverged), None));
        }

        let bounds = self.bounds;
        let (jac, residuals) =
            problem.problem("jacobian_count", |ls| Ok((ls.jacobian(&params, bounds), ls.residuals(&params))))?;
        let jtj = jac.tr_mul(&jac);
        let descent = jac.tr_mul(&residuals);

        let free = self.free_set(&params, &descent);
        if free.is_empty() {
            return Ok((state.param(params).terminate_with(TerminationReason::SolverConverged), None));
        }
        let reduced = DMatrix::from_fn(free.len(), free.len(), |i, j| jtj[(free[i], free[j])]);
        let rhs = DVector::from_fn(free.len(), |i, _| descent[free[i]]);

        let mut accepted = None;
        while self.lambda < LAMBDA_MAX {
            let mut damped = reduced.clone();
            for i in 0..free.len() {
                damped[(i, i)] += self.lambda * reduced[(i, i)].max(DIAG_FLOOR);
            }
            if let Some(chol) = damped.cholesky() {
                let step = chol.solve(&rhs);
                let mut trial = params.clone();
                for (i, &k) in free.iter().enumerate() {
                    trial[k] += step[i];
                }
                self.bounds.clamp(&mut trial);
                let trial_cost = problem.cost(&trial)?;
                if trial_cost < cost {
                    accepted = Some((trial, trial_cost));
                    break;
                }
            }
            self.lambda *= 10.0;
        }

        // no step lowers the cost: stationary within the bounds
        let Some((trial, trial_cost)) = accepted else {
            return Ok((state.param(params).terminate_with(TerminationReason::SolverConverged), None));
        };

        let moved = params
            .iter()
            .zip(&trial)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        let scale = trial.iter().map(|v| v * v).sum::<f64>().sqrt();
        let drop = cost - trial_cost;
        self.lambda = (self.lambda / 10.0).max(1e-12);
        trace!(cost = trial_cost, lambda = self.lambda, held = params.len() - free.len(), "least-squares step");

        let state = state.param(trial).cost(trial_cost);
        if trial_cost == 0.0 || drop <= self.ftol * trial_cost || moved <= self.xtol * (scale + self.xtol) {
            return Ok((state.terminate_with(TerminationReason::SolverConverged), None));
        }
        Ok((state, None))
    }
}

/// Bounded nonlinear least squares of `model` through `(x, y)`.
///
/// With `sigma` the residuals are divided by it, and a zero or non-finite
/// entry is rejected as degenerate. The solver is a projected
/// Levenberg-Marquardt run by an argmin [`Executor`]: parameters held on an
/// active bound stay fixed while the others are solved for. The covariance
/// is `(J^T J)^-1` scaled by the residual variance; with no degrees of
/// freedom left it is all `+inf`.
pub fn curve_fit(
    model: &dyn Model,
    x: &[f64],
    y: &[f64],
    sigma: Option<&[f64]>,
    p0: &[f64],
    bounds: &Bounds,
    options: &SolverOptions,
) -> Result<FitOutcome, FitError> {
    let n = model.n_params();
    if p0.len() != n {
        return Err(FitError::Degenerate(format!("expected {} initial values, got {}", n, p0.len())));
    }
    if x.is_empty() || x.len() != y.len() {
        return Err(FitError::Degenerate(format!("{} x values for {} y values", x.len(), y.len())));
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(FitError::Degenerate("non-finite data".to_string()));
    }
    bounds.check(p0)?;

    let weights = match sigma {
        Some(sigma) => {
            if sigma.len() != y.len() {
                return Err(FitError::Degenerate(format!("{} sigma values for {} points", sigma.len(), y.len())));
            }
            if let Some(i) = sigma.iter().position(|s| !s.is_finite() || *s == 0.0) {
                return Err(FitError::Degenerate(format!("sigma[{}] = {}", i, sigma[i])));
            }
            Some(sigma.iter().map(|s| 1.0 / s).collect())
        }
        None => None,
    };
    let problem = LeastSquares { model, x, y, weights };
    let solver = ProjectedLm {
        bounds,
        lambda: LAMBDA_START,
        ftol: options.ftol,
        xtol: options.xtol,
    };

    let result = Executor::new(problem, solver)
        .configure(|state| state.param(p0.to_vec()).max_iters(options.max_iterations))
        .run()
        .map_err(|e| FitError::Degenerate(e.to_string()))?;

    let state = result.state();
    let iterations = state.get_iter();
    if state.get_termination_reason() != Some(&TerminationReason::SolverConverged) {
        return Err(FitError::Convergence { iterations });
    }
    let params = state
        .get_best_param()
        .cloned()
        .ok_or(FitError::Convergence { iterations })?;
    let cost = state.get_best_cost();

    let problem = result
        .problem
        .problem
        .as_ref()
        .ok_or(FitError::Convergence { iterations })?;
    let jac = problem.jacobian(&params, bounds);
    let jtj = jac.tr_mul(&jac);
    let inverse = jtj.cholesky().ok_or(FitError::Singular)?.inverse();
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(FitError::Singular);
    }

    let dof = x.len().saturating_sub(n);
    let covariance = if dof > 0 {
        inverse * (cost / dof as f64)
    } else {
        DMatrix::from_element(n, n, f64::INFINITY)
    };

    Ok(FitOutcome {
        params,
        covariance,
        cost,
        iterations,
    })
}

struct NegatedModel<'a> {
    model: &'a dyn Model,
    params: &'a [f64],
}

impl CostFunction for NegatedModel<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(-self.model.eval(x[0], self.params))
    }
}

/// [`NegatedModel`] over a scalar, for the bracketed refinement.
struct NegatedScalar<'a>(NegatedModel<'a>);

impl CostFunction for NegatedScalar<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(-self.0.model.eval(*x, self.0.params))
    }
}

const MAXIMUM_SD_TOLERANCE: f64 = 1e-10;
const MAXIMUM_ITERATIONS: u64 = 1000;
const REFINE_TOLERANCE: f64 = 1e-9;
const REFINE_WIDENINGS: usize = 8;

/// Position of the maximum of `model` near `start`.
///
/// Nelder-Mead on the negated model finds the peak region. Its simplex can
/// stop straddling the maximum, so the result is polished by Brent's method
/// in a bracket around it, widened while the optimum lands on an edge.
pub fn locate_maximum(model: &dyn Model, params: &[f64], start: f64) -> Result<f64, FitError> {
    let second = if start == 0.0 { 0.00025 } else { start * 1.05 };
    let solver = NelderMead::new(vec![vec![start], vec![second]])
        .with_sd_tolerance(MAXIMUM_SD_TOLERANCE)
        .map_err(|e| FitError::Degenerate(e.to_string()))?;

    let problem = NegatedModel { model, params };
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(MAXIMUM_ITERATIONS))
        .run()
        .map_err(|_| FitError::Convergence {
            iterations: MAXIMUM_ITERATIONS,
        })?;

    let state = result.state();
    let coarse = match state.get_best_param() {
        Some(best) if best[0].is_finite() => best[0],
        _ => {
            return Err(FitError::Convergence {
                iterations: state.get_iter(),
            })
        }
    };

    let mut half_width = (second - start).abs().max(1e-3);
    for _ in 0..REFINE_WIDENINGS {
        let (lo, hi) = (coarse - half_width, coarse + half_width);
        let problem = NegatedScalar(NegatedModel { model, params });
        let solver = BrentOpt::new(lo, hi).set_tolerance(f64::EPSILON.sqrt(), REFINE_TOLERANCE);
        let result = Executor::new(problem, solver)
            .configure(|state| state.max_iters(MAXIMUM_ITERATIONS))
            .run()
            .map_err(|_| FitError::Convergence {
                iterations: MAXIMUM_ITERATIONS,
            })?;
        let best = match result.state().get_best_param() {
            Some(&best) if best.is_finite() => best,
            _ => break,
        };

        let margin = 0.01 * (hi - lo);
        if best - lo > margin && hi - best > margin {
            return Ok(best);
        }
        half_width *= 4.0;
    }

    Err(FitError::Convergence {
        iterations: MAXIMUM_ITERATIONS,
    })
}
