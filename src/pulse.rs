// Pulse-shape fitting
// One fit per (step, channel) of the trial-averaged waveform, then a search
// for the maximum of the fitted curve.

use tracing::{debug, trace};

use crate::config::PulseFitConfig;
use crate::fitting::{curve_fit, locate_maximum, Bounds, FitError, FitErrorKind, Model};
use crate::scan_tools::{Result, ScanError, CHANNELS};
use crate::signal::ReducedSignal;

/// Exponent of the power-law rise.
const RISE_ORDER: i32 = 2;

/// Decay constant of the fast exponential, relative to the slow one.
const FAST_RATIO: f64 = 3.0;

const ADC_MAX: f64 = 65535.0;
const AMPLITUDE_MAX: f64 = 1e7;
const TAU_MIN: f64 = 0.05;

/// Amplitudes below this fraction of the baseline are rounding noise.
const PULSE_FLOOR: f64 = 1e-9;

/// Pulse shape over the sample index `t` with parameters
/// `[baseline, amplitude, t0, tau]`: flat at `baseline` before `t0`, then
/// `baseline + amplitude * u^2 * (exp(-u) - exp(-3u))` with `u = (t - t0) / tau`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulseModel;

impl PulseModel {
    pub const N_PARAMS: usize = 4;

    /// The unit-amplitude shape at reduced time `u`.
    pub fn shape(u: f64) -> f64 {
        if u <= 0.0 {
            return 0.0;
        }
        u.powi(RISE_ORDER) * ((-u).exp() - (-FAST_RATIO * u).exp())
    }

    /// Parameter bounds for a waveform of `n_samples` samples.
    pub fn bounds(n_samples: usize) -> Bounds {
        let n = n_samples as f64;
        Bounds::new(
            vec![0.0, 0.0, -4.0 * n, TAU_MIN],
            vec![ADC_MAX, AMPLITUDE_MAX, 2.0 * n, 4.0 * n],
        )
    }

    /// Starting point for the nonlinear fit.
    ///
    /// Scans a grid of `(t0, tau)`; at each node baseline and amplitude enter
    /// linearly and are solved in closed form. The node with the smallest
    /// residual and a positive amplitude wins.
    pub fn initial_guess(y: &[f64]) -> Vec<f64> {
        let n = y.len();
        let bounds = Self::bounds(n);
        let count = n as f64;
        let sum_y: f64 = y.iter().sum();

        let mut best: Option<(f64, [f64; 4])> = None;
        for i in 0..(12 * n) {
            let t0 = -4.0 * count + 0.5 * i as f64;
            let mut tau = 0.1;
            while tau <= bounds.upper[3] {
                let g: Vec<f64> = (0..n).map(|t| Self::shape((t as f64 - t0) / tau)).collect();
                let sum_g: f64 = g.iter().sum();
                let sum_gg: f64 = g.iter().map(|v| v * v).sum();
                let sum_gy: f64 = g.iter().zip(y).map(|(g, y)| g * y).sum();
                let det = count * sum_gg - sum_g * sum_g;

                if det.abs() > 1e-12 {
                    let amplitude = (count * sum_gy - sum_g * sum_y) / det;
                    let baseline = (sum_y - amplitude * sum_g) / count;
                    if amplitude > PULSE_FLOOR * (baseline.abs() + 1.0) {
                        let ssr: f64 = g
                            .iter()
                            .zip(y)
                            .map(|(g, y)| (y - baseline - amplitude * g).powi(2))
                            .sum();
                        if best.map_or(true, |(cost, _)| ssr < cost) {
                            best = Some((ssr, [baseline, amplitude, t0, tau]));
                        }
                    }
                }
                tau *= 1.25;
            }
        }

        let mut guess = match best {
            Some((_, params)) => params.to_vec(),
            None => {
                let low = y.iter().copied().fold(f64::INFINITY, f64::min);
                let high = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                vec![low, high - low, 0.0, 1.0]
            }
        };
        bounds.clamp(&mut guess);
        guess
    }
}

impl Model for PulseModel {
    fn n_params(&self) -> usize {
        Self::N_PARAMS
    }

    fn eval(&self, t: f64, p: &[f64]) -> f64 {
        p[0] + p[1] * Self::shape((t - p[2]) / p[3])
    }
}

/// How the residuals of one rung are weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// Divided by the trial standard deviation.
    Sigma,
    Uniform,
}

/// One attempt of the fallback ladder.
#[derive(Debug, Clone, Copy)]
pub struct Rung {
    pub weighting: Weighting,
    /// Failures that hand over to the next rung.
    pub escalate_on: &'static [FitErrorKind],
    /// Failures that end the ladder and leave the point empty.
    pub abandon_on: &'static [FitErrorKind],
}

/// A saturated channel has zero spread over trials and cannot be weighted;
/// it is refit unweighted. Singular or non-converging fits leave the point empty.
pub const LADDER: [Rung; 2] = [
    Rung {
        weighting: Weighting::Sigma,
        escalate_on: &[FitErrorKind::Degenerate],
        abandon_on: &[FitErrorKind::Singular, FitErrorKind::Convergence],
    },
    Rung {
        weighting: Weighting::Uniform,
        escalate_on: &[],
        abandon_on: &[FitErrorKind::Singular, FitErrorKind::Convergence],
    },
];

/// Result of the ladder for one (step, channel).
#[derive(Debug, Clone, PartialEq)]
pub enum PointOutcome {
    Fitted {
        params: Vec<f64>,
        /// Sample position of the maximum.
        position: f64,
        peak: f64,
        weighting: Weighting,
    },
    Abandoned {
        weighting: Weighting,
        reason: FitErrorKind,
    },
}

impl PointOutcome {
    /// The peak value, zero when the point was abandoned.
    pub fn peak(&self) -> f64 {
        match self {
            PointOutcome::Fitted { peak, .. } => *peak,
            PointOutcome::Abandoned { .. } => 0.0,
        }
    }
}

fn attempt(
    mean: &[f64],
    sigma: Option<&[f64]>,
    config: &PulseFitConfig,
) -> std::result::Result<(Vec<f64>, f64, f64), FitError> {
    let x: Vec<f64> = (0..mean.len()).map(|t| t as f64).collect();
    let p0 = PulseModel::initial_guess(mean);
    let bounds = PulseModel::bounds(mean.len());

    let fit = curve_fit(&PulseModel, &x, mean, sigma, &p0, &bounds, &config.solver)?;

    let start = config.peak_start.unwrap_or_else(|| {
        mean.iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0 as f64
    });
    let position = locate_maximum(&PulseModel, &fit.params, start)?;
    let peak = PulseModel.eval(position, &fit.params);
    Ok((fit.params, position, peak))
}

/// Walk the fallback ladder for one averaged waveform.
///
/// Errors that no rung accepts are returned to the caller.
pub fn fit_point(
    mean: &[f64],
    sigma: &[f64],
    config: &PulseFitConfig,
) -> std::result::Result<PointOutcome, FitError> {
    let mut last = None;
    for rung in LADDER.iter() {
        let weights = match rung.weighting {
            Weighting::Sigma => Some(sigma),
            Weighting::Uniform => None,
        };
        match attempt(mean, weights, config) {
            Ok((params, position, peak)) => {
                return Ok(PointOutcome::Fitted {
                    params,
                    position,
                    peak,
                    weighting: rung.weighting,
                })
            }
            Err(err) if rung.escalate_on.contains(&err.kind()) => {
                trace!(weighting = ?rung.weighting, %err, "escalating to next rung");
                last = Some(err);
            }
            Err(err) if rung.abandon_on.contains(&err.kind()) => {
                return Ok(PointOutcome::Abandoned {
                    weighting: rung.weighting,
                    reason: err.kind(),
                })
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| FitError::Degenerate("empty fallback ladder".to_string())))
}

/// Fitted pulse maxima laid out as `[channel][step]`; empty points hold zero.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct PeakTable {
    pub n_steps: usize,
    values: Vec<Vec<f64>>,
}

impl PeakTable {
    pub fn new(n_steps: usize) -> Self {
        PeakTable {
            n_steps,
            values: vec![vec![0.0; n_steps]; CHANNELS],
        }
    }

    pub fn channel(&self, channel: usize) -> Option<&[f64]> {
        self.values.get(channel).map(Vec::as_slice)
    }

    pub fn get(&self, channel: usize, step: usize) -> Option<f64> {
        self.channel(channel)?.get(step).copied()
    }

    pub fn set(&mut self, channel: usize, step: usize, value: f64) {
        if let Some(slot) = self.values.get_mut(channel).and_then(|row| row.get_mut(step)) {
            *slot = value;
        }
    }
}

/// Fit every (step, channel) of `signal` and collect the pulse maxima.
pub fn fit_peaks(signal: &ReducedSignal, config: &PulseFitConfig) -> Result<PeakTable> {
    let mut table = PeakTable::new(signal.n_steps);
    let mut abandoned = 0usize;

    for step in 0..signal.n_steps {
        for channel in 0..CHANNELS {
            let (Some(mean), Some(sigma)) = (signal.mean(channel, step), signal.sigma(channel, step)) else {
                continue;
            };
            let outcome =
                fit_point(mean, sigma, config).map_err(|source| ScanError::PulseFit { step, channel, source })?;

            match &outcome {
                PointOutcome::Fitted { weighting, peak, .. } => {
                    trace!(step, channel, ?weighting, peak, "pulse fitted");
                }
                PointOutcome::Abandoned { reason, .. } => {
                    debug!(step, channel, ?reason, "pulse fit abandoned, peak left at zero");
                    abandoned += 1;
                }
            }
            table.set(channel, step, outcome.peak());
        }
    }

    debug!(steps = signal.n_steps, abandoned, "pulse fits done");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverOptions;
    use approx::assert_abs_diff_eq;

    /// Peak height of the unit shape, by dense scan.
    fn shape_max() -> f64 {
        (1..200_000).map(|i| PulseModel::shape(i as f64 * 1e-4)).fold(0.0, f64::max)
    }

    fn synthetic(n_samples: usize, params: &[f64]) -> Vec<f64> {
        (0..n_samples).map(|t| PulseModel.eval(t as f64, params)).collect()
    }

    #[test]
    fn test_shape_is_flat_before_onset() {
        assert_eq!(PulseModel::shape(0.0), 0.0);
        assert_eq!(PulseModel::shape(-3.0), 0.0);
        assert!(PulseModel::shape(2.0) > PulseModel::shape(0.5));
        assert_eq!(PulseModel.eval(1.0, &[1000.0, 500.0, 2.0, 1.0]), 1000.0);
    }

    #[test]
    fn test_initial_guess_within_bounds() {
        let y = synthetic(12, &[1200.0, 3000.0, 2.0, 1.5]);
        let guess = PulseModel::initial_guess(&y);
        let bounds = PulseModel::bounds(12);
        for k in 0..4 {
            assert!(guess[k] >= bounds.lower[k] && guess[k] <= bounds.upper[k]);
        }
        assert_abs_diff_eq!(guess[2], 2.0, epsilon = 0.5);
    }

    #[test]
    fn test_weighted_fit_recovers_peak() {
        let params = [1200.0, 3000.0, 2.0, 1.5];
        let mean = synthetic(16, &params);
        let sigma = vec![3.0; 16];

        let outcome = fit_point(&mean, &sigma, &PulseFitConfig::default()).unwrap();
        match outcome {
            PointOutcome::Fitted { weighting, peak, .. } => {
                assert_eq!(weighting, Weighting::Sigma);
                assert_abs_diff_eq!(peak, 1200.0 + 3000.0 * shape_max(), epsilon = 1e-3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_fixed_peak_start() {
        let params = [1200.0, 3000.0, 2.0, 1.5];
        let mean = synthetic(16, &params);
        let sigma = vec![3.0; 16];
        let config = PulseFitConfig {
            peak_start: Some(5.0),
            ..PulseFitConfig::default()
        };

        match fit_point(&mean, &sigma, &config).unwrap() {
            PointOutcome::Fitted { peak, .. } => {
                assert_abs_diff_eq!(peak, 1200.0 + 3000.0 * shape_max(), epsilon = 1e-3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_zero_sigma_falls_back_to_unweighted() {
        let params = [1000.0, 2500.0, 1.0, 1.2];
        let mean = synthetic(10, &params);
        let mut sigma = vec![2.0; 10];
        sigma[4] = 0.0;

        let outcome = fit_point(&mean, &sigma, &PulseFitConfig::default()).unwrap();
        match outcome {
            PointOutcome::Fitted {
                weighting, position, peak, ..
            } => {
                assert_eq!(weighting, Weighting::Uniform);
                assert_abs_diff_eq!(peak, 1000.0 + 2500.0 * shape_max(), epsilon = 1e-3);
                assert!(position > 1.0 && position < 10.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_non_converging_fit_is_abandoned() {
        let mean = synthetic(8, &[1500.0, 800.0, 1.0, 1.0]);
        let sigma = vec![0.0; 8];
        let config = PulseFitConfig {
            solver: SolverOptions {
                max_iterations: 0,
                ..SolverOptions::default()
            },
            peak_start: None,
        };

        let outcome = fit_point(&mean, &sigma, &config).unwrap();
        assert_eq!(
            outcome,
            PointOutcome::Abandoned {
                weighting: Weighting::Uniform,
                reason: FitErrorKind::Convergence
            }
        );
        assert_eq!(outcome.peak(), 0.0);
    }

    #[test]
    fn test_fit_peaks_fills_table() {
        use crate::scan_tools::RawWaveforms;

        let params = |step: usize| [1000.0, 400.0 * (step + 1) as f64, 1.0, 1.0];
        let mut samples = Vec::new();
        for step in 0..2 {
            for trial in 0..2 {
                for channel in 0..CHANNELS {
                    for t in 0..8 {
                        let v = PulseModel.eval(t as f64, &params(step)) + (trial + channel % 3) as f64;
                        samples.push(v.round() as u16);
                    }
                }
            }
        }
        let raw = RawWaveforms {
            n_steps: 2,
            n_trials: 2,
            n_samples: 8,
            samples,
        };

        let table = fit_peaks(&ReducedSignal::from_raw(&raw), &PulseFitConfig::default()).unwrap();
        assert_eq!(table.n_steps, 2);
        for channel in 0..CHANNELS {
            let expected = 1000.0 + 400.0 * shape_max() + (channel % 3) as f64 + 0.5;
            assert_abs_diff_eq!(table.get(channel, 0).unwrap(), expected, epsilon = 2.0);
            assert!(table.get(channel, 1).unwrap() > table.get(channel, 0).unwrap());
        }
    }

    #[test]
    fn test_ladder_order() {
        assert_eq!(LADDER[0].weighting, Weighting::Sigma);
        assert!(LADDER[0].escalate_on.contains(&FitErrorKind::Degenerate));
        assert_eq!(LADDER[1].weighting, Weighting::Uniform);
        assert!(LADDER[1].escalate_on.is_empty());
    }

    #[test]
    fn test_peak_table() {
        let mut table = PeakTable::new(3);
        table.set(15, 2, 42.0);
        assert_eq!(table.get(15, 2), Some(42.0));
        assert_eq!(table.channel(15).unwrap(), &[0.0, 0.0, 42.0]);
        assert_eq!(table.get(0, 3), None);
        assert!(table.channel(16).is_none());
    }
}
