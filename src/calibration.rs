// Calibration Module
// Straight-line fit of peak response against injected-charge step

use std::fmt;

use tracing::{debug, info};

use crate::config::CalibrationConfig;
use crate::fitting::{curve_fit, Bounds, FitError, LinearModel};
use crate::pulse::PeakTable;
use crate::scan_tools::{Result, ScanError, CHANNELS};

#[derive(Default, Clone, Copy, Debug, PartialEq)]
pub struct ChannelCalibration {
    pub pedestal: f64,
    pub gain: f64,
    pub pedestal_err: f64,
    pub gain_err: f64,
}

/// Pedestal and gain of every channel of the board.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub channels: Vec<ChannelCalibration>,
}

impl Calibration {
    /// `[pedestal, gain]` per channel.
    pub fn pars(&self) -> Vec<[f64; 2]> {
        self.channels.iter().map(|c| [c.pedestal, c.gain]).collect()
    }

    /// Standard errors of [`Calibration::pars`].
    pub fn errs(&self) -> Vec<[f64; 2]> {
        self.channels.iter().map(|c| [c.pedestal_err, c.gain_err]).collect()
    }
}

/// Renders a `[channels][2]` matrix one row per line, `[[a b]\n [c d]]`.
pub(crate) struct Matrix<'a>(pub &'a [[f64; 2]]);

impl fmt::Display for Matrix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, row) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "\n ")?;
            }
            write!(f, "[{:.8e} {:.8e}]", row[0], row[1])?;
        }
        write!(f, "]")
    }
}

/// Fit `peak = pedestal + gain * step` over steps `first_step..` of one channel.
pub fn fit_channel(peaks: &[f64], config: &CalibrationConfig) -> std::result::Result<ChannelCalibration, FitError> {
    if peaks.len() < config.first_step + 2 {
        return Err(FitError::Degenerate(format!(
            "{} steps, need at least {} to fit from step {}",
            peaks.len(),
            config.first_step + 2,
            config.first_step
        )));
    }

    let x: Vec<f64> = (config.first_step..peaks.len()).map(|step| step as f64).collect();
    let y = &peaks[config.first_step..];
    let bounds = Bounds::new(config.lower.to_vec(), config.upper.to_vec());

    let fit = curve_fit(&LinearModel, &x, y, None, &config.initial, &bounds, &config.solver)?;
    let errors = fit.std_errors();
    debug!(iterations = fit.iterations, cost = fit.cost, "calibration fit converged");

    Ok(ChannelCalibration {
        pedestal: fit.params[0],
        gain: fit.params[1],
        pedestal_err: errors[0],
        gain_err: errors[1],
    })
}

/// Calibrate all channels. The first failing channel aborts the whole board.
pub fn fit_all(peaks: &PeakTable, config: &CalibrationConfig) -> Result<Calibration> {
    let mut channels = Vec::with_capacity(CHANNELS);
    for channel in 0..CHANNELS {
        let values = peaks.channel(channel).unwrap_or_default();
        let calibration = fit_channel(values, config).map_err(|source| ScanError::CalibrationFit { channel, source })?;
        channels.push(calibration);
    }

    let calibration = Calibration { channels };
    info!("calibration pars:\n{}", Matrix(&calibration.pars()));
    info!("calibration errs:\n{}", Matrix(&calibration.errs()));
    Ok(calibration)
}
