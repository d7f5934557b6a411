// Analysis configuration

/// Stopping rules for the least-squares solver.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    pub max_iterations: u64,
    /// Stop when an accepted step lowers the cost by less than this fraction.
    pub ftol: f64,
    /// Stop when an accepted step moves the parameters by less than this fraction.
    pub xtol: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 400,
            ftol: 1e-12,
            xtol: 1e-10,
        }
    }
}

/// Settings for the per-step pulse-shape fits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulseFitConfig {
    pub solver: SolverOptions,
    /// Seed of the maximum search, in samples. `None` starts from the sample
    /// holding the largest mean value; `Some(5.0)` reproduces the fixed start
    /// at sample 5 used by earlier analyses of these scans.
    pub peak_start: Option<f64>,
}

/// Settings for the per-channel straight-line calibration fit.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Initial `[pedestal, gain]`.
    pub initial: [f64; 2],
    pub lower: [f64; 2],
    pub upper: [f64; 2],
    /// Steps before this index sit too close to the pedestal and are left out.
    pub first_step: usize,
    pub solver: SolverOptions,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            initial: [1500.0, 375.0],
            lower: [500.0, 275.0],
            upper: [2500.0, 475.0],
            first_step: 2,
            solver: SolverOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisConfig {
    pub pulse: PulseFitConfig,
    pub calibration: CalibrationConfig,
}

impl AnalysisConfig {
    pub fn with_peak_start(mut self, start: f64) -> Self {
        self.pulse.peak_start = Some(start);
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }
}
