// src/lib.rs
// Chargescan Library - Public API

//! # Chargescan
//!
//! A Rust library for extracting per-channel pedestal and gain from
//! charge-injection waveform scans of a 16-channel digitizer block.
//!
//! ## Features
//!
//! - Read both scan header dialects (`v1` line-ordered, `v2` `KEY:VALUE`)
//! - Decode packed low/high sample words into per-channel waveforms
//! - Average trials into per-sample mean and sigma
//! - Fit a pulse shape per step and channel, with a weighted/unweighted fallback
//! - Fit bounded pedestal + gain lines with standard errors
//!
//! ## Example
//!
//! ```no_run
//! use chargescan::{AnalysisConfig, FormatRegistry, OutputMode, ParseOutput};
//!
//! let registry = FormatRegistry::standard().expect("Invalid format table");
//! let output = registry
//!     .parse("auto", "scan.txt", OutputMode::Signal, &AnalysisConfig::default())
//!     .expect("Failed to parse scan");
//!
//! if let ParseOutput::Signal(bundle) = output {
//!     for (channel, [pedestal, gain]) in bundle.pars().iter().enumerate() {
//!         println!("channel {}: pedestal {:.1}, gain {:.2}", channel, pedestal, gain);
//!     }
//! }
//! ```

pub mod calibration;
pub mod config;
pub mod fitting;
pub mod formats;
pub mod pulse;
mod scan_tools;
pub mod signal;
pub mod tracing_init;

pub use calibration::{Calibration, ChannelCalibration};
pub use config::{AnalysisConfig, CalibrationConfig, PulseFitConfig, SolverOptions};
pub use fitting::{FitError, FitErrorKind};
pub use formats::{
    parse, DataFormat, DataFormatV1, DataFormatV2, Entry, EntryField, FormatRegistry, OutputMode, ParseOutput,
    SignalBundle,
};
pub use pulse::{PeakTable, PointOutcome, Weighting};
pub use scan_tools::{
    join_word, split_word, LineReader, RawWaveforms, Result, ScanError, ScanFile, ScanGeometry, ScanHeader, CHANNELS,
};
pub use signal::ReducedSignal;
