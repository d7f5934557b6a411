// Trial averaging

use crate::scan_tools::{RawWaveforms, CHANNELS};

/// Per-sample mean and population standard deviation over trials, laid out as
/// `[channel][step][sample]`. Only steps fully present in the raw block are reduced.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct ReducedSignal {
    pub n_steps: usize,
    pub n_samples: usize,
    mean: Vec<f64>,
    sigma: Vec<f64>,
}

impl ReducedSignal {
    pub fn from_raw(raw: &RawWaveforms) -> Self {
        let (n_trials, n_samples) = (raw.n_trials, raw.n_samples);
        let n_steps = raw.complete_steps();
        let len = CHANNELS * n_steps * n_samples;
        let mut mean = vec![0.0; len];
        let mut sigma = vec![0.0; len];

        for channel in 0..CHANNELS {
            for step in 0..n_steps {
                let base = (channel * n_steps + step) * n_samples;
                let trials: Vec<&[u16]> = (0..n_trials)
                    .filter_map(|trial| raw.waveform(step, trial, channel))
                    .collect();

                for sample in 0..n_samples {
                    let n = trials.len() as f64;
                    let m = trials.iter().map(|w| f64::from(w[sample])).sum::<f64>() / n;
                    let var = trials
                        .iter()
                        .map(|w| (f64::from(w[sample]) - m).powi(2))
                        .sum::<f64>()
                        / n;
                    mean[base + sample] = m;
                    sigma[base + sample] = var.sqrt();
                }
            }
        }

        ReducedSignal {
            n_steps,
            n_samples,
            mean,
            sigma,
        }
    }

    pub fn mean(&self, channel: usize, step: usize) -> Option<&[f64]> {
        self.slice(&self.mean, channel, step)
    }

    pub fn sigma(&self, channel: usize, step: usize) -> Option<&[f64]> {
        self.slice(&self.sigma, channel, step)
    }

    fn slice<'a>(&self, data: &'a [f64], channel: usize, step: usize) -> Option<&'a [f64]> {
        if channel >= CHANNELS || step >= self.n_steps {
            return None;
        }
        let start = (channel * self.n_steps + step) * self.n_samples;
        Some(&data[start..start + self.n_samples])
    }
}
