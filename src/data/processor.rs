//! Per-sample signal processing.

use super::fft::DominantFrequency;
use super::filter::AccFilter;
use super::rls::{Integrated, RlsIntegrator};
use super::sample::{AccelSample, ProcessedSample, Vector3};
use crate::config::ProcessingConfig;
use tracing::{debug, info};

/// Turns acceleration samples into [`ProcessedSample`]s.
///
/// Exactly one output is produced per input. The three axes are processed
/// independently; integration runs once per completed RLS frame and its latest
/// result is held for the samples in between.
pub struct SignalProcessor {
    gravity: f64,
    frame_size: usize,
    fft_interval: usize,
    filters: [AccFilter; 3],
    integrators: [RlsIntegrator; 3],
    spectra: [DominantFrequency; 3],
    pending: [Vec<f64>; 3],
    latest: [Integrated; 3],
    dominant: Vector3,
    samples_since_fft: usize,
    spectrum_ready: bool,
    samples_processed: u64,
}

impl SignalProcessor {
    pub fn new(config: &ProcessingConfig) -> Self {
        let rate = 1.0 / config.sample_interval_s;
        let integrator = || {
            RlsIntegrator::new(
                config.rls_sample_frame_size,
                config.rls_calc_frame_multiplier,
                config.sample_interval_s,
                config.rls_forgetting_factor,
                config.rls_warmup_frames,
            )
        };
        let spectrum = || {
            DominantFrequency::new(
                config.fft_points,
                rate,
                config.fft_min_freq_hz,
                config.fft_max_freq_hz,
            )
        };
        let filter = || AccFilter::new(config.acc_filter, config.acc_filter_param);
        let frame_size = config.rls_sample_frame_size.max(1);

        info!(
            dt = config.sample_interval_s,
            frame_size,
            window = frame_size * config.rls_calc_frame_multiplier,
            fft_points = config.fft_points,
            "Signal processor initialised"
        );

        Self {
            gravity: config.gravity,
            frame_size,
            fft_interval: config.fft_interval.max(1),
            filters: [filter(), filter(), filter()],
            integrators: [integrator(), integrator(), integrator()],
            spectra: [spectrum(), spectrum(), spectrum()],
            pending: std::array::from_fn(|_| Vec::with_capacity(frame_size)),
            latest: [Integrated::default(); 3],
            dominant: Vector3::ZERO,
            samples_since_fft: 0,
            spectrum_ready: false,
            samples_processed: 0,
        }
    }

    /// Process one sample.
    pub fn process(&mut self, sample: &AccelSample) -> ProcessedSample {
        let g = sample.acc_g;
        let acc_raw = Vector3::new(
            g.x * self.gravity,
            g.y * self.gravity,
            (g.z - 1.0) * self.gravity,
        );
        let raw = acc_raw.to_array();
        let mut filtered = [0.0; 3];
        for axis in 0..3 {
            filtered[axis] = self.filters[axis].process(raw[axis]);
            self.pending[axis].push(filtered[axis]);
            self.spectra[axis].push(filtered[axis]);
        }

        if self.pending[0].len() >= self.frame_size {
            for axis in 0..3 {
                if let Some(out) = self.integrators[axis].process_frame(&self.pending[axis]) {
                    self.latest[axis] = out;
                }
                self.pending[axis].clear();
            }
        }

        self.samples_since_fft += 1;
        if self.spectra[0].is_full()
            && (!self.spectrum_ready || self.samples_since_fft >= self.fft_interval)
        {
            let mut freqs = [0.0; 3];
            for (axis, spectrum) in self.spectra.iter_mut().enumerate() {
                freqs[axis] = spectrum.compute().unwrap_or(0.0);
            }
            self.dominant = Vector3::from_array(freqs);
            self.samples_since_fft = 0;
            if !self.spectrum_ready {
                debug!("Spectral window full");
            }
            self.spectrum_ready = true;
        }

        let rls_warmed_up = self.is_warmed_up();
        let (velocity, displacement) = if rls_warmed_up {
            (
                Vector3::from_array(self.latest.map(|i| i.velocity)),
                Vector3::from_array(self.latest.map(|i| i.displacement)),
            )
        } else {
            (Vector3::ZERO, Vector3::ZERO)
        };

        self.samples_processed += 1;
        ProcessedSample {
            timestamp: sample.timestamp,
            acc_raw,
            acc_filtered: Vector3::from_array(filtered),
            velocity,
            displacement,
            displacement_magnitude: displacement.magnitude(),
            dominant_freq: self.dominant,
            overall_dominant_freq: self.dominant.max_component(),
            rls_warmed_up,
        }
    }

    pub fn is_warmed_up(&self) -> bool {
        self.integrators[0].is_warmed_up()
    }

    /// Samples processed since construction or the last reset.
    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    /// Return to the freshly constructed state, keeping allocations.
    pub fn reset(&mut self) {
        for axis in 0..3 {
            self.filters[axis].reset();
            self.integrators[axis].reset();
            self.spectra[axis].reset();
            self.pending[axis].clear();
        }
        self.latest = [Integrated::default(); 3];
        self.dominant = Vector3::ZERO;
        self.samples_since_fft = 0;
        self.spectrum_ready = false;
        let processed = std::mem::take(&mut self.samples_processed);
        info!(processed, "Signal processor reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn samples(n: usize, g: Vector3) -> Vec<AccelSample> {
        let start = Utc::now();
        (0..n)
            .map(|i| AccelSample {
                timestamp: start + Duration::milliseconds(5 * i as i64),
                acc_g: g,
                temperature_c: 25.0,
            })
            .collect()
    }

    #[test]
    fn one_output_per_input() {
        let mut p = SignalProcessor::new(&ProcessingConfig::default());
        let out: Vec<_> = samples(250, Vector3::new(0.0, 0.0, 1.0))
            .iter()
            .map(|s| p.process(s))
            .collect();
        assert_eq!(out.len(), 250);
        assert_eq!(p.samples_processed(), 250);
    }

    #[test]
    fn gravity_removed_from_z() {
        let mut p = SignalProcessor::new(&ProcessingConfig::default());
        let out = p.process(&samples(1, Vector3::new(1.0, 0.0, 1.0))[0]);
        assert!((out.acc_raw.x - 9.80665).abs() < 1e-12);
        assert_eq!(out.acc_raw.z, 0.0);
        assert_eq!(out.acc_filtered, out.acc_raw);
    }

    #[test]
    fn warm_up_boundary_at_frame_count() {
        let config = ProcessingConfig::default();
        let threshold = config.rls_sample_frame_size * config.rls_warmup_frames;
        let mut p = SignalProcessor::new(&config);
        let out: Vec<_> = samples(threshold + 30, Vector3::new(0.1, 0.0, 1.0))
            .iter()
            .map(|s| p.process(s))
            .collect();
        assert!(out[..threshold - 1].iter().all(|s| !s.rls_warmed_up));
        assert!(out[..threshold - 1]
            .iter()
            .all(|s| s.velocity == Vector3::ZERO && s.displacement == Vector3::ZERO));
        assert!(out[threshold - 1..].iter().all(|s| s.rls_warmed_up));
    }

    #[test]
    fn frequency_zero_until_window_full() {
        let mut config = ProcessingConfig::default();
        config.fft_points = 64;
        let mut p = SignalProcessor::new(&config);
        let out: Vec<_> = samples(80, Vector3::new(0.0, 0.0, 1.0))
            .iter()
            .map(|s| p.process(s))
            .collect();
        assert!(out[..63].iter().all(|s| s.overall_dominant_freq == 0.0));
    }

    #[test]
    fn reset_restarts_warm_up() {
        let mut p = SignalProcessor::new(&ProcessingConfig::default());
        for s in samples(200, Vector3::new(0.0, 0.0, 1.0)) {
            p.process(&s);
        }
        assert!(p.is_warmed_up());
        p.reset();
        assert!(!p.is_warmed_up());
        assert_eq!(p.samples_processed(), 0);
        let out = p.process(&samples(1, Vector3::new(0.0, 0.0, 1.0))[0]);
        assert!(!out.rls_warmed_up);
    }
}
