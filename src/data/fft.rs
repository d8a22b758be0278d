//! Dominant-frequency analysis over a sliding window.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

/// Finds the strongest spectral peak of the most recent `window_size` samples.
///
/// A Hann window is applied before the transform. The DC bin is ignored and
/// only bins within `[min_freq, max_freq]` compete for the peak.
///
/// # Example
///
/// ```
/// use imu_daq::data::fft::DominantFrequency;
///
/// let rate = 200.0;
/// let mut analyzer = DominantFrequency::new(256, rate, 0.1, None);
/// for i in 0..256 {
///     let t = i as f64 / rate;
///     analyzer.push((2.0 * std::f64::consts::PI * 25.0 * t).sin());
/// }
/// let peak = analyzer.compute().unwrap();
/// assert!((peak - 25.0).abs() < rate / 256.0);
/// ```
#[derive(Clone)]
pub struct DominantFrequency {
    window_size: usize,
    sampling_rate: f64,
    min_freq: f64,
    max_freq: f64,
    samples: VecDeque<f64>,
    fft: Arc<dyn Fft<f64>>,
    hann_window: Vec<f64>,
    scratch: Vec<Complex<f64>>,
}

impl DominantFrequency {
    /// `max_freq` defaults to the Nyquist frequency.
    pub fn new(window_size: usize, sampling_rate: f64, min_freq: f64, max_freq: Option<f64>) -> Self {
        let window_size = window_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window_size);

        let hann_window = (0..window_size)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f64::consts::PI * i as f64 / (window_size - 1) as f64).cos())
            })
            .collect();

        let nyquist = sampling_rate / 2.0;
        let max_freq = max_freq.unwrap_or(nyquist);
        if min_freq >= max_freq {
            tracing::warn!(min_freq, max_freq, "Empty FFT search band, dominant frequency will be 0");
        }

        Self {
            window_size,
            sampling_rate,
            min_freq,
            max_freq,
            samples: VecDeque::with_capacity(window_size),
            fft,
            hann_window,
            scratch: vec![Complex::new(0.0, 0.0); window_size],
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.window_size
    }

    /// Frequency of the strongest in-band bin, or `None` until the window is full.
    pub fn compute(&mut self) -> Option<f64> {
        if !self.is_full() {
            return None;
        }
        for ((slot, &value), &w) in self
            .scratch
            .iter_mut()
            .zip(self.samples.iter())
            .zip(self.hann_window.iter())
        {
            *slot = Complex::new(value * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let resolution = self.sampling_rate / self.window_size as f64;
        let mut best: Option<(f64, f64)> = None;
        for (bin, value) in self.scratch.iter().enumerate().take(self.window_size / 2 + 1).skip(1) {
            let freq = bin as f64 * resolution;
            if freq < self.min_freq || freq > self.max_freq {
                continue;
            }
            let magnitude = value.norm();
            if best.map_or(true, |(_, m)| magnitude > m) {
                best = Some((freq, magnitude));
            }
        }
        Some(best.map_or(0.0, |(freq, _)| freq))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, rate: f64, n: usize) -> impl Iterator<Item = f64> {
        (0..n).map(move |i| (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin())
    }

    #[test]
    fn not_full_yields_none() {
        let mut fft = DominantFrequency::new(64, 200.0, 0.1, None);
        fft.push(1.0);
        assert_eq!(fft.compute(), None);
    }

    #[test]
    fn finds_sine_peak() {
        let mut fft = DominantFrequency::new(512, 200.0, 0.1, None);
        sine(10.0, 200.0, 600).for_each(|v| fft.push(v));
        let peak = fft.compute().unwrap();
        assert!((peak - 10.0).abs() <= 200.0 / 512.0, "peak {peak}");
    }

    #[test]
    fn band_limits_exclude_peak() {
        let mut fft = DominantFrequency::new(512, 200.0, 0.1, Some(5.0));
        sine(10.0, 200.0, 512).zip(sine(2.0, 200.0, 512)).for_each(|(a, b)| fft.push(a + 0.2 * b));
        let peak = fft.compute().unwrap();
        assert!((peak - 2.0).abs() <= 200.0 / 512.0, "peak {peak}");
    }

    #[test]
    fn constant_signal_has_no_ac_peak_at_dc() {
        let mut fft = DominantFrequency::new(128, 200.0, 0.0, None);
        (0..128).for_each(|_| fft.push(3.0));
        // DC excluded: the answer is some non-zero bin, never 0 Hz
        assert!(fft.compute().unwrap() > 0.0);
    }

    #[test]
    fn reset_empties_window() {
        let mut fft = DominantFrequency::new(4, 200.0, 0.1, None);
        (0..4).for_each(|i| fft.push(i as f64));
        assert!(fft.is_full());
        fft.reset();
        assert!(!fft.is_full());
    }
}
