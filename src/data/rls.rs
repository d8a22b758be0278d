//! Recursive-least-squares integration of acceleration.
//!
//! Each axis keeps a rolling calculation window of `frame_size × multiplier`
//! acceleration samples. When a frame of new samples completes, the window is
//! integrated to velocity (trapezoid rule), a linear trend fitted by RLS is
//! removed, the result is integrated to displacement and detrended again.
//! The trend models `y = slope·t + intercept`, so drift from sensor bias and
//! integration constants does not accumulate.

use std::fmt;

/// Initial covariance scale (`P = P0·I`).
const INITIAL_COVARIANCE: f64 = 1000.0;

/// Online linear-trend fit with exponential forgetting.
#[derive(Clone)]
pub struct TrendEstimator {
    /// `[slope, intercept]`
    theta: [f64; 2],
    p: [[f64; 2]; 2],
    forgetting: f64,
}

impl fmt::Debug for TrendEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrendEstimator")
            .field("slope", &self.theta[0])
            .field("intercept", &self.theta[1])
            .finish()
    }
}

impl TrendEstimator {
    pub fn new(forgetting: f64) -> Self {
        Self {
            theta: [0.0; 2],
            p: [[INITIAL_COVARIANCE, 0.0], [0.0, INITIAL_COVARIANCE]],
            forgetting,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.forgetting);
    }

    /// `[slope, intercept]`
    pub fn coefficients(&self) -> [f64; 2] {
        self.theta
    }

    fn update(&mut self, t: f64, y: f64) {
        let phi = [t, 1.0];
        let p_phi = [
            self.p[0][0] * phi[0] + self.p[0][1] * phi[1],
            self.p[1][0] * phi[0] + self.p[1][1] * phi[1],
        ];
        let denom = self.forgetting + phi[0] * p_phi[0] + phi[1] * p_phi[1];
        if denom == 0.0 || !denom.is_finite() {
            return;
        }
        let k = [p_phi[0] / denom, p_phi[1] / denom];
        let err = y - (self.theta[0] * phi[0] + self.theta[1] * phi[1]);
        self.theta[0] += k[0] * err;
        self.theta[1] += k[1] * err;

        // phiᵀP as a row vector
        let phi_p = [
            phi[0] * self.p[0][0] + phi[1] * self.p[1][0],
            phi[0] * self.p[0][1] + phi[1] * self.p[1][1],
        ];
        for (i, row) in self.p.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (*cell - k[i] * phi_p[j]) / self.forgetting;
            }
        }
    }

    /// Fit over `data` sampled every `dt`, then subtract the fitted line in place.
    pub fn detrend(&mut self, data: &mut [f64], dt: f64) {
        for (i, y) in data.iter().enumerate() {
            self.update(i as f64 * dt, *y);
        }
        let [slope, intercept] = self.theta;
        for (i, y) in data.iter_mut().enumerate() {
            *y -= slope * i as f64 * dt + intercept;
        }
    }
}

fn integrate_trapezoid(input: &[f64], dt: f64, out: &mut [f64]) {
    if let Some(first) = out.first_mut() {
        *first = 0.0;
    }
    for i in 1..input.len() {
        out[i] = out[i - 1] + (input[i - 1] + input[i]) * dt / 2.0;
    }
}

/// Velocity and displacement at the newest sample of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Integrated {
    pub velocity: f64,
    pub displacement: f64,
}

/// Single-axis integrator.
#[derive(Debug, Clone)]
pub struct RlsIntegrator {
    frame_size: usize,
    dt: f64,
    warmup_frames: usize,
    acc: Vec<f64>,
    vel: Vec<f64>,
    disp: Vec<f64>,
    vel_trend: TrendEstimator,
    disp_trend: TrendEstimator,
    frame_count: usize,
}

impl RlsIntegrator {
    pub fn new(
        frame_size: usize,
        calc_frame_multiplier: usize,
        dt: f64,
        forgetting: f64,
        warmup_frames: usize,
    ) -> Self {
        let frame_size = frame_size.max(1);
        let calc_len = frame_size * calc_frame_multiplier.max(1);
        Self {
            frame_size,
            dt,
            warmup_frames,
            acc: vec![0.0; calc_len],
            vel: vec![0.0; calc_len],
            disp: vec![0.0; calc_len],
            vel_trend: TrendEstimator::new(forgetting),
            disp_trend: TrendEstimator::new(forgetting),
            frame_count: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn is_warmed_up(&self) -> bool {
        self.frame_count >= self.warmup_frames
    }

    /// Push one frame of acceleration (m/s²).
    ///
    /// Returns `None` while warming up. Frames longer than the configured frame
    /// size are truncated.
    pub fn process_frame(&mut self, frame: &[f64]) -> Option<Integrated> {
        let frame = &frame[..frame.len().min(self.frame_size)];
        if frame.is_empty() {
            return None;
        }
        self.frame_count += 1;

        let n = frame.len();
        self.acc.rotate_left(n);
        let tail = self.acc.len() - n;
        self.acc[tail..].copy_from_slice(frame);

        if !self.is_warmed_up() {
            tracing::trace!(
                frame = self.frame_count,
                warmup = self.warmup_frames,
                "RLS warming up"
            );
            return None;
        }

        integrate_trapezoid(&self.acc, self.dt, &mut self.vel);
        self.vel_trend.detrend(&mut self.vel, self.dt);
        integrate_trapezoid(&self.vel, self.dt, &mut self.disp);
        self.disp_trend.detrend(&mut self.disp, self.dt);

        Some(Integrated {
            velocity: self.vel.last().copied().unwrap_or(0.0),
            displacement: self.disp.last().copied().unwrap_or(0.0),
        })
    }

    /// Clear history and estimator state without reallocating.
    pub fn reset(&mut self) {
        self.acc.fill(0.0);
        self.vel.fill(0.0);
        self.disp.fill(0.0);
        self.vel_trend.reset();
        self.disp_trend.reset();
        self.frame_count = 0;
    }
}
