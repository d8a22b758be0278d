//! Acceleration pre-filters.

use crate::config::AccFilterKind;
use std::collections::VecDeque;

/// Mean of the last `window_size` samples (of all samples while fewer are buffered).
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window_size: usize,
    buffer: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            buffer: VecDeque::with_capacity(window_size),
            sum: 0.0,
        }
    }

    pub fn process(&mut self, value: f64) -> f64 {
        self.buffer.push_back(value);
        self.sum += value;
        if self.buffer.len() > self.window_size {
            if let Some(old) = self.buffer.pop_front() {
                self.sum -= old;
            }
        }
        self.sum / self.buffer.len() as f64
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.sum = 0.0;
    }
}

/// First-order exponential smoothing, seeded with the first sample.
#[derive(Debug, Clone)]
pub struct LowPass {
    alpha: f64,
    last: Option<f64>,
}

impl LowPass {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            last: None,
        }
    }

    pub fn process(&mut self, value: f64) -> f64 {
        let out = match self.last {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        };
        self.last = Some(out);
        out
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// The configured pre-filter for one axis.
#[derive(Debug, Clone)]
pub enum AccFilter {
    Passthrough,
    MovingAverage(MovingAverage),
    LowPass(LowPass),
}

impl AccFilter {
    pub fn new(kind: AccFilterKind, param: f64) -> Self {
        match kind {
            AccFilterKind::None => AccFilter::Passthrough,
            AccFilterKind::MovingAverage => {
                AccFilter::MovingAverage(MovingAverage::new(param.round() as usize))
            }
            AccFilterKind::LowPass => AccFilter::LowPass(LowPass::new(param)),
        }
    }

    pub fn process(&mut self, value: f64) -> f64 {
        match self {
            AccFilter::Passthrough => value,
            AccFilter::MovingAverage(f) => f.process(value),
            AccFilter::LowPass(f) => f.process(value),
        }
    }

    pub fn reset(&mut self) {
        match self {
            AccFilter::Passthrough => {}
            AccFilter::MovingAverage(f) => f.reset(),
            AccFilter::LowPass(f) => f.reset(),
        }
    }
}
