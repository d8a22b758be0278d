//! Signal processing: sample types, pre-filters, RLS integration and spectra.

pub mod fft;
pub mod filter;
pub mod processor;
pub mod rls;
pub mod sample;

pub use processor::SignalProcessor;
pub use sample::{AccelSample, ProcessedSample, Vector3};
