//! Warm-up flag behaviour across processor configurations and resets.

use chrono::{Duration, Utc};
use imu_daq::config::ProcessingConfig;
use imu_daq::data::{AccelSample, SignalProcessor, Vector3};

fn run(processor: &mut SignalProcessor, count: usize) -> Vec<bool> {
    let start = Utc::now();
    (0..count)
        .map(|i| {
            let sample = AccelSample {
                timestamp: start + Duration::milliseconds(5 * i as i64),
                acc_g: Vector3::new((i as f64 * 0.3).sin() * 0.1, 0.0, 1.0),
                temperature_c: 25.0,
            };
            processor.process(&sample).rls_warmed_up
        })
        .collect()
}

#[test]
fn test_warm_up_threshold_follows_configuration() {
    for (frame, frames) in [(20, 5), (10, 3), (1, 1), (8, 12)] {
        let config = ProcessingConfig {
            rls_sample_frame_size: frame,
            rls_warmup_frames: frames,
            rls_calc_frame_multiplier: 10,
            ..ProcessingConfig::default()
        };
        let threshold = frame * frames;
        let mut processor = SignalProcessor::new(&config);
        let flags = run(&mut processor, threshold + 50);

        assert!(
            flags[..threshold - 1].iter().all(|w| !w),
            "frame {frame} x {frames}: warmed up early"
        );
        assert!(
            flags[threshold - 1..].iter().all(|w| *w),
            "frame {frame} x {frames}: not warmed up at {threshold}"
        );
    }
}

#[test]
fn test_reset_restarts_warm_up_from_scratch() {
    let config = ProcessingConfig::default();
    let threshold = config.rls_sample_frame_size * config.rls_warmup_frames;
    let mut processor = SignalProcessor::new(&config);

    assert!(run(&mut processor, threshold).last().copied().unwrap());
    processor.reset();
    let flags = run(&mut processor, threshold);
    assert!(flags[..threshold - 1].iter().all(|w| !w));
    assert!(flags[threshold - 1]);
}
