//! The shipped configuration file loads, validates and matches the defaults.

use imu_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};

#[test]
fn test_shipped_config_matches_defaults() {
    let loaded = AppConfig::load_from(DEFAULT_CONFIG_PATH).expect("shipped config must parse");
    loaded.validate().expect("shipped config must validate");

    let defaults = AppConfig::default();
    assert_eq!(
        serde_json::to_value(&loaded).unwrap(),
        serde_json::to_value(&defaults).unwrap()
    );
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let loaded = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(loaded.publisher.strategy, "realtime");
    assert_eq!(loaded.processing.rls_warmup_frames, 5);
}
