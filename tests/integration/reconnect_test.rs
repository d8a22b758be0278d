//! Sensor loss and recovery through the full pipeline, driven by scripted
//! ports instead of hardware.

use super::support::{acceleration_frames, collect_points, test_config, ScriptedOpener};
use imu_daq::pipeline::{PipelineCoordinator, PipelineState};
use imu_daq::publisher::ChannelTransport;
use imu_daq::transport::DynSerial;
use imu_daq::DaqError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const WAIT: Duration = Duration::from_secs(20);

#[tokio::test]
async fn test_processing_restarts_after_reconnect() {
    let (mut first_host, first_device) = tokio::io::duplex(64 * 1024);
    let (mut second_host, second_device) = tokio::io::duplex(64 * 1024);
    first_host
        .write_all(&acceleration_frames(150, [0.2, 0.0, 1.0]))
        .await
        .unwrap();
    second_host
        .write_all(&acceleration_frames(50, [0.2, 0.0, 1.0]))
        .await
        .unwrap();

    let ports: Vec<DynSerial> = vec![Box::new(first_device), Box::new(second_device)];
    let opener = Arc::new(ScriptedOpener::new(ports));
    let (transport, mut published, _control) = ChannelTransport::new(4096);
    let coordinator =
        PipelineCoordinator::new(test_config(None), opener.clone(), Box::new(transport)).unwrap();
    let stop = coordinator.stop_handle();
    let status = coordinator.subscribe();
    let run = tokio::spawn(coordinator.run());

    let before = collect_points(&mut published, 150, WAIT).await;
    // Unplug: the reader sees end of stream and the coordinator reopens.
    drop(first_host);
    let after = collect_points(&mut published, 50, WAIT).await;

    stop.stop();
    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    drop(second_host);

    assert!(before[..99].iter().all(|p| !p.rls_warmed_up));
    assert!(before[99..].iter().all(|p| p.rls_warmed_up));
    assert!(after.iter().all(|p| !p.rls_warmed_up));
    assert!(after
        .iter()
        .all(|p| p.vel_x == 0.0 && p.disp_x == 0.0 && p.disp_magnitude == 0.0));
    assert!(after[0].ts > before[149].ts);

    assert_eq!(report.epochs, 2);
    assert_eq!(report.reconnects, 1);
    assert_eq!(report.samples_processed, 200);
    assert_eq!(opener.attempts(), 2);
    assert_eq!(status.borrow().state, PipelineState::Stopped);
}

#[tokio::test]
async fn test_bounded_recovery_gives_up() {
    let (mut host, device) = tokio::io::duplex(4096);
    host.write_all(&acceleration_frames(10, [0.0, 0.0, 1.0]))
        .await
        .unwrap();

    let opener = Arc::new(ScriptedOpener::new(vec![Box::new(device) as DynSerial]));
    let mut config = test_config(None);
    config.recovery.max_attempts = 3;
    let (transport, mut published, _control) = ChannelTransport::new(64);
    let coordinator =
        PipelineCoordinator::new(config, opener.clone(), Box::new(transport)).unwrap();
    let status = coordinator.subscribe();
    let run = tokio::spawn(coordinator.run());

    collect_points(&mut published, 10, WAIT).await;
    drop(host);

    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(matches!(result, Err(DaqError::ReconnectExhausted(3))), "{result:?}");
    // One successful open, then three failed reopen attempts.
    assert_eq!(opener.attempts(), 4);
    assert_eq!(status.borrow().state, PipelineState::Stopped);
}

#[tokio::test]
async fn test_stop_while_sensor_missing() {
    let opener = Arc::new(ScriptedOpener::new(Vec::new()));
    let mut config = test_config(None);
    config.recovery.initial_delay_ms = 1_000;
    config.recovery.max_delay_ms = 1_000;
    let (transport, _published, _control) = ChannelTransport::new(16);
    let coordinator = PipelineCoordinator::new(config, opener.clone(), Box::new(transport)).unwrap();
    let stop = coordinator.stop_handle();
    let mut status = coordinator.subscribe();
    let run = tokio::spawn(coordinator.run());

    tokio::time::timeout(
        WAIT,
        status.wait_for(|s| s.state == PipelineState::Recovering),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.stop();

    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(report.epochs, 0);
    assert_eq!(report.samples_processed, 0);
    assert!(opener.attempts() >= 1);
}
