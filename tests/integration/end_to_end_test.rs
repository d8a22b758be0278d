//! Bytes in, rows and broker messages out.

use super::support::{acceleration_frames, collect_points, test_config, ScriptedOpener};
use imu_daq::config::StorageFormat;
use imu_daq::pipeline::PipelineCoordinator;
use imu_daq::publisher::ChannelTransport;
use imu_daq::storage::read_records;
use imu_daq::transport::DynSerial;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const WAIT: Duration = Duration::from_secs(30);
const FRAMES: usize = 1000;

fn data_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_thousand_frames_become_thousand_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (mut host, device) = tokio::io::duplex(64 * 1024);
    host.write_all(&acceleration_frames(FRAMES, [1.0, 0.0, 9.8]))
        .await
        .unwrap();

    let opener = Arc::new(ScriptedOpener::new(vec![Box::new(device) as DynSerial]));
    let (transport, mut published, _control) = ChannelTransport::new(4096);
    let coordinator =
        PipelineCoordinator::new(test_config(Some(dir.path())), opener, Box::new(transport))
            .unwrap();
    let stop = coordinator.stop_handle();
    let run = tokio::spawn(coordinator.run());

    let points = collect_points(&mut published, FRAMES, WAIT).await;
    stop.stop();
    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    drop(host);

    assert_eq!(points.len(), FRAMES);
    assert!(points.windows(2).all(|w| w[0].ts < w[1].ts));

    let files = data_files(dir.path());
    assert_eq!(files.len(), 1);
    let header = std::fs::read_to_string(&files[0]).unwrap();
    assert!(header.starts_with("timestamp,acc_x,acc_y,acc_z,"));

    let rows = read_records(&files[0], StorageFormat::Csv).unwrap();
    assert_eq!(rows.len(), FRAMES);
    assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    // x at 1 g, z at 9.8 g with one g of gravity removed, both in m/s².
    let g = 9.80665;
    assert!(rows
        .iter()
        .all(|r| (r.acc_raw.x - g).abs() < 0.01 && (r.acc_raw.z - 8.8 * g).abs() < 0.05));

    assert_eq!(report.epochs, 1);
    assert_eq!(report.samples_processed, FRAMES as u64);
    assert_eq!(report.decoder.frames_decoded, FRAMES as u64);
    let storage = report.storage.unwrap();
    assert_eq!(storage.records_stored, FRAMES as u64);
    assert_eq!(report.publisher.samples_sent, FRAMES as u64);
}

#[tokio::test]
async fn test_batch_strategy_reads_back_from_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (mut host, device) = tokio::io::duplex(64 * 1024);
    host.write_all(&acceleration_frames(FRAMES, [0.0, 0.5, 1.0]))
        .await
        .unwrap();

    let mut config = test_config(Some(dir.path()));
    config.publisher.strategy = "batch".to_string();
    config.publisher.batch_size = 100;
    let opener = Arc::new(ScriptedOpener::new(vec![Box::new(device) as DynSerial]));
    let (transport, mut published, _control) = ChannelTransport::new(64);
    let coordinator = PipelineCoordinator::new(config, opener, Box::new(transport)).unwrap();
    let stop = coordinator.stop_handle();
    let run = tokio::spawn(coordinator.run());

    let points = collect_points(&mut published, FRAMES, WAIT).await;
    stop.stop();
    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    drop(host);

    assert_eq!(points.len(), FRAMES);
    assert!(points.windows(2).all(|w| w[0].ts < w[1].ts));
    assert_eq!(report.publisher.messages_sent, 10);
    assert_eq!(report.storage.unwrap().pending, 0);
}
