//! Rotating session files and the batch contract, exercised through the
//! storage actor the way the pipeline uses it.

use super::support::processed;
use imu_daq::config::{StorageConfig, StorageFormat};
use imu_daq::storage::{read_records, BatchSource, StorageCoordinator, StorageService};
use std::path::Path;

fn storage_config(dir: &Path, format: StorageFormat, max_bytes: f64) -> StorageConfig {
    StorageConfig {
        base_dir: dir.to_path_buf(),
        format,
        max_file_size_mb: max_bytes / (1024.0 * 1024.0),
        sweep_interval_s: 0,
        ..StorageConfig::default()
    }
}

/// Concatenate every part file of the session in creation order.
fn read_back(files: &[std::path::PathBuf], format: StorageFormat) -> Vec<f64> {
    files
        .iter()
        .flat_map(|file| read_records(file, format).unwrap())
        .map(|sample| sample.acc_raw.x)
        .collect()
}

fn assert_rotation_preserves_order(format: StorageFormat) {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = StorageCoordinator::new(storage_config(dir.path(), format, 4096.0)).unwrap();
    for i in 0..300 {
        storage.store(processed(i)).unwrap();
    }
    storage.close().unwrap();

    let files = storage.files();
    assert!(files.len() > 2, "expected several parts, got {}", files.len());
    let expected: Vec<f64> = (0..300).map(|i| i as f64).collect();
    assert_eq!(read_back(&files, format), expected);

    let stats = storage.stats();
    assert_eq!(stats.records_stored, 300);
    assert_eq!(stats.files_closed as usize, files.len());
}

#[test]
fn test_csv_parts_concatenate_to_input_order() {
    assert_rotation_preserves_order(StorageFormat::Csv);
}

#[test]
fn test_json_parts_concatenate_to_input_order() {
    assert_rotation_preserves_order(StorageFormat::Json);
}

#[test]
fn test_every_csv_part_starts_with_header() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage =
        StorageCoordinator::new(storage_config(dir.path(), StorageFormat::Csv, 2048.0)).unwrap();
    for i in 0..100 {
        storage.store(processed(i)).unwrap();
    }
    storage.close().unwrap();

    for file in storage.files() {
        let text = std::fs::read_to_string(&file).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("timestamp,acc_x,acc_y,acc_z"), "{}", file.display());
    }
}

#[tokio::test]
async fn test_batches_repeat_until_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator =
        StorageCoordinator::new(storage_config(dir.path(), StorageFormat::Csv, 1e6)).unwrap();
    let (handle, task) = StorageService::new(coordinator, None).spawn();

    for i in 0..10 {
        handle.store(processed(i)).await.unwrap();
    }

    let first = handle.extract_batch(4).await.unwrap();
    let again = handle.extract_batch(4).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(first.len(), 4);
    assert_eq!(first.samples[0].acc_raw.x, 0.0);

    assert_eq!(handle.acknowledge(&first).await.unwrap(), 4);
    assert_eq!(handle.pending().await.unwrap(), 6);
    let next = handle.extract_batch(100).await.unwrap();
    assert_eq!(next.first_seq, first.last_seq + 1);
    let xs: Vec<f64> = next.samples.iter().map(|s| s.acc_raw.x).collect();
    assert_eq!(xs, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);

    let stats = handle.close().await.unwrap();
    assert_eq!(stats.records_stored, 10);
    assert_eq!(task.await.unwrap().records_stored, 10);
}

#[tokio::test]
async fn test_rotation_on_request_starts_new_part() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator =
        StorageCoordinator::new(storage_config(dir.path(), StorageFormat::Json, 1e6)).unwrap();
    let (handle, task) = StorageService::new(coordinator, None).spawn();

    handle.store(processed(0)).await.unwrap();
    let closed = handle.rotate("reconnect").await.unwrap();
    assert!(closed.is_some());
    handle.store(processed(1)).await.unwrap();
    handle.close().await.unwrap();
    task.await.unwrap();

    let mut parts: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    parts.sort();
    assert_eq!(parts.len(), 2);
    assert_eq!(read_back(&parts, StorageFormat::Json), vec![0.0, 1.0]);
}
