//! Batch publishing across a broker outage, with storage as the batch source.

use super::support::processed;
use imu_daq::config::{PayloadEncoding, PublisherConfig, StorageConfig, StorageFormat};
use imu_daq::publisher::{create_publisher, ChannelTransport, Envelope, PayloadCodec, PublishOutcome};
use imu_daq::storage::{BatchSource, StorageCoordinator, StorageService};
use std::sync::Arc;

fn batch_config() -> PublisherConfig {
    PublisherConfig {
        strategy: "batch".to_string(),
        batch_size: 100,
        compress: true,
        ..PublisherConfig::default()
    }
}

#[tokio::test]
async fn test_outage_loses_nothing_and_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageCoordinator::new(StorageConfig {
        base_dir: dir.path().to_path_buf(),
        format: StorageFormat::Json,
        ..StorageConfig::default()
    })
    .unwrap();
    let (storage, storage_task) = StorageService::new(storage, None).spawn();

    let (transport, mut published, control) = ChannelTransport::new(64);
    let mut publisher = create_publisher(
        &batch_config(),
        Box::new(transport),
        Arc::new(storage.clone()),
    )
    .unwrap();
    publisher.connect().await.unwrap();

    control.set_reachable(false);
    for i in 0..250 {
        storage.store(processed(i)).await.unwrap();
        let outcome = publisher.publish(&[processed(i)]).await;
        if i >= 99 {
            assert!(matches!(outcome, PublishOutcome::Transient(_)), "sample {i}: {outcome:?}");
        }
    }
    assert!(published.try_recv().is_err());
    assert_eq!(storage.pending().await.unwrap(), 250);
    assert!(!publisher.is_connected());

    control.set_reachable(true);
    publisher.connect().await.unwrap();
    assert_eq!(publisher.flush().await, PublishOutcome::Delivered(250));
    assert_eq!(storage.pending().await.unwrap(), 0);

    let codec = PayloadCodec::new(PayloadEncoding::Json, true);
    let mut sizes = Vec::new();
    let mut xs = Vec::new();
    while let Ok(message) = published.try_recv() {
        let envelope: Envelope = codec.decode(&message.payload).unwrap();
        assert_eq!(envelope.metadata.strategy, "batch");
        let points = envelope.data_points.unwrap();
        sizes.push(points.len());
        xs.extend(points.iter().map(|p| p.acc_x_filtered));
    }
    assert_eq!(sizes, vec![100, 100, 50]);
    let expected: Vec<f64> = (0..250).map(|i| i as f64).collect();
    assert_eq!(xs, expected);

    let stats = publisher.stats();
    assert_eq!(stats.samples_sent, 250);
    assert_eq!(stats.samples_dropped, 0);
    assert!(stats.transient_failures > 0);

    publisher.close().await.unwrap();
    storage.close().await.unwrap();
    storage_task.await.unwrap();
}

#[tokio::test]
async fn test_realtime_drops_only_after_retries() {
    let config = PublisherConfig {
        retry_limit: 3,
        ..PublisherConfig::default()
    };
    let source = Arc::new(imu_daq::storage::MemoryBatchSource::new(16));
    let (transport, mut published, control) = ChannelTransport::new(16);
    let mut publisher = create_publisher(&config, Box::new(transport), source).unwrap();
    publisher.connect().await.unwrap();

    control.fail_next(2);
    assert_eq!(publisher.publish(&[processed(0)]).await, PublishOutcome::Delivered(1));
    assert_eq!(published.try_recv().unwrap().id, 1);

    control.fail_next(3);
    assert!(matches!(
        publisher.publish(&[processed(1)]).await,
        PublishOutcome::Transient(_)
    ));
    assert!(published.try_recv().is_err());
    assert_eq!(publisher.stats().samples_dropped, 1);
}
