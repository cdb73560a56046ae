//! HTTP tracker and client talking over loopback.

use std::time::Duration;

use anyhow::Result;
use peerdrop_core::config::PeerdropConfig;
use peerdrop_core::tracker::{HttpTrackerClient, PeerKey, PeerStatus, TrackerClient};
use peerdrop_core::{FileDescriptor, TrackerError};
use peerdrop_tracker::{TrackerHandle, spawn_tracker};

async fn start_tracker() -> Result<(TrackerHandle, HttpTrackerClient)> {
    let config = PeerdropConfig::for_testing();
    let tracker = spawn_tracker(&config.tracker).await?;
    let client = HttpTrackerClient::new(
        &tracker.local_addr().to_string(),
        Duration::from_secs(5),
    )?;
    Ok((tracker, client))
}

#[tokio::test]
async fn test_registration_lifecycle_over_http() -> Result<()> {
    let (tracker, client) = start_tracker().await?;

    client
        .register(7001, &["f1.bin".to_string()], &[3000])
        .await?;
    client.heartbeat(7001).await?;

    let peers = client.peers().await?;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, PeerKey::new("127.0.0.1:7001".parse()?));
    assert_eq!(peers[0].status, PeerStatus::Idle);
    assert_eq!(peers[0].files, vec!["f1.bin".to_string()]);

    let files = client.files().await?;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "f1.bin");
    assert_eq!(files[0].size, 3000);
    assert_eq!(files[0].holders, 1);

    client.disconnect(7001).await?;
    assert!(tracker.registry().is_empty());

    tracker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_errors_keep_their_kind_across_http() -> Result<()> {
    let (tracker, client) = start_tracker().await?;

    let error = client.heartbeat(7002).await.unwrap_err();
    assert!(matches!(
        error,
        TrackerError::NotRegistered { peer } if peer.address().port() == 7002
    ));

    let error = client
        .register(7002, &["a".to_string(), "b".to_string()], &[1])
        .await
        .unwrap_err();
    assert!(matches!(error, TrackerError::InvalidRegistration { .. }));

    let error = client.descriptor("missing.bin").await.unwrap_err();
    assert!(matches!(
        error,
        TrackerError::UnknownFile { ref filename } if filename == "missing.bin"
    ));

    let error = client
        .file_idle_peers(7002, &["missing.bin".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        TrackerError::NotEnoughPeers {
            requested: 1,
            matched: 0
        }
    ));

    tracker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_descriptor_round_trip_and_conflict() -> Result<()> {
    let (tracker, client) = start_tracker().await?;
    let descriptor = FileDescriptor::from_bytes("f1.bin", b"some shared content", 8)?
        .with_tracker_address(client.tracker_url());

    assert!(client.publish_descriptor(&descriptor).await?);
    assert!(!client.publish_descriptor(&descriptor).await?);

    let fetched = client.descriptor("f1.bin").await?;
    assert_eq!(fetched.piece_hashes, descriptor.piece_hashes);
    assert_eq!(fetched.total_size, descriptor.total_size);

    let json = serde_json::to_value(&fetched)?;
    assert_eq!(json["filename"], "f1.bin");
    assert_eq!(json["pieceSize"], 8);

    let conflicting = FileDescriptor::from_bytes("f1.bin", b"different content!!", 8)?;
    let error = client.publish_descriptor(&conflicting).await.unwrap_err();
    assert!(matches!(error, TrackerError::DescriptorConflict { .. }));

    tracker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_request_file_and_completion_over_http() -> Result<()> {
    let (tracker, client) = start_tracker().await?;
    client
        .register(7003, &["f1.bin".to_string()], &[10])
        .await?;
    let target = PeerKey::new("127.0.0.1:7003".parse()?);

    assert_eq!(client.request_file(target, "f1.bin").await?, target);
    assert!(matches!(
        client.request_file(target, "f1.bin").await,
        Err(TrackerError::PeerBusy { .. })
    ));

    client.complete_transfer(target).await?;
    assert!(tracker.registry().peer(target).is_some_and(|record| record.is_idle()));

    tracker.close().await;
    Ok(())
}
