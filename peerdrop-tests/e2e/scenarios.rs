//! Full workflows: tracker over HTTP, peers serving over TCP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use peerdrop_core::config::PeerdropConfig;
use peerdrop_core::download::{Candidate, DownloadJob, NoProgress};
use peerdrop_core::test_fixtures::{sample_content, spawn_peer, write_sample_file};
use peerdrop_core::tracker::{HttpTrackerClient, PeerKey, TrackerClient};
use peerdrop_core::transfer::TcpPieceFetcher;
use peerdrop_core::{DownloadScheduler, PeerNode, TrackerError};
use peerdrop_tracker::{TrackerHandle, spawn_tracker};

fn client(tracker: &TrackerHandle) -> Result<Arc<HttpTrackerClient>> {
    Ok(Arc::new(HttpTrackerClient::new(
        &tracker.local_addr().to_string(),
        Duration::from_secs(5),
    )?))
}

async fn peer(tracker: &TrackerHandle) -> Result<PeerNode> {
    Ok(spawn_peer(PeerdropConfig::for_testing(), client(tracker)?).await)
}

#[tokio::test]
async fn test_single_file_fetched_from_seeder() -> Result<()> {
    let config = PeerdropConfig::for_testing();
    let tracker = spawn_tracker(&config.tracker).await?;
    let dir = tempfile::tempdir()?;

    // 3 pieces at the 1 KiB test piece size.
    let content = sample_content(3_000, 11);
    let path = write_sample_file(&dir, "f1.bin", &content);

    let seeder = peer(&tracker).await?;
    let descriptor = seeder.share(&path).await?;
    assert_eq!(descriptor.piece_count(), 3);

    let downloader = peer(&tracker).await?;
    downloader.register().await?;

    let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let observer = move |downloaded: u32, total: u32| {
        if let Ok(mut seen) = seen.lock() {
            seen.push((downloaded, total));
        }
    };

    let output = dir.path().join("downloads");
    let reports = downloader
        .fetch_files(&["f1.bin".to_string()], &output, Arc::new(observer))
        .await?;

    assert_eq!(reports.len(), 1);
    assert_eq!(tokio::fs::read(output.join("f1.bin")).await?, content);
    assert_eq!(
        progress.lock().map(|seen| seen.last().copied()).ok().flatten(),
        Some((3, 3))
    );

    let seeder_record = tracker
        .registry()
        .peer(PeerKey::new(seeder.local_addr()))
        .expect("seeder still registered");
    assert!(seeder_record.is_idle());

    seeder.disconnect().await?;
    downloader.disconnect().await?;
    tracker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_simultaneous_requesters_get_distinct_peers() -> Result<()> {
    let config = PeerdropConfig::for_testing();
    let tracker = spawn_tracker(&config.tracker).await?;
    let dir = tempfile::tempdir()?;
    let path = write_sample_file(&dir, "f2.bin", &sample_content(2_000, 5));

    let a = peer(&tracker).await?;
    a.share(&path).await?;
    let b = peer(&tracker).await?;
    b.share(&path).await?;

    let first = client(&tracker)?;
    let second = client(&tracker)?;
    let third = client(&tracker)?;
    let files = vec!["f2.bin".to_string()];

    let (one, two) = futures::join!(
        first.file_idle_peers(9001, &files),
        second.file_idle_peers(9002, &files)
    );
    let one = one?.peers["f2.bin"];
    let two = two?.peers["f2.bin"];
    assert_ne!(one, two);
    for served in [one, two] {
        assert!(served == PeerKey::new(a.local_addr()) || served == PeerKey::new(b.local_addr()));
    }

    let error = third.file_idle_peers(9003, &files).await.unwrap_err();
    assert!(matches!(error, TrackerError::NotEnoughPeers { .. }));

    first.complete_transfer(one).await?;
    second.complete_transfer(two).await?;
    assert!(third.file_idle_peers(9003, &files).await.is_ok());

    a.shutdown().await;
    b.shutdown().await;
    tracker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_silent_peer_evicted_and_job_retries_elsewhere() -> Result<()> {
    let config = PeerdropConfig::for_testing();
    let tracker = spawn_tracker(&config.tracker).await?;
    let dir = tempfile::tempdir()?;
    let content = sample_content(4_000, 21);
    let path = write_sample_file(&dir, "f3.bin", &content);

    let alive = peer(&tracker).await?;
    let descriptor = alive.share(&path).await?;
    let silent = peer(&tracker).await?;
    silent.share(&path).await?;
    let silent_key = PeerKey::new(silent.local_addr());
    assert_eq!(tracker.registry().len(), 2);

    // Stops heartbeats and serving without telling the tracker.
    silent.shutdown().await;

    let scheduler = DownloadScheduler::new(
        Arc::new(TcpPieceFetcher::from_config(&config.transfer)),
        &config.transfer,
    );
    let job = DownloadJob::new(
        descriptor,
        vec![
            Candidate::whole(silent_key.address()),
            Candidate::whole(alive.local_addr()),
        ],
        dir.path().join("downloads").join("f3.bin"),
    );
    let report = scheduler.start(job, Arc::new(NoProgress)).wait().await?;
    assert_eq!(tokio::fs::read(&report.destination).await?, content);
    assert!(!report.served_by.contains(&silent_key.address()));

    let deadline = config.tracker.eviction_timeout + config.tracker.sweep_interval;
    tokio::time::sleep(deadline + Duration::from_millis(500)).await;

    let registry = tracker.registry();
    assert!(registry.peer(silent_key).is_none());
    assert!(registry.peer(PeerKey::new(alive.local_addr())).is_some());
    assert!(alive.heartbeats_sent() > 0);

    alive.disconnect().await?;
    tracker.close().await;
    Ok(())
}
