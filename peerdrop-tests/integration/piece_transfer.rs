//! Download scheduler driving the TCP piece protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use peerdrop_core::config::PeerdropConfig;
use peerdrop_core::download::{Candidate, DownloadJob, NoProgress};
use peerdrop_core::test_fixtures::{sample_content, write_sample_file};
use peerdrop_core::transfer::codec::{self, PieceRequest};
use peerdrop_core::transfer::{PieceServer, PieceServerHandle, SharedLibrary, TcpPieceFetcher};
use peerdrop_core::{DownloadError, DownloadScheduler, FileDescriptor};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

async fn serve(
    path: &std::path::Path,
    piece_size: u32,
) -> Result<(PieceServerHandle, Arc<FileDescriptor>)> {
    let library = Arc::new(SharedLibrary::new());
    let descriptor = library.share_file(path, piece_size).await?;
    let server = PieceServer::new(library, std::time::Duration::from_secs(5))
        .bind("127.0.0.1:0".parse()?)
        .await?;
    Ok((server, descriptor))
}

/// Peer answering every request with well-formed but wrong bytes.
async fn spawn_lying_peer(served: Arc<AtomicUsize>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let Ok(request) = PieceRequest::read_from(&mut stream).await else {
                continue;
            };
            served.fetch_add(1, Ordering::SeqCst);
            // Pieces in these tests are at most 1000 bytes.
            let garbage = vec![0x5A; 1000];
            let len = if request.index.as_u32() == 2 { 500 } else { 1000 };
            let _ = codec::write_piece(&mut stream, &garbage[..len]).await;
        }
    });
    Ok((address, task))
}

fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn scheduler(concurrency: usize) -> DownloadScheduler {
    let mut config = PeerdropConfig::for_testing().transfer;
    config.fetch_concurrency = concurrency;
    DownloadScheduler::new(Arc::new(TcpPieceFetcher::from_config(&config)), &config)
}

#[tokio::test]
async fn test_parallel_download_from_two_servers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let content = sample_content(9_500, 3);
    let path = write_sample_file(&dir, "f1.bin", &content);

    let (first, descriptor) = serve(&path, 1000).await?;
    let (second, _) = serve(&path, 1000).await?;

    let job = DownloadJob::new(
        descriptor,
        vec![
            Candidate::whole(first.local_addr()),
            Candidate::whole(second.local_addr()),
        ],
        dir.path().join("out").join("f1.bin"),
    );
    let report = scheduler(4).start(job, Arc::new(NoProgress)).wait().await?;

    assert_eq!(report.pieces, 10);
    assert_eq!(tokio::fs::read(&report.destination).await?, content);
    assert_eq!(report.served_by.len(), 2);

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lying_and_dead_peers_are_routed_around() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let content = sample_content(2_500, 9);
    let path = write_sample_file(&dir, "f1.bin", &content);

    let (honest, descriptor) = serve(&path, 1000).await?;
    let lies = Arc::new(AtomicUsize::new(0));
    let (liar, liar_task) = spawn_lying_peer(Arc::clone(&lies)).await?;

    let job = DownloadJob::new(
        descriptor,
        vec![
            Candidate::whole(liar),
            Candidate::whole(dead_address()),
            Candidate::whole(honest.local_addr()),
        ],
        dir.path().join("out").join("f1.bin"),
    );
    let report = scheduler(2).start(job, Arc::new(NoProgress)).wait().await?;

    assert_eq!(tokio::fs::read(&report.destination).await?, content);
    assert_eq!(report.served_by.len(), 1);
    assert!(report.served_by.contains(&honest.local_addr()));
    assert!(lies.load(Ordering::SeqCst) > 0);

    liar_task.abort();
    honest.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_only_lying_peer_fails_with_incomplete_transfer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let content = sample_content(2_500, 1);
    let descriptor = Arc::new(FileDescriptor::from_bytes("f1.bin", &content, 1000)?);
    let lies = Arc::new(AtomicUsize::new(0));
    let (liar, liar_task) = spawn_lying_peer(Arc::clone(&lies)).await?;

    let destination = dir.path().join("f1.bin");
    let job = DownloadJob::new(descriptor, vec![Candidate::whole(liar)], destination.clone());
    let error = scheduler(1)
        .start(job, Arc::new(NoProgress))
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(error, DownloadError::IncompleteTransfer { .. }));
    assert!(!destination.exists());
    liar_task.abort();
    Ok(())
}
