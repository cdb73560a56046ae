//! Serving side of the piece transfer protocol.
//!
//! Each inbound connection carries exactly one request: the server resolves
//! the piece locally, streams its bytes with an explicit length and closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use super::codec::{self, PieceRequest, ResponseStatus};
use super::{SharedLibrary, TransferError};

/// Piece server bound to a shared library.
pub struct PieceServer {
    library: Arc<SharedLibrary>,
    io_timeout: Duration,
}

/// Running piece server.
///
/// Dropping the handle aborts the accept loop and every open connection.
pub struct PieceServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PieceServer {
    /// Creates a server; `io_timeout` bounds each connection's lifetime.
    pub fn new(library: Arc<SharedLibrary>, io_timeout: Duration) -> Self {
        Self {
            library,
            io_timeout,
        }
    }

    /// Binds the listener and starts accepting in a background task.
    ///
    /// # Errors
    ///
    /// - `TransferError::Io` - If the TCP listener cannot bind
    pub async fn bind(self, address: SocketAddr) -> Result<PieceServerHandle, TransferError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tracing::info!(address = %local_addr, "Piece server listening");

        let task = tokio::spawn(self.run(listener, shutdown_rx));

        Ok(PieceServerHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn run(self, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let library = self.library.clone();
                        let io_timeout = self.io_timeout;
                        connections.spawn(async move {
                            serve_connection(library, stream, remote, io_timeout).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept piece connection");
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // Dropping the set aborts connections still in progress.
        connections.abort_all();
        tracing::info!("Piece server stopped");
    }
}

impl PieceServerHandle {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, aborts open connections and waits for the loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for PieceServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    library: Arc<SharedLibrary>,
    mut stream: TcpStream,
    remote: SocketAddr,
    io_timeout: Duration,
) {
    match tokio::time::timeout(io_timeout, handle_request(&library, &mut stream)).await {
        Ok(Ok(request)) => {
            tracing::debug!(
                peer = %remote,
                file = %request.filename,
                piece = %request.index,
                "Served piece"
            );
        }
        Ok(Err(e)) => {
            tracing::debug!(peer = %remote, error = %e, "Piece request failed");
        }
        Err(_) => {
            tracing::warn!(peer = %remote, timeout = ?io_timeout, "Piece request timed out");
        }
    }
}

async fn handle_request(
    library: &SharedLibrary,
    stream: &mut TcpStream,
) -> Result<PieceRequest, TransferError> {
    let request = PieceRequest::read_from(stream).await?;

    match library.read_piece(&request.filename, request.index).await {
        Ok(data) => codec::write_piece(stream, &data).await?,
        Err(TransferError::FileNotFound { .. }) => {
            codec::write_error(stream, ResponseStatus::FileNotFound).await?;
        }
        Err(TransferError::InvalidPieceIndex { .. }) => {
            codec::write_error(stream, ResponseStatus::InvalidPieceIndex).await?;
        }
        // Local read failures close the connection without a payload.
        Err(e) => return Err(e),
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::transfer::PieceIndex;

    async fn start_server(content: &[u8]) -> (tempfile::TempDir, PieceServerHandle) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1.bin");
        tokio::fs::write(&path, content).await.unwrap();

        let library = Arc::new(SharedLibrary::new());
        library.share_file(&path, 4).await.unwrap();

        let handle = PieceServer::new(library, Duration::from_secs(5))
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        (dir, handle)
    }

    async fn raw_exchange(address: SocketAddr, request: &PieceRequest) -> Vec<u8> {
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(&request.encode()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_exact_piece_then_closes() {
        let (_dir, handle) = start_server(b"abcdefghij").await;

        let response = raw_exchange(
            handle.local_addr(),
            &PieceRequest::new("f1.bin", PieceIndex::new(2)),
        )
        .await;

        assert_eq!(response[0], ResponseStatus::Piece as u8);
        assert_eq!(&response[1..5], &2u32.to_be_bytes());
        assert_eq!(&response[5..], b"ij");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reports_error_codes() {
        let (_dir, handle) = start_server(b"abcdefghij").await;

        let missing = raw_exchange(
            handle.local_addr(),
            &PieceRequest::new("other.bin", PieceIndex::new(0)),
        )
        .await;
        assert_eq!(missing, vec![ResponseStatus::FileNotFound as u8]);

        let out_of_range = raw_exchange(
            handle.local_addr(),
            &PieceRequest::new("f1.bin", PieceIndex::new(3)),
        )
        .await;
        assert_eq!(out_of_range, vec![ResponseStatus::InvalidPieceIndex as u8]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_connections() {
        let (_dir, handle) = start_server(b"abc").await;
        let address = handle.local_addr();
        handle.shutdown().await;

        assert!(TcpStream::connect(address).await.is_err());
    }
}
