//! Requesting side of the piece transfer protocol.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::codec::{self, PieceRequest};
use super::{FileDescriptor, PieceIndex, TransferError};
use crate::config::TransferConfig;

/// Transport used to pull raw piece bytes from a peer.
///
/// Implementations only move bytes; integrity checks happen in
/// [`fetch_verified_piece`]. Tests substitute in-memory fetchers here.
#[async_trait]
pub trait PieceFetcher: Send + Sync {
    /// Requests one piece and returns exactly `expected_len` bytes.
    ///
    /// # Errors
    ///
    /// - `TransferError::FileNotFound` - Peer does not share the file
    /// - `TransferError::InvalidPieceIndex` - Peer rejected the index
    /// - `TransferError::Timeout` - Connect or transfer exceeded its deadline
    /// - `TransferError::PieceTransfer` - Connection failed or data was truncated
    async fn request_piece(
        &self,
        peer: SocketAddr,
        filename: &str,
        index: PieceIndex,
        expected_len: u32,
    ) -> Result<Bytes, TransferError>;
}

/// Fetcher speaking the TCP piece protocol, one connection per piece.
#[derive(Debug, Clone)]
pub struct TcpPieceFetcher {
    connect_timeout: Duration,
    piece_timeout: Duration,
}

impl TcpPieceFetcher {
    pub fn new(connect_timeout: Duration, piece_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            piece_timeout,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.connect_timeout, config.piece_timeout)
    }

    async fn exchange(
        &self,
        peer: SocketAddr,
        request: &PieceRequest,
        expected_len: u32,
    ) -> Result<Bytes, TransferError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| TransferError::Timeout {
                index: request.index,
                peer,
                timeout: self.connect_timeout,
            })??;

        stream.write_all(&request.encode()).await?;
        stream.flush().await?;

        codec::read_piece_response(&mut stream, request, expected_len).await
    }
}

#[async_trait]
impl PieceFetcher for TcpPieceFetcher {
    async fn request_piece(
        &self,
        peer: SocketAddr,
        filename: &str,
        index: PieceIndex,
        expected_len: u32,
    ) -> Result<Bytes, TransferError> {
        let request = PieceRequest::new(filename, index);

        let result = tokio::time::timeout(
            self.piece_timeout,
            self.exchange(peer, &request, expected_len),
        )
        .await
        .map_err(|_| TransferError::Timeout {
            index,
            peer,
            timeout: self.piece_timeout,
        })?;

        result.map_err(|e| match e {
            TransferError::Io(io) => TransferError::PieceTransfer {
                index,
                peer,
                reason: io.to_string(),
            },
            other => other,
        })
    }
}

/// Fetches a piece and checks it against the descriptor's hash.
///
/// # Errors
///
/// - `TransferError::InvalidPieceIndex` - Index outside the descriptor
/// - `TransferError::PieceIntegrity` - Data does not match the expected hash
/// - Any error returned by the underlying fetcher
pub async fn fetch_verified_piece(
    fetcher: &dyn PieceFetcher,
    peer: SocketAddr,
    descriptor: &FileDescriptor,
    index: PieceIndex,
) -> Result<Bytes, TransferError> {
    let expected_len =
        descriptor
            .piece_len(index)
            .ok_or_else(|| TransferError::InvalidPieceIndex {
                filename: descriptor.name.clone(),
                index,
            })?;

    let data = fetcher
        .request_piece(peer, &descriptor.name, index, expected_len)
        .await?;

    if !descriptor.verify_piece(index, &data) {
        tracing::warn!(
            file = %descriptor.name,
            piece = %index,
            peer = %peer,
            "Piece rejected: hash mismatch"
        );
        return Err(TransferError::PieceIntegrity { index, peer });
    }

    tracing::trace!(file = %descriptor.name, piece = %index, peer = %peer, "Piece verified");
    Ok(data)
}
