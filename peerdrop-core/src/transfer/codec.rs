//! Data-plane wire format.
//!
//! Request (requester → server), one per connection:
//!
//! ```text
//! <frame len: u32><id=1: u8><piece index: u32><name len: u16><name: utf-8>
//! ```
//!
//! Response (server → requester), followed by connection close:
//!
//! ```text
//! <status=0: u8><payload len: u32><payload>     piece data
//! <status=1: u8>                                file not found
//! <status=2: u8>                                invalid piece index
//! ```
//!
//! All integers are big-endian. The payload length is explicit so a
//! truncated transfer is never mistaken for a complete piece.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{PieceIndex, TransferError, is_valid_filename};

/// Message id of a piece request.
const GET_PIECE_ID: u8 = 1;

/// Longest filename accepted on the wire.
pub const MAX_FILENAME_LEN: usize = 1024;

/// Largest piece payload a requester will accept.
pub const MAX_PIECE_LEN: u32 = 64 * 1024 * 1024;

/// Fixed part of a request frame: id + piece index + name length.
const REQUEST_HEADER_LEN: usize = 1 + 4 + 2;

/// Request for a single piece of a named file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceRequest {
    pub filename: String,
    pub index: PieceIndex,
}

/// First byte of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Piece = 0,
    FileNotFound = 1,
    InvalidPieceIndex = 2,
}

impl ResponseStatus {
    fn from_byte(byte: u8) -> Result<Self, TransferError> {
        match byte {
            0 => Ok(Self::Piece),
            1 => Ok(Self::FileNotFound),
            2 => Ok(Self::InvalidPieceIndex),
            other => Err(TransferError::Protocol {
                message: format!("unknown response status {other}"),
            }),
        }
    }
}

impl PieceRequest {
    /// Creates a request for one piece.
    pub fn new(filename: impl Into<String>, index: PieceIndex) -> Self {
        Self {
            filename: filename.into(),
            index,
        }
    }

    /// Serializes the request into a length-prefixed frame.
    pub fn encode(&self) -> Bytes {
        let name = self.filename.as_bytes();
        let frame_len = REQUEST_HEADER_LEN + name.len();

        let mut buf = BytesMut::with_capacity(4 + frame_len);
        buf.put_u32(frame_len as u32);
        buf.put_u8(GET_PIECE_ID);
        buf.put_u32(self.index.as_u32());
        buf.put_u16(name.len() as u16);
        buf.extend_from_slice(name);
        buf.freeze()
    }

    /// Parses a request frame body (without the length prefix).
    ///
    /// # Errors
    /// - `TransferError::Protocol` - Unknown message id, truncated frame or
    ///   an unusable filename
    pub fn decode(mut frame: &[u8]) -> Result<Self, TransferError> {
        if frame.len() < REQUEST_HEADER_LEN {
            return Err(TransferError::Protocol {
                message: "request frame too short".to_string(),
            });
        }

        let id = frame.get_u8();
        if id != GET_PIECE_ID {
            return Err(TransferError::Protocol {
                message: format!("unknown request id {id}"),
            });
        }

        let index = PieceIndex::new(frame.get_u32());
        let name_len = frame.get_u16() as usize;
        if frame.remaining() != name_len {
            return Err(TransferError::Protocol {
                message: format!(
                    "filename length {name_len} does not match frame ({} bytes left)",
                    frame.remaining()
                ),
            });
        }

        let filename = std::str::from_utf8(frame)
            .map_err(|_| TransferError::Protocol {
                message: "filename is not valid UTF-8".to_string(),
            })?
            .to_string();

        if !is_valid_filename(&filename) {
            return Err(TransferError::Protocol {
                message: format!("invalid filename {filename:?}"),
            });
        }

        Ok(Self { filename, index })
    }

    /// Reads one length-prefixed request from a stream.
    ///
    /// # Errors
    /// - `TransferError::Io` - Stream closed before a full frame arrived
    /// - `TransferError::Protocol` - Oversized or malformed frame
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, TransferError> {
        let frame_len = reader.read_u32().await? as usize;
        if frame_len > REQUEST_HEADER_LEN + MAX_FILENAME_LEN {
            return Err(TransferError::Protocol {
                message: format!("request frame of {frame_len} bytes exceeds limit"),
            });
        }

        let mut frame = vec![0u8; frame_len];
        reader.read_exact(&mut frame).await?;
        Self::decode(&frame)
    }
}

/// Writes a successful piece response.
///
/// # Errors
/// - `TransferError::Io` - Connection failed mid-write
pub async fn write_piece<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), TransferError> {
    let mut header = BytesMut::with_capacity(5);
    header.put_u8(ResponseStatus::Piece as u8);
    header.put_u32(data.len() as u32);

    writer.write_all(&header).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes an error response.
///
/// # Errors
/// - `TransferError::Io` - Connection failed mid-write
pub async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: ResponseStatus,
) -> Result<(), TransferError> {
    writer.write_all(&[status as u8]).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a piece response, requiring exactly `expected_len` payload bytes.
///
/// # Errors
/// - `TransferError::FileNotFound` / `TransferError::InvalidPieceIndex` -
///   Server reported the matching error code
/// - `TransferError::Protocol` - Declared length differs from the expected one
/// - `TransferError::Io` - Connection closed before the payload completed
pub async fn read_piece_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    request: &PieceRequest,
    expected_len: u32,
) -> Result<Bytes, TransferError> {
    match ResponseStatus::from_byte(reader.read_u8().await?)? {
        ResponseStatus::Piece => {}
        ResponseStatus::FileNotFound => {
            return Err(TransferError::FileNotFound {
                filename: request.filename.clone(),
            });
        }
        ResponseStatus::InvalidPieceIndex => {
            return Err(TransferError::InvalidPieceIndex {
                filename: request.filename.clone(),
                index: request.index,
            });
        }
    }

    let declared_len = reader.read_u32().await?;
    if declared_len != expected_len || declared_len > MAX_PIECE_LEN {
        return Err(TransferError::Protocol {
            message: format!(
                "piece {} declared {declared_len} bytes, expected {expected_len}",
                request.index
            ),
        });
    }

    let mut payload = BytesMut::zeroed(declared_len as usize);
    reader.read_exact(&mut payload).await?;
    Ok(payload.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_layout() {
        let request = PieceRequest::new("ab.txt", PieceIndex::new(7));
        let frame = request.encode();

        assert_eq!(&frame[..4], &13u32.to_be_bytes()); // 1 + 4 + 2 + 6
        assert_eq!(frame[4], GET_PIECE_ID);
        assert_eq!(&frame[5..9], &7u32.to_be_bytes());
        assert_eq!(&frame[9..11], &6u16.to_be_bytes());
        assert_eq!(&frame[11..], b"ab.txt");
        assert_eq!(PieceRequest::decode(&frame[4..]).unwrap(), request);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(PieceRequest::decode(&[1, 0, 0]).is_err());

        let mut wrong_id = PieceRequest::new("a", PieceIndex::new(0)).encode().to_vec();
        wrong_id[4] = 9;
        assert!(PieceRequest::decode(&wrong_id[4..]).is_err());

        let traversal = PieceRequest::new("../secret", PieceIndex::new(0)).encode();
        assert!(PieceRequest::decode(&traversal[4..]).is_err());
    }

    #[tokio::test]
    async fn test_oversized_request_frame_is_refused() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut reader = frame.as_slice();

        assert!(matches!(
            PieceRequest::read_from(&mut reader).await,
            Err(TransferError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_piece_response_exact_length() {
        let request = PieceRequest::new("f", PieceIndex::new(1));
        let mut wire = Vec::new();
        write_piece(&mut wire, b"0123456789").await.unwrap();

        let payload = read_piece_response(&mut wire.as_slice(), &request, 10)
            .await
            .unwrap();
        assert_eq!(&payload[..], b"0123456789");

        let mismatch = read_piece_response(&mut wire.as_slice(), &request, 11).await;
        assert!(matches!(mismatch, Err(TransferError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let request = PieceRequest::new("f", PieceIndex::new(0));
        let mut wire = Vec::new();
        write_piece(&mut wire, b"0123456789").await.unwrap();
        wire.truncate(wire.len() - 3);

        let result = read_piece_response(&mut wire.as_slice(), &request, 10).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn test_error_statuses_map_to_errors() {
        let request = PieceRequest::new("missing.bin", PieceIndex::new(4));

        let mut wire = Vec::new();
        write_error(&mut wire, ResponseStatus::FileNotFound)
            .await
            .unwrap();
        assert!(matches!(
            read_piece_response(&mut wire.as_slice(), &request, 1).await,
            Err(TransferError::FileNotFound { .. })
        ));

        let mut wire = Vec::new();
        write_error(&mut wire, ResponseStatus::InvalidPieceIndex)
            .await
            .unwrap();
        assert!(matches!(
            read_piece_response(&mut wire.as_slice(), &request, 1).await,
            Err(TransferError::InvalidPieceIndex { .. })
        ));
    }
}
