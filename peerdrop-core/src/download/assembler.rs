//! Writes verified pieces into place and publishes the finished file.
//!
//! Pieces land at their offsets in a sibling temp file (`<name><suffix>`),
//! which is renamed over the destination only once every piece is present.
//! A reader of the destination path therefore never sees a partial file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::DownloadError;
use crate::transfer::{FileDescriptor, PieceIndex};

/// Reassembles one file from verified pieces.
#[derive(Debug)]
pub struct PieceAssembler {
    destination: PathBuf,
    temp_path: PathBuf,
    file: File,
    piece_size: u64,
    written: Vec<bool>,
    remaining: u32,
}

impl PieceAssembler {
    /// Creates the temp file sized to the final length.
    ///
    /// # Errors
    /// - `DownloadError::Storage` - Temp file cannot be created
    pub async fn create(
        descriptor: &FileDescriptor,
        destination: &Path,
        temp_suffix: &str,
    ) -> Result<Self, DownloadError> {
        let mut temp_name = destination.as_os_str().to_owned();
        temp_name.push(temp_suffix);
        let temp_path = PathBuf::from(temp_name);

        let storage_error = |source| DownloadError::Storage {
            path: temp_path.clone(),
            source,
        };

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(storage_error)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(storage_error)?;
        file.set_len(descriptor.total_size)
            .await
            .map_err(storage_error)?;

        Ok(Self {
            destination: destination.to_path_buf(),
            temp_path,
            file,
            piece_size: u64::from(descriptor.piece_size),
            written: vec![false; descriptor.piece_count() as usize],
            remaining: descriptor.piece_count(),
        })
    }

    /// Writes one verified piece at its offset. Rewriting a piece is a no-op.
    ///
    /// # Errors
    /// - `DownloadError::Storage` - Write failed
    pub async fn write_piece(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), DownloadError> {
        let slot = index.as_u32() as usize;
        if self.written.get(slot).copied().unwrap_or(true) {
            return Ok(());
        }

        let offset = u64::from(index.as_u32()) * self.piece_size;
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| self.storage_error(source))?;
        self.file
            .write_all(data)
            .await
            .map_err(|source| self.storage_error(source))?;

        self.written[slot] = true;
        self.remaining -= 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Flushes the temp file and renames it to the destination.
    ///
    /// # Errors
    /// - `DownloadError::Storage` - Flush or rename failed
    pub async fn finish(mut self) -> Result<PathBuf, DownloadError> {
        self.file
            .flush()
            .await
            .map_err(|source| self.storage_error(source))?;
        self.file
            .sync_all()
            .await
            .map_err(|source| self.storage_error(source))?;
        drop(self.file);

        tokio::fs::rename(&self.temp_path, &self.destination)
            .await
            .map_err(|source| DownloadError::Storage {
                path: self.destination.clone(),
                source,
            })?;
        Ok(self.destination)
    }

    /// Removes the temp file after a failed or cancelled job.
    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            tracing::debug!(path = %self.temp_path.display(), error = %e, "Failed to remove temp file");
        }
    }

    fn storage_error(&self, source: std::io::Error) -> DownloadError {
        DownloadError::Storage {
            path: self.temp_path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_out_of_order_pieces_reassemble_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..2600u32).map(|i| (i * 7 % 256) as u8).collect();
        let descriptor = FileDescriptor::from_bytes("out.bin", &content, 1000).unwrap();
        let destination = dir.path().join("out.bin");

        let mut assembler = PieceAssembler::create(&descriptor, &destination, ".part")
            .await
            .unwrap();
        assert!(assembler.temp_path().ends_with("out.bin.part"));

        for index in [2u32, 0, 1] {
            let range = descriptor.piece_range(PieceIndex::new(index)).unwrap();
            assembler
                .write_piece(
                    PieceIndex::new(index),
                    &content[range.start as usize..range.end as usize],
                )
                .await
                .unwrap();
            assert!(!destination.exists());
        }
        assert!(assembler.is_complete());

        let path = assembler.finish().await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), content);
        assert!(!dir.path().join("out.bin.part").exists());
    }

    #[tokio::test]
    async fn test_discard_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::from_bytes("x.bin", b"abcdef", 4).unwrap();
        let destination = dir.path().join("nested").join("x.bin");

        let assembler = PieceAssembler::create(&descriptor, &destination, ".part")
            .await
            .unwrap();
        let temp = assembler.temp_path().to_path_buf();
        assert!(temp.exists());

        assembler.discard().await;
        assert!(!temp.exists());
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::from_bytes("empty.bin", b"", 4).unwrap();
        let destination = dir.path().join("empty.bin");

        let assembler = PieceAssembler::create(&descriptor, &destination, ".part")
            .await
            .unwrap();
        assert!(assembler.is_complete());
        assembler.finish().await.unwrap();
        assert_eq!(tokio::fs::metadata(&destination).await.unwrap().len(), 0);
    }
}
