//! Classifying and writing capture files.

use crate::error::{SyncError, SyncResult};
use datasync_protocol::capture::{self, PREFIX_LEN};
use datasync_protocol::{CaptureMetadata, ProtocolError};
use std::io::{self, SeekFrom};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt};

/// What kind of file an upload is reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// A capture file; the reader is positioned at the start of its data section.
    Structured(CaptureMetadata),
    /// Raw bytes; the reader is positioned at the start of the file.
    Arbitrary,
}

/// Inspects the head of `reader` and positions it at the first data byte.
///
/// Files that begin with the capture magic but carry a damaged header are an
/// error, never silently treated as arbitrary.
pub async fn classify<R>(reader: &mut R) -> SyncResult<FileKind>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    reader.seek(SeekFrom::Start(0)).await?;

    let mut prefix = [0u8; PREFIX_LEN];
    let filled = read_up_to(reader, &mut prefix).await?;
    if !capture::has_magic(&prefix[..filled]) {
        reader.seek(SeekFrom::Start(0)).await?;
        return Ok(FileKind::Arbitrary);
    }
    if filled < PREFIX_LEN {
        return Err(ProtocolError::invalid_header("truncated prefix").into());
    }

    let len = match capture::parse_prefix(&prefix)? {
        Some(len) => len as usize,
        None => {
            reader.seek(SeekFrom::Start(0)).await?;
            return Ok(FileKind::Arbitrary);
        }
    };

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SyncError::from(ProtocolError::invalid_header("truncated metadata"))
        } else {
            SyncError::from(e)
        }
    })?;

    Ok(FileKind::Structured(capture::decode_metadata(&body)?))
}

/// Reads until `buf` is full or the reader hits EOF. Returns bytes read.
pub(crate) async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Writes a capture file: header first, then data appended in order.
#[derive(Debug)]
pub struct CaptureWriter {
    file: File,
    data_len: u64,
}

impl CaptureWriter {
    /// Creates `path` and writes the header for `metadata`.
    pub async fn create(path: &Path, metadata: &CaptureMetadata) -> SyncResult<Self> {
        let header = capture::encode_header(metadata)?;
        let mut file = File::create(path).await?;
        file.write_all(&header).await?;
        Ok(Self { file, data_len: 0 })
    }

    /// Appends data bytes.
    pub async fn write(&mut self, data: &[u8]) -> SyncResult<()> {
        self.file.write_all(data).await?;
        self.data_len += data.len() as u64;
        Ok(())
    }

    /// Number of data bytes written so far.
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Flushes and syncs the file to disk.
    pub async fn finish(mut self) -> SyncResult<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.data_len)
    }
}
