use std::io;
use std::path::PathBuf;
use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use crate::scan::args::OutputTarget;

const CHUNK_SIZE: usize = 8 * 1024;

/// Fans one producer byte stream out to the decoder and an optional report file.
///
/// Every chunk goes to the decoder before the file, so the file never holds
/// bytes the decoder has not been offered. A sink that fails is detached and
/// the remaining sink keeps draining the producer.
pub struct TeeTransport {
    decoder: Option<DuplexStream>,
    file: Option<FileSink>,
    bytes: u64,
}

struct FileSink {
    path: PathBuf,
    file: File,
    error: Option<io::Error>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeeStats {
    pub bytes: u64,
    pub persisted: Option<PathBuf>,
}

impl TeeTransport {
    /// Open the report file (if any) and the decoder pipe.
    ///
    /// Returns the tee and the read end the decoder consumes. Failing to open
    /// the report file is fatal; nothing has been read from the producer yet.
    pub async fn open(target: Option<&OutputTarget>, capacity: usize) -> Result<(Self, DuplexStream)> {
        let file = match target {
            Some(target) => Some(FileSink::open(target).await?),
            None => None,
        };

        let (write, read) = tokio::io::duplex(capacity.max(1));
        let tee = Self {
            decoder: Some(write),
            file,
            bytes: 0,
        };
        Ok((tee, read))
    }

    /// Copy `producer` into both sinks until it reaches end of input.
    pub async fn pump<R: AsyncRead + Unpin>(&mut self, mut producer: R) -> io::Result<u64> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = producer.read(&mut buf).await?;
            if n == 0 {
                return Ok(self.bytes);
            }
            self.write(&buf[..n]).await;
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;

        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.write_all(chunk).await {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    tracing::debug!("Decoder stopped reading, dropping its copy of the stream");
                } else {
                    tracing::warn!("Failed to feed decoder: {e}");
                }
                self.decoder = None;
            }
        }

        if let Some(sink) = self.file.as_mut() {
            sink.write(chunk).await;
        }
    }

    /// Signal end of input to the decoder and flush the report file.
    pub async fn close(mut self) -> Result<TeeStats> {
        if let Some(mut decoder) = self.decoder.take() {
            // The reader may already be gone; dropping still delivers EOF.
            let _ = decoder.shutdown().await;
        }

        let persisted = match self.file.take() {
            Some(sink) => Some(sink.finish().await?),
            None => None,
        };

        Ok(TeeStats {
            bytes: self.bytes,
            persisted,
        })
    }
}

impl FileSink {
    async fn open(target: &OutputTarget) -> Result<Self> {
        let path = target.path().to_path_buf();
        let file = match target {
            OutputTarget::Fresh(_) => File::create(&path)
                .await
                .with_context(|| format!("opening {} for writing", path.display()))?,
            OutputTarget::Resume(_) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("opening {} for appending", path.display()))?,
        };

        tracing::debug!(path = %path.display(), "Teeing report to file");
        Ok(Self { path, file, error: None })
    }

    async fn write(&mut self, chunk: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.file.write_all(chunk).await {
            tracing::debug!(path = %self.path.display(), "Report file write failed, detaching: {e}");
            self.error = Some(e);
        }
    }

    async fn finish(mut self) -> Result<PathBuf> {
        if let Some(e) = self.error.take() {
            return Err(e).with_context(|| format!("writing {}", self.path.display()));
        }
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(self.path)
    }
}
