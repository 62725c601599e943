//! Destinations for the encoded archive stream.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, StoreError};
use crate::location::Destination;
use crate::store::{CompletedPart, ObjectStore};

/// S3 rejects multipart uploads with more parts than this
pub const MAX_PARTS: usize = 10_000;

const READ_CHUNK: usize = 64 * 1024;

/// Counters reported when the destination is committed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Archive bytes written to the destination
    pub bytes: u64,
    /// Multipart upload parts sent (0 for local files)
    pub parts: u64,
}

/// Consumer of the archive byte stream
pub(crate) enum Sink {
    Local(LocalSink),
    Remote(RemoteSink),
}

impl Sink {
    /// Open the destination before any data flows.
    ///
    /// Local files are created (or truncated) here; remote destinations start
    /// their multipart upload here.
    pub(crate) async fn open(
        destination: &Destination,
        store: Arc<dyn ObjectStore>,
        part_size: usize,
    ) -> Result<Self> {
        match destination {
            Destination::Local(path) => Ok(Sink::Local(LocalSink::create(path.clone()).await?)),
            Destination::Remote { bucket, key } => Ok(Sink::Remote(
                RemoteSink::start(store, bucket.clone(), key.clone(), part_size).await?,
            )),
        }
    }

    /// Copy the stream into the destination and commit it.
    ///
    /// The destination is committed only when the stream ends and the run is
    /// not cancelled; otherwise the partial file is removed or the upload aborted.
    pub(crate) async fn drain<R>(
        self,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<SinkStats>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Sink::Local(sink) => sink.drain(reader, cancel).await,
            Sink::Remote(sink) => sink.drain(reader, cancel).await,
        }
    }
}

/// Writes the archive to a file on disk
pub(crate) struct LocalSink {
    path: PathBuf,
    file: File,
}

impl LocalSink {
    async fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).await.map_err(|source| Error::LocalIo {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "destination file opened");
        Ok(Self { path, file })
    }

    async fn drain<R>(mut self, reader: &mut R, cancel: &CancellationToken) -> Result<SinkStats>
    where
        R: AsyncRead + Unpin,
    {
        let copied = self.copy(reader, cancel).await;
        match copied {
            Ok(bytes) => {
                info!(path = %self.path.display(), bytes, "archive written");
                Ok(SinkStats { bytes, parts: 0 })
            }
            Err(e) => {
                self.discard().await;
                Err(e)
            }
        }
    }

    async fn copy<R>(&mut self, reader: &mut R, cancel: &CancellationToken) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0u64;
        loop {
            let n = read_or_cancel(reader, &mut buf, cancel).await?;
            if n == 0 {
                break;
            }
            self.file
                .write_all(&buf[..n])
                .await
                .map_err(|source| self.io_error(source))?;
            total += n as u64;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.file.flush().await.map_err(|source| self.io_error(source))?;
        self.file
            .sync_all()
            .await
            .map_err(|source| self.io_error(source))?;
        Ok(total)
    }

    async fn discard(self) {
        let Self { path, file } = self;
        drop(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed partial archive"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial archive"),
        }
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::LocalIo {
            path: self.path.clone(),
            source,
        }
    }
}

/// Streams the archive into a multipart upload
pub(crate) struct RemoteSink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    upload_id: String,
    part_size: usize,
}

impl RemoteSink {
    async fn start(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        key: String,
        part_size: usize,
    ) -> Result<Self> {
        let upload_id = store
            .create_multipart_upload(&bucket, &key)
            .await
            .map_err(|source| Error::Upload {
                bucket: bucket.clone(),
                key: key.clone(),
                source,
            })?;
        debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "multipart upload started");
        Ok(Self {
            store,
            bucket,
            key,
            upload_id,
            part_size,
        })
    }

    async fn drain<R>(self, reader: &mut R, cancel: &CancellationToken) -> Result<SinkStats>
    where
        R: AsyncRead + Unpin,
    {
        let uploaded = self.upload(reader, cancel).await;
        match uploaded {
            Ok(stats) => {
                info!(
                    bucket = %self.bucket,
                    key = %self.key,
                    bytes = stats.bytes,
                    parts = stats.parts,
                    "archive uploaded"
                );
                Ok(stats)
            }
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    /// Upload `part_size` chunks one at a time, then complete the upload
    async fn upload<R>(&self, reader: &mut R, cancel: &CancellationToken) -> Result<SinkStats>
    where
        R: AsyncRead + Unpin,
    {
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut stats = SinkStats::default();

        loop {
            let chunk = self.read_part(reader, cancel).await?;
            let last = chunk.len() < self.part_size;
            // A stream ending on a part boundary leaves nothing for a final part
            if chunk.is_empty() && !parts.is_empty() {
                break;
            }
            if parts.len() == MAX_PARTS {
                return Err(self.error(StoreError::Other(format!(
                    "archive needs more than {MAX_PARTS} parts of {} bytes",
                    self.part_size
                ))));
            }

            let part_number = u16::try_from(parts.len() + 1).map_err(|_| {
                self.error(StoreError::Other("part number out of range".to_string()))
            })?;
            let len = chunk.len() as u64;
            let sent = self
                .store
                .upload_part(&self.bucket, &self.key, &self.upload_id, part_number, chunk);
            let etag = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                etag = sent => etag.map_err(|source| self.error(source))?,
            };
            debug!(part_number, bytes = len, "part uploaded");

            parts.push(CompletedPart { part_number, etag });
            stats.bytes += len;
            stats.parts += 1;

            if last {
                break;
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.store
            .complete_multipart_upload(&self.bucket, &self.key, &self.upload_id, &parts)
            .await
            .map_err(|source| self.error(source))?;
        Ok(stats)
    }

    /// Fill one part, returning fewer than `part_size` bytes only at end of stream
    async fn read_part<R>(&self, reader: &mut R, cancel: &CancellationToken) -> Result<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut part = BytesMut::with_capacity(self.part_size);
        let mut buf = vec![0u8; READ_CHUNK.min(self.part_size)];
        while part.len() < self.part_size {
            let want = buf.len().min(self.part_size - part.len());
            let n = read_or_cancel(reader, &mut buf[..want], cancel).await?;
            if n == 0 {
                break;
            }
            part.extend_from_slice(&buf[..n]);
        }
        Ok(part.freeze())
    }

    async fn abort(self) {
        match self
            .store
            .abort_multipart_upload(&self.bucket, &self.key, &self.upload_id)
            .await
        {
            Ok(()) => debug!(upload_id = %self.upload_id, "multipart upload aborted"),
            Err(e) => warn!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %self.upload_id,
                error = %e,
                "failed to abort multipart upload"
            ),
        }
    }

    fn error(&self, source: StoreError) -> Error {
        Error::Upload {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            source,
        }
    }
}

async fn read_or_cancel<R>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        n = reader.read(buf) => Ok(n?),
    }
}
