//! Streaming zip encoder feeding the pipe to the sink.
//!
//! The writer runs on a blocking thread: the zip encoder is synchronous, so it
//! receives content with `blocking_recv` and writes through a [`SyncIoBridge`]
//! into the async pipe. Entries are written in the order they arrive.

use std::cell::Cell;
use std::io::{self, Seek, Write};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::fetch::RetrievedContent;
use crate::error::{Error, Result};

/// Counters reported when the archive is finalized
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Entries written
    pub entries: u64,
    /// Uncompressed bytes written into entries
    pub content_bytes: u64,
    /// Encoded bytes written to the pipe, including headers and the central directory
    pub archive_bytes: u64,
}

/// Write end of the pipe between archive writer and sink.
///
/// [`ArchiveOutput::finish`] is the only way to close the pipe cleanly. An
/// output dropped without it just disconnects, and the sink treats the end of
/// the stream as final only when the run was not cancelled.
pub(crate) struct ArchiveOutput {
    inner: SyncIoBridge<DuplexStream>,
    written: u64,
}

impl ArchiveOutput {
    /// Must be called from within the runtime, before moving to a blocking thread
    pub(crate) fn new(pipe: DuplexStream) -> Self {
        Self {
            inner: SyncIoBridge::new(pipe),
            written: 0,
        }
    }

    /// Flush and shut down the pipe, returning the total bytes written
    pub(crate) fn finish(mut self) -> io::Result<u64> {
        self.inner.flush()?;
        self.inner.shutdown()?;
        Ok(self.written)
    }
}

impl Write for ArchiveOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Gate between the encoder and the pipe.
///
/// Once closed, writes are accepted and dropped. A `ZipWriter` finalizes
/// itself when dropped, and closing the gate first keeps that trailer off the
/// pipe. The gate also closes on the first failed write.
struct Gate<'a> {
    out: &'a mut ArchiveOutput,
    closed: &'a Cell<bool>,
}

impl Write for Gate<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.get() {
            return Ok(buf.len());
        }
        match self.out.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.closed.set(true);
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed.get() {
            return Ok(());
        }
        self.out.flush()
    }
}

/// Encode every item received on `rx` into a zip stream written to `out`.
///
/// Entries are deflated at `compression_level`, or stored when it is 0. Keys
/// ending in `/` become directory entries. The central directory is written
/// only when the input ends without the run being cancelled; after any
/// failure nothing more reaches `out`, so a failed run never produces a
/// well-formed archive.
pub(crate) fn write_archive(
    rx: &mut mpsc::Receiver<RetrievedContent>,
    out: &mut ArchiveOutput,
    compression_level: i64,
    cancel: &CancellationToken,
) -> Result<ArchiveStats> {
    let closed = Cell::new(false);
    let mut zip = ZipWriter::new_stream(Gate {
        out: &mut *out,
        closed: &closed,
    });

    let mut stats = match write_entries(&mut zip, rx, entry_options(compression_level), cancel) {
        Ok(stats) => stats,
        Err(e) => {
            closed.set(true);
            return Err(e);
        }
    };

    zip.finish()
        .map_err(|e| archive_error("central directory", e, cancel))?;

    stats.archive_bytes = out.written;
    info!(
        entries = stats.entries,
        content_bytes = stats.content_bytes,
        archive_bytes = stats.archive_bytes,
        "archive finalized"
    );
    Ok(stats)
}

fn write_entries<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    rx: &mut mpsc::Receiver<RetrievedContent>,
    options: SimpleFileOptions,
    cancel: &CancellationToken,
) -> Result<ArchiveStats> {
    let mut stats = ArchiveStats::default();

    while let Some(item) = rx.blocking_recv() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if item.name.ends_with('/') {
            zip.add_directory(item.name.as_str(), SimpleFileOptions::default())
                .map_err(|e| archive_error(&item.name, e, cancel))?;
            stats.entries += 1;
            debug!(entry = %item.name, seq = item.seq, "directory written");
            continue;
        }

        let options = options.large_file(item.data.len() as u64 >= u64::from(u32::MAX));
        zip.start_file(item.name.as_str(), options)
            .map_err(|e| archive_error(&item.name, e, cancel))?;
        zip.write_all(&item.data)
            .map_err(|e| archive_error(&item.name, e, cancel))?;

        stats.entries += 1;
        stats.content_bytes += item.data.len() as u64;
        debug!(entry = %item.name, seq = item.seq, bytes = item.data.len(), "entry written");
    }

    // The channel also closes when fetch gives up
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(stats)
}

/// Level 0 stores entries; deflate accepts 1-9
fn entry_options(compression_level: i64) -> SimpleFileOptions {
    let options = SimpleFileOptions::default();
    if compression_level == 0 {
        options.compression_method(CompressionMethod::Stored)
    } else {
        options
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(compression_level))
    }
}

/// A write failure after cancellation is the sink going away, not a fault here
fn archive_error(entry: &str, err: impl std::fmt::Display, cancel: &CancellationToken) -> Error {
    if cancel.is_cancelled() {
        return Error::Cancelled;
    }
    Error::ArchiveWrite {
        entry: entry.to_string(),
        reason: err.to_string(),
    }
}
