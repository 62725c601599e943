//! The streaming pack pipeline.
//!
//! Four stages run concurrently and hand work to each other through bounded
//! queues, so no stage can run arbitrarily far ahead of the one it feeds:
//!
//! ```text
//! traversal --locators--> fetch --content--> archive --bytes--> sink
//! ```
//!
//! - `traversal` expands sources breadth-first and drops duplicate objects
//! - `fetch` retrieves object content with bounded concurrency
//! - `archive` encodes a zip stream on a blocking thread
//! - `sink` writes the stream to a local file or a multipart upload
//!
//! All stages share one cancellation token. The first stage to fail cancels
//! it, every other stage stops at its next suspension point, and the
//! destination is removed or aborted instead of committed.

mod archive;
mod fetch;
mod sink;
mod traversal;

pub use archive::ArchiveStats;
pub use fetch::FetchStats;
pub use sink::{MAX_PARTS, SinkStats};
pub use traversal::TraversalStats;

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::error::{Error, Result, Stage};
use crate::location::{Destination, EntryNaming, Location, ObjectLocator, SourceLocation};
use crate::store::{ObjectStore, list_all};
use archive::ArchiveOutput;
use fetch::FetchPool;
use sink::Sink;
use traversal::Traversal;

/// Outcome of a successful pack
#[derive(Clone, Debug)]
pub struct PackSummary {
    /// Where the archive was written
    pub destination: Destination,
    /// Traversal counters
    pub traversal: TraversalStats,
    /// Retrieval counters
    pub fetch: FetchStats,
    /// Encoder counters
    pub archive: ArchiveStats,
    /// Destination counters
    pub sink: SinkStats,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

impl PackSummary {
    /// Number of entries in the archive
    pub fn entries(&self) -> u64 {
        self.archive.entries
    }

    /// Size of the archive as written to the destination
    pub fn archive_bytes(&self) -> u64 {
        self.sink.bytes
    }
}

impl std::fmt::Display for PackSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "packed {} objects ({} bytes) into {} ({} bytes) in {:.1?}",
            self.archive.entries,
            self.archive.content_bytes,
            self.destination,
            self.sink.bytes,
            self.elapsed
        )
    }
}

/// Runs pack operations against one object store
///
/// The store is the session shared by every stage of a run; create it once
/// and reuse the packer for as many runs as needed.
pub struct Packer {
    store: Arc<dyn ObjectStore>,
    config: PipelineConfig,
}

impl Packer {
    /// Create a packer, rejecting configurations the pipeline cannot run with
    pub fn new(store: Arc<dyn ObjectStore>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Pipeline settings used for every run
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pack every object below `sources` into a zip archive at `destination`
    pub async fn pack<S: AsRef<str>>(
        &self,
        destination: &str,
        sources: &[S],
    ) -> Result<PackSummary> {
        self.pack_with_cancel(destination, sources, CancellationToken::new())
            .await
    }

    /// Like [`Packer::pack`], stopping early when `cancel` is triggered.
    ///
    /// Locations are validated before any I/O. On failure the error of the
    /// first stage that failed is returned and the destination is left
    /// without an archive; [`Error::Cancelled`] is returned only when `cancel`
    /// stopped the run.
    pub async fn pack_with_cancel<S: AsRef<str>>(
        &self,
        destination: &str,
        sources: &[S],
        cancel: CancellationToken,
    ) -> Result<PackSummary> {
        let started = Instant::now();
        let destination = Destination::parse(destination)?;
        let sources = parse_sources(sources)?;
        let naming = EntryNaming::for_sources(&sources);
        info!(
            destination = %destination,
            sources = sources.len(),
            naming = ?naming,
            "starting pack"
        );

        let sink = Sink::open(&destination, Arc::clone(&self.store), self.config.part_size).await?;

        let control = RunControl::new(cancel.child_token());
        let (locator_tx, locator_rx) = mpsc::channel::<ObjectLocator>(self.config.queue_depth);
        let (content_tx, content_rx) = mpsc::channel(self.config.queue_depth);
        let (pipe_writer, pipe_reader) = tokio::io::duplex(self.config.pipe_buffer);
        let output = ArchiveOutput::new(pipe_writer);

        // Each stage keeps its downstream handle alive until its guard has
        // settled, so consumers only see end-of-input after cancellation.
        let traversal_task = tokio::spawn({
            let control = Arc::clone(&control);
            let traversal = Traversal::new(Arc::clone(&self.store), self.config.page_size);
            async move {
                let tx = locator_tx;
                let guard = control.guard(Stage::Traversal);
                let result = traversal.run(sources, &tx, control.token()).await;
                guard.settle(&result);
                result
            }
        });

        let fetch_task = tokio::spawn({
            let control = Arc::clone(&control);
            let pool = FetchPool::new(
                Arc::clone(&self.store),
                self.config.fetch_concurrency,
                self.config.entry_order,
                naming,
                self.config.verify_checksums,
            );
            async move {
                let tx = content_tx;
                let guard = control.guard(Stage::Fetch);
                let result = pool.run(locator_rx, &tx, control.token()).await;
                guard.settle(&result);
                result
            }
        });

        let archive_task = tokio::task::spawn_blocking({
            let control = Arc::clone(&control);
            let level = self.config.compression_level;
            move || {
                let mut rx = content_rx;
                let mut output = output;
                let guard = control.guard(Stage::Archive);
                let written = archive::write_archive(&mut rx, &mut output, level, control.token());
                // `output` must outlive the guard on failure
                let result = match written {
                    Ok(stats) => output.finish().map(|_| stats).map_err(|e| Error::ArchiveWrite {
                        entry: "central directory".to_string(),
                        reason: e.to_string(),
                    }),
                    Err(e) => Err(e),
                };
                guard.settle(&result);
                result
            }
        });

        let sink_task = tokio::spawn({
            let control = Arc::clone(&control);
            async move {
                let mut reader = pipe_reader;
                let guard = control.guard(Stage::Sink);
                let result = sink.drain(&mut reader, control.token()).await;
                guard.settle(&result);
                result
            }
        });

        let (traversal, fetch, archive, sink) =
            tokio::join!(traversal_task, fetch_task, archive_task, sink_task);
        let traversal = joined(Stage::Traversal, traversal);
        let fetch = joined(Stage::Fetch, fetch);
        let archive = joined(Stage::Archive, archive);
        let sink = joined(Stage::Sink, sink);

        match (traversal, fetch, archive, sink) {
            (Ok(traversal), Ok(fetch), Ok(archive), Ok(sink)) => {
                let summary = PackSummary {
                    destination,
                    traversal,
                    fetch,
                    archive,
                    sink,
                    elapsed: started.elapsed(),
                };
                info!(
                    destination = %summary.destination,
                    entries = summary.entries(),
                    bytes = summary.archive_bytes(),
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "pack complete"
                );
                Ok(summary)
            }
            (traversal, fetch, archive, sink) => Err(select_error(
                control.first_failure(),
                [
                    (Stage::Traversal, traversal.err()),
                    (Stage::Fetch, fetch.err()),
                    (Stage::Archive, archive.err()),
                    (Stage::Sink, sink.err()),
                ],
            )),
        }
    }

    /// List the objects a pack of `sources` would include without fetching
    /// anything.
    ///
    /// Each source is listed flat, in key order; objects already listed under
    /// an earlier source are left out.
    pub async fn plan<S: AsRef<str>>(&self, sources: &[S]) -> Result<Vec<ObjectLocator>> {
        let sources = parse_sources(sources)?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut objects = Vec::new();

        for source in &sources {
            let listed = list_all(
                self.store.as_ref(),
                &source.bucket,
                &source.prefix,
                self.config.page_size,
            )
            .await
            .map_err(|e| Error::Listing {
                bucket: source.bucket.clone(),
                prefix: source.prefix.clone(),
                source: e,
            })?;

            for object in listed {
                let locator = ObjectLocator {
                    bucket: source.bucket.clone(),
                    key: object.key,
                    size: object.size,
                    etag: object.etag,
                    seq: objects.len() as u64,
                };
                if seen.insert(locator.path()) {
                    objects.push(locator);
                }
            }
        }
        Ok(objects)
    }
}

fn parse_sources<S: AsRef<str>>(sources: &[S]) -> Result<Vec<SourceLocation>> {
    if sources.is_empty() {
        return Err(Error::config("sources", "at least one source location is required"));
    }
    sources
        .iter()
        .map(|s| Location::parse_source(s.as_ref()))
        .collect()
}

fn joined<T>(stage: Stage, result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.unwrap_or_else(|e| {
        Err(Error::StageTerminated {
            stage,
            reason: e.to_string(),
        })
    })
}

/// Error of the stage that failed first; otherwise any real failure; otherwise cancellation
fn select_error(first: Option<Stage>, results: [(Stage, Option<Error>); 4]) -> Error {
    let mut errors: Vec<(Stage, Error)> = results
        .into_iter()
        .filter_map(|(stage, err)| err.map(|e| (stage, e)))
        .collect();

    if let Some(first) = first
        && let Some(idx) = errors.iter().position(|(stage, _)| *stage == first)
    {
        return errors.swap_remove(idx).1;
    }
    errors
        .into_iter()
        .map(|(_, e)| e)
        .find(|e| !e.is_cancelled())
        .unwrap_or(Error::Cancelled)
}

/// Cancellation shared by the stages of one run
struct RunControl {
    cancel: CancellationToken,
    first_failure: OnceLock<Stage>,
}

impl RunControl {
    fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel,
            first_failure: OnceLock::new(),
        })
    }

    fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn first_failure(&self) -> Option<Stage> {
        self.first_failure.get().copied()
    }

    fn fail(&self, stage: Stage) {
        if self.first_failure.set(stage).is_ok() {
            info!(stage = %stage, "cancelling remaining stages");
        }
        self.cancel.cancel();
    }

    fn guard(self: &Arc<Self>, stage: Stage) -> StageGuard {
        StageGuard {
            control: Arc::clone(self),
            stage,
            armed: true,
        }
    }
}

/// Cancels the run if its stage ends without reporting a result (panic)
struct StageGuard {
    control: Arc<RunControl>,
    stage: Stage,
    armed: bool,
}

impl StageGuard {
    fn settle<T>(mut self, result: &Result<T>) {
        self.armed = false;
        match result {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => self.control.cancel.cancel(),
            Err(e) => {
                error!(stage = %self.stage, error = %e, "stage failed");
                self.control.fail(self.stage);
            }
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(stage = %self.stage, "stage terminated without a result");
            self.control.fail(self.stage);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
