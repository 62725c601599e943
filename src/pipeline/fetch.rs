//! Concurrent retrieval of object content.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EntryOrder;
use crate::error::{Error, Result};
use crate::location::{EntryNaming, ObjectLocator};
use crate::store::ObjectStore;

/// An object's full content paired with the name it takes in the archive
#[derive(Clone, Debug)]
pub(crate) struct RetrievedContent {
    pub name: String,
    pub data: Bytes,
    pub seq: u64,
}

/// Counters reported when the fetch pool drains
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Objects retrieved and handed to the archive writer
    pub objects: u64,
    /// Bytes retrieved
    pub bytes: u64,
    /// Objects whose content was checked against the listed ETag
    pub verified: u64,
}

/// Bounded pool of retrievals between traversal and the archive writer
pub(crate) struct FetchPool {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
    order: EntryOrder,
    naming: EntryNaming,
    verify_checksums: bool,
}

impl FetchPool {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        concurrency: usize,
        order: EntryOrder,
        naming: EntryNaming,
        verify_checksums: bool,
    ) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            order,
            naming,
            verify_checksums,
        }
    }

    /// Retrieve every locator from `rx` and forward the content to `tx`.
    ///
    /// At most `concurrency` retrievals are in flight. With
    /// [`EntryOrder::Completion`] content is forwarded as soon as it arrives;
    /// with [`EntryOrder::Enumeration`] it is forwarded in the order the
    /// locators were received. The first failure stops the pool.
    pub(crate) async fn run(
        &self,
        rx: mpsc::Receiver<ObjectLocator>,
        tx: &mpsc::Sender<RetrievedContent>,
        cancel: &CancellationToken,
    ) -> Result<FetchStats> {
        let verify = self.verify_checksums;
        let naming = self.naming;
        let retrievals = ReceiverStream::new(rx).map(|locator| {
            let store = Arc::clone(&self.store);
            async move { retrieve(store.as_ref(), locator, naming, verify).await }
        });
        let mut results: BoxStream<'_, Result<(RetrievedContent, bool)>> = match self.order {
            EntryOrder::Completion => retrievals.buffer_unordered(self.concurrency).boxed(),
            EntryOrder::Enumeration => retrievals.buffered(self.concurrency).boxed(),
        };

        let mut stats = FetchStats::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = results.next() => next,
            };
            let Some(result) = next else { break };
            let (content, verified) = result?;

            stats.objects += 1;
            stats.bytes += content.data.len() as u64;
            if verified {
                stats.verified += 1;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                sent = tx.send(content) => {
                    if sent.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        // Input also ends when traversal gives up; only a clean end is success
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!(
            objects = stats.objects,
            bytes = stats.bytes,
            verified = stats.verified,
            "fetch complete"
        );
        Ok(stats)
    }
}

/// Read one object, returning its content and whether the checksum was verified
async fn retrieve(
    store: &dyn ObjectStore,
    locator: ObjectLocator,
    naming: EntryNaming,
    verify: bool,
) -> Result<(RetrievedContent, bool)> {
    let name = locator.entry_name(naming);
    if locator.is_directory() {
        debug!(object = %locator, seq = locator.seq, "directory marker");
        let content = RetrievedContent {
            name,
            data: Bytes::new(),
            seq: locator.seq,
        };
        return Ok((content, false));
    }

    debug!(object = %locator, seq = locator.seq, "retrieving");
    let body = store
        .get_object(&locator.bucket, &locator.key)
        .await
        .map_err(|source| {
            warn!(object = %locator, error = %source, "retrieval failed");
            Error::Retrieval {
                bucket: locator.bucket.clone(),
                key: locator.key.clone(),
                source,
            }
        })?;

    let etag_is_md5 = body.etag_is_md5();
    if !etag_is_md5 {
        debug!(object = %locator, encryption = ?body.encryption, "ETag is not a content digest");
    }
    let data = body.data;
    if data.len() as u64 != locator.size {
        debug!(
            object = %locator,
            listed = locator.size,
            actual = data.len(),
            "object size changed since listing"
        );
    }

    let mut verified = false;
    if verify
        && etag_is_md5
        && let Some(expected) = locator.etag.as_deref().filter(|e| is_plain_md5(e))
    {
        let actual = format!("{:x}", md5::compute(&data));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::ChecksumMismatch {
                bucket: locator.bucket,
                key: locator.key,
                expected: expected.to_string(),
                actual,
            });
        }
        verified = true;
    }

    Ok((
        RetrievedContent {
            name,
            data,
            seq: locator.seq,
        },
        verified,
    ))
}

/// Single-part ETags are 32 hex digits; multipart ETags contain a `-`.
fn is_plain_md5(etag: &str) -> bool {
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}
