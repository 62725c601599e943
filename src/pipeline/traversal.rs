//! Breadth-first expansion of sources into a deduplicated stream of object locators.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::location::{ObjectLocator, SourceLocation};
use crate::store::{ObjectStore, Pager};

/// Counters reported when traversal finishes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraversalStats {
    /// Locators emitted downstream
    pub emitted: u64,
    /// Objects skipped because an earlier prefix already emitted them
    pub duplicates: u64,
    /// Prefixes listed, including the sources themselves
    pub prefixes_listed: u64,
    /// Total size reported by the listings of emitted objects
    pub listed_bytes: u64,
}

/// Walks sources with delimited listings and emits each object once
pub(crate) struct Traversal {
    store: Arc<dyn ObjectStore>,
    page_size: usize,
}

impl Traversal {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, page_size: usize) -> Self {
        Self { store, page_size }
    }

    /// Expand `sources` and send every newly seen object to `tx`.
    ///
    /// The work list is seeded with all sources; each listed sub-prefix is
    /// appended to its end, so siblings and their children interleave. Sending
    /// blocks while the consumer is busy, which bounds how far listing runs ahead.
    pub(crate) async fn run(
        &self,
        sources: Vec<SourceLocation>,
        tx: &mpsc::Sender<ObjectLocator>,
        cancel: &CancellationToken,
    ) -> Result<TraversalStats> {
        let mut work: VecDeque<SourceLocation> = sources.into();
        let mut seen: HashSet<String> = HashSet::new();
        let mut stats = TraversalStats::default();

        while let Some(item) = work.pop_front() {
            stats.prefixes_listed += 1;
            let mut pager = Pager::new(
                self.store.as_ref(),
                &item.bucket,
                &item.prefix,
                true,
                self.page_size,
            );

            loop {
                let page = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    page = pager.next_page() => page.map_err(|source| Error::Listing {
                        bucket: item.bucket.clone(),
                        prefix: item.prefix.clone(),
                        source,
                    })?,
                };
                let Some(page) = page else { break };

                for prefix in page.common_prefixes {
                    debug!(bucket = %item.bucket, prefix = %prefix, "queueing sub-prefix");
                    work.push_back(SourceLocation {
                        bucket: item.bucket.clone(),
                        prefix,
                    });
                }

                for object in page.objects {
                    let locator = ObjectLocator {
                        bucket: item.bucket.clone(),
                        key: object.key,
                        size: object.size,
                        etag: object.etag,
                        seq: stats.emitted,
                    };
                    if !seen.insert(locator.path()) {
                        stats.duplicates += 1;
                        debug!(object = %locator, "already queued, skipping");
                        continue;
                    }

                    stats.emitted += 1;
                    stats.listed_bytes += locator.size;
                    debug!(object = %locator, seq = locator.seq, "queueing object");

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        sent = tx.send(locator) => {
                            if sent.is_err() {
                                // Fetch stopped early; it reports its own error
                                return Err(Error::Cancelled);
                            }
                        }
                    }
                }
            }
        }

        info!(
            objects = stats.emitted,
            duplicates = stats.duplicates,
            prefixes = stats.prefixes_listed,
            "traversal complete"
        );
        Ok(stats)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn source(bucket: &str, prefix: &str) -> SourceLocation {
        SourceLocation {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        }
    }

    async fn collect(
        store: Arc<MemoryStore>,
        sources: Vec<SourceLocation>,
        page_size: usize,
    ) -> (Result<TraversalStats>, Vec<ObjectLocator>) {
        let traversal = Traversal::new(store, page_size);
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(loc) = rx.recv().await {
                out.push(loc);
            }
            out
        });
        let result = traversal.run(sources, &tx, &cancel).await;
        drop(tx);
        (result, consumer.await.unwrap())
    }

    #[tokio::test]
    async fn overlapping_sources_emit_each_object_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert("bucket", "a/x.txt", "x");
        store.insert("bucket", "a/y.txt", "y");

        let (result, locators) = collect(
            store,
            vec![source("bucket", "a/"), source("bucket", "a/x.txt")],
            1000,
        )
        .await;

        let stats = result.unwrap();
        let keys: Vec<_> = locators.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["a/x.txt", "a/y.txt"]);
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn nested_prefixes_expand_breadth_first() {
        let store = Arc::new(MemoryStore::new());
        store.insert("bucket", "root/top.txt", "1");
        store.insert("bucket", "root/d1/mid.txt", "2");
        store.insert("bucket", "root/d1/d2/deep.txt", "3");
        store.insert("bucket", "root/e1/side.txt", "4");

        let (result, locators) = collect(store, vec![source("bucket", "root/")], 1000).await;

        let keys: Vec<_> = locators.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "root/top.txt",
                "root/d1/mid.txt",
                "root/e1/side.txt",
                "root/d1/d2/deep.txt"
            ]
        );
        assert_eq!(result.unwrap().prefixes_listed, 4);
    }

    #[tokio::test]
    async fn sequence_numbers_follow_emission_order() {
        let store = Arc::new(MemoryStore::new());
        for key in ["p/1", "p/2", "p/3", "p/4", "p/5"] {
            store.insert("bucket", key, key);
        }

        let (_, locators) = collect(store, vec![source("bucket", "p/")], 2).await;

        let seqs: Vec<_> = locators.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn directory_markers_are_emitted_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert("bucket", "a/", "");
        store.insert("bucket", "a/empty/", "");
        store.insert("bucket", "a/file.txt", "data");

        let (result, locators) = collect(
            store,
            vec![source("bucket", ""), source("bucket", "a/")],
            1000,
        )
        .await;

        let keys: Vec<_> = locators.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["a/", "a/file.txt", "a/empty/"]);
        assert!(locators[0].is_directory());
        assert_eq!(result.unwrap().duplicates, 3);
    }

    #[tokio::test]
    async fn same_key_in_different_buckets_is_not_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        store.insert("one", "f.txt", "1");
        store.insert("two", "f.txt", "2");

        let (result, locators) = collect(
            store,
            vec![source("one", ""), source("two", "")],
            1000,
        )
        .await;

        assert_eq!(locators.len(), 2);
        assert_eq!(result.unwrap().duplicates, 0);
    }

    #[tokio::test]
    async fn listing_failure_names_the_prefix() {
        let store = Arc::new(MemoryStore::new());
        store.insert("bucket", "a/sub/x.txt", "x");
        store.fail_listing("bucket", "a/sub/");

        let (result, _) = collect(store, vec![source("bucket", "a/")], 1000).await;

        match result {
            Err(Error::Listing { bucket, prefix, .. }) => {
                assert_eq!(bucket, "bucket");
                assert_eq!(prefix, "a/sub/");
            }
            other => panic!("expected Listing error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_a_blocked_producer() {
        let store = Arc::new(MemoryStore::new());
        store.insert("bucket", "a/1", "1");
        store.insert("bucket", "a/2", "2");

        let traversal = Traversal::new(store, 1000);
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let run = traversal.run(vec![source("bucket", "a/")], &tx, &cancel);
        let canceller = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, canceller);

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
