use super::*;
use crate::error::StoreError;
use crate::store::MemoryStore;
use std::io::Cursor;

fn listing_error() -> Error {
    Error::Listing {
        bucket: "bucket".to_string(),
        prefix: "a/".to_string(),
        source: StoreError::NotFound,
    }
}

fn upload_error() -> Error {
    Error::Upload {
        bucket: "out".to_string(),
        key: "pack.zip".to_string(),
        source: StoreError::Transport("connection reset".to_string()),
    }
}

fn packer(store: Arc<MemoryStore>) -> Packer {
    Packer::new(store, PipelineConfig::default()).unwrap()
}

#[test]
fn first_failed_stage_wins_over_later_errors() {
    let err = select_error(
        Some(Stage::Sink),
        [
            (Stage::Traversal, Some(Error::Cancelled)),
            (Stage::Fetch, Some(Error::Cancelled)),
            (
                Stage::Archive,
                Some(Error::ArchiveWrite {
                    entry: "a.txt".to_string(),
                    reason: "broken pipe".to_string(),
                }),
            ),
            (Stage::Sink, Some(upload_error())),
        ],
    );

    assert!(matches!(err, Error::Upload { .. }));
}

#[test]
fn real_error_preferred_when_no_stage_recorded() {
    let err = select_error(
        None,
        [
            (Stage::Traversal, Some(listing_error())),
            (Stage::Fetch, Some(Error::Cancelled)),
            (Stage::Archive, Some(Error::Cancelled)),
            (Stage::Sink, None),
        ],
    );

    assert!(matches!(err, Error::Listing { .. }));
}

#[test]
fn only_cancellations_yield_cancelled() {
    let err = select_error(
        None,
        [
            (Stage::Traversal, Some(Error::Cancelled)),
            (Stage::Fetch, Some(Error::Cancelled)),
            (Stage::Archive, None),
            (Stage::Sink, Some(Error::Cancelled)),
        ],
    );

    assert!(err.is_cancelled());
}

#[test]
fn dropped_guard_cancels_and_records_its_stage() {
    let control = RunControl::new(CancellationToken::new());

    drop(control.guard(Stage::Fetch));

    assert!(control.token().is_cancelled());
    assert_eq!(control.first_failure(), Some(Stage::Fetch));
}

#[test]
fn settled_success_leaves_run_running() {
    let control = RunControl::new(CancellationToken::new());

    control.guard(Stage::Traversal).settle(&Ok(()));

    assert!(!control.token().is_cancelled());
    assert_eq!(control.first_failure(), None);
}

#[test]
fn settled_cancellation_is_not_a_failure() {
    let control = RunControl::new(CancellationToken::new());

    control
        .guard(Stage::Archive)
        .settle::<()>(&Err(Error::Cancelled));

    assert!(control.token().is_cancelled());
    assert_eq!(control.first_failure(), None);
}

#[test]
fn only_the_first_failure_is_recorded() {
    let control = RunControl::new(CancellationToken::new());

    control.guard(Stage::Fetch).settle::<()>(&Err(listing_error()));
    control.guard(Stage::Sink).settle::<()>(&Err(upload_error()));

    assert_eq!(control.first_failure(), Some(Stage::Fetch));
}

#[test]
fn invalid_pipeline_config_is_rejected() {
    let config = PipelineConfig {
        fetch_concurrency: 0,
        ..PipelineConfig::default()
    };

    let result = Packer::new(Arc::new(MemoryStore::new()), config);

    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test]
async fn pack_without_sources_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.zip");

    let result = packer(store.clone())
        .pack::<&str>(dest.to_str().unwrap(), &[])
        .await;

    assert!(matches!(result, Err(Error::Config { .. })));
    assert!(!dest.exists());
}

#[tokio::test]
async fn plan_lists_each_object_once_in_key_order() {
    let store = Arc::new(MemoryStore::new());
    store.insert("bucket", "a/x.txt", "x");
    store.insert("bucket", "a/sub/y.txt", "y");

    let objects = packer(store.clone())
        .plan(&["s3://bucket/a/", "s3://bucket/a/x.txt"])
        .await
        .unwrap();

    let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(keys, vec!["a/sub/y.txt", "a/x.txt"]);
    let seqs: Vec<_> = objects.iter().map(|o| o.seq).collect();
    assert_eq!(seqs, vec![0, 1]);
    assert_eq!(store.get_calls(), 0);
}

#[tokio::test]
async fn plan_reports_listing_failure_with_its_source() {
    let store = Arc::new(MemoryStore::new());
    store.insert("bucket", "a/x.txt", "x");
    store.fail_listing("bucket", "a/");

    let result = packer(store).plan(&["s3://bucket/a/"]).await;

    match result {
        Err(Error::Listing { bucket, prefix, .. }) => {
            assert_eq!(bucket, "bucket");
            assert_eq!(prefix, "a/");
        }
        other => panic!("expected Listing error, got {other:?}"),
    }
}

#[tokio::test]
async fn plan_rejects_local_sources() {
    let store = Arc::new(MemoryStore::new());

    let result = packer(store).plan(&["/tmp/data"]).await;

    assert!(matches!(result, Err(Error::InvalidLocation { .. })));
}

#[tokio::test]
async fn summary_reports_every_stage() {
    let store = Arc::new(MemoryStore::new());
    store.insert("bucket", "docs/a.txt", "alpha");
    store.insert("bucket", "docs/b.txt", "bravo!");
    store.create_bucket("out");

    let summary = packer(store.clone())
        .pack("s3://out/docs.zip", &["s3://bucket/docs/"])
        .await
        .unwrap();

    assert_eq!(summary.entries(), 2);
    assert_eq!(summary.traversal.emitted, 2);
    assert_eq!(summary.fetch.bytes, 11);
    assert_eq!(summary.fetch.verified, 2);
    assert_eq!(summary.archive.archive_bytes, summary.sink.bytes);
    assert_eq!(summary.sink.parts, 1);

    let uploaded = store.object("out", "docs.zip").unwrap();
    assert_eq!(uploaded.len() as u64, summary.archive_bytes());
    let archive = zip::ZipArchive::new(Cursor::new(uploaded.to_vec())).unwrap();
    assert_eq!(archive.len(), 2);
    assert!(summary.to_string().contains("s3://out/docs.zip"));
}
