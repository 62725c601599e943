//! In-process object store with S3 listing semantics.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

use super::{
    CompletedPart, DELIMITER, ListPage, ListRequest, ObjectBody, ObjectStore, ObjectSummary,
};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Bytes>,
    uploads: HashMap<String, PendingUpload>,
    aborted: Vec<String>,
    failing_lists: HashSet<(String, String)>,
    failing_gets: HashSet<(String, String)>,
    failing_part: Option<u16>,
    get_delays: HashMap<(String, String), Duration>,
    encryption: HashMap<(String, String), String>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u16, Bytes>,
}

enum Entry {
    Object(ObjectSummary),
    Prefix(String),
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Object(o) => &o.key,
            Entry::Prefix(p) => p,
        }
    }
}

/// Object store kept entirely in memory
///
/// Listing follows S3: results are sorted by key, common prefixes count toward
/// the page size, and continuation tokens are the last name returned. Failures
/// and slow reads can be injected per key.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    next_upload: AtomicU64,
    list_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves the maps consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an empty bucket
    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.insert(bucket.to_string());
    }

    /// Store an object, creating its bucket and replacing any existing content
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.lock();
        state.buckets.insert(bucket.to_string());
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    /// Content of an object, if present
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Make every listing of exactly this prefix fail
    pub fn fail_listing(&self, bucket: &str, prefix: &str) {
        self.lock()
            .failing_lists
            .insert((bucket.to_string(), prefix.to_string()));
    }

    /// Make reads of this object fail
    pub fn fail_get(&self, bucket: &str, key: &str) {
        self.lock()
            .failing_gets
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Make uploading this part number fail
    pub fn fail_part(&self, part_number: u16) {
        self.lock().failing_part = Some(part_number);
    }

    /// Report this object as encrypted with `algorithm` (`AES256`, `aws:kms`).
    ///
    /// KMS-encrypted objects are listed with an ETag that is not their MD5,
    /// as S3 does.
    pub fn set_encryption(&self, bucket: &str, key: &str, algorithm: &str) {
        self.lock()
            .encryption
            .insert((bucket.to_string(), key.to_string()), algorithm.to_string());
    }

    /// Delay reads of this object
    pub fn delay_get(&self, bucket: &str, key: &str, delay: Duration) {
        self.lock()
            .get_delays
            .insert((bucket.to_string(), key.to_string()), delay);
    }

    /// Upload IDs that were aborted
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    /// Number of multipart uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Number of listing requests served
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// Number of object reads served
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    fn summary(key: &str, data: &Bytes, encryption: Option<&String>) -> ObjectSummary {
        let digest = match encryption {
            Some(algorithm) if algorithm.starts_with("aws:kms") => {
                md5::compute(format!("{algorithm}:{key}:{}", data.len()))
            }
            _ => md5::compute(data),
        };
        ObjectSummary {
            key: key.to_string(),
            size: data.len() as u64,
            etag: Some(format!("{digest:x}")),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(&self, request: ListRequest<'_>) -> Result<ListPage, StoreError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.lock();

        if state
            .failing_lists
            .contains(&(request.bucket.to_string(), request.prefix.to_string()))
        {
            return Err(StoreError::Status {
                status: 500,
                body: "injected listing failure".to_string(),
            });
        }
        if !state.buckets.contains(request.bucket) {
            return Err(StoreError::NotFound);
        }

        let mut entries = Vec::new();
        let mut seen_prefixes = BTreeSet::new();
        for ((bucket, key), data) in &state.objects {
            if bucket != request.bucket || !key.starts_with(request.prefix) {
                continue;
            }
            let rest = &key[request.prefix.len()..];
            match rest.find(DELIMITER) {
                Some(idx) if request.delimited => {
                    let prefix = format!("{}{}", request.prefix, &rest[..idx + DELIMITER.len()]);
                    if seen_prefixes.insert(prefix.clone()) {
                        entries.push(Entry::Prefix(prefix));
                    }
                }
                _ => {
                    let encryption = state.encryption.get(&(bucket.clone(), key.clone()));
                    entries.push(Entry::Object(Self::summary(key, data, encryption)));
                }
            }
        }
        entries.sort_by(|a, b| a.name().cmp(b.name()));

        let start = match request.continuation_token {
            Some(token) => entries.partition_point(|e| e.name() <= token),
            None => 0,
        };
        let end = (start + request.max_keys.max(1)).min(entries.len());
        let truncated = end < entries.len();

        let mut page = ListPage::default();
        for entry in entries.drain(start..end) {
            if truncated {
                page.next_continuation_token = Some(entry.name().to_string());
            }
            match entry {
                Entry::Object(o) => page.objects.push(o),
                Entry::Prefix(p) => page.common_prefixes.push(p),
            }
        }
        Ok(page)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let id = (bucket.to_string(), key.to_string());

        let delay = self.lock().get_delays.get(&id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if state.failing_gets.contains(&id) {
            return Err(StoreError::Status {
                status: 503,
                body: "injected read failure".to_string(),
            });
        }
        let data = state.objects.get(&id).cloned().ok_or(StoreError::NotFound)?;
        Ok(ObjectBody {
            data,
            encryption: state.encryption.get(&id).cloned(),
            customer_key: false,
        })
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StoreError> {
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        let mut state = self.lock();
        if !state.buckets.contains(bucket) {
            return Err(StoreError::NotFound);
        }
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let mut state = self.lock();
        if state.failing_part == Some(part_number) {
            return Err(StoreError::Status {
                status: 500,
                body: "injected part failure".to_string(),
            });
        }
        let etag = format!("{:x}", md5::compute(&body));
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::Other(format!("no such upload {upload_id}")))?;
        upload.parts.insert(part_number, body);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::Other(format!("no such upload {upload_id}")))?;

        let mut data = Vec::new();
        for part in parts {
            let body = upload.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::Other(format!("part {} was never uploaded", part.part_number))
            })?;
            data.extend_from_slice(body);
        }
        state
            .objects
            .insert((upload.bucket, upload.key), Bytes::from(data));
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }
}
