//! Object store seam used by every pipeline stage.
//!
//! - [`ObjectStore`] - paged listing, whole-object reads and multipart upload primitives
//! - [`Pager`] - lazy page-by-page listing of a prefix
//! - [`S3Store`] - signed HTTP implementation against S3-compatible endpoints
//! - [`MemoryStore`] - in-process implementation for tests and embedding

mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use bytes::Bytes;

use crate::error::StoreError;

/// Delimiter that turns key prefixes into directories
pub const DELIMITER: &str = "/";

/// One listed object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// ETag without surrounding quotes
    pub etag: Option<String>,
}

/// Content of one object as returned by a read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectBody {
    /// Object content
    pub data: Bytes,
    /// Server-side encryption reported with the object (`AES256`, `aws:kms`, ...)
    pub encryption: Option<String>,
    /// Encrypted with a customer-provided key (SSE-C)
    pub customer_key: bool,
}

impl ObjectBody {
    /// Whether a single-part ETag of this object is the MD5 of its content.
    ///
    /// Objects encrypted with SSE-KMS or SSE-C carry ETags that are not a
    /// digest of their plaintext.
    pub fn etag_is_md5(&self) -> bool {
        let kms = self
            .encryption
            .as_deref()
            .is_some_and(|e| e.starts_with("aws:kms"));
        !kms && !self.customer_key
    }
}

impl From<Bytes> for ObjectBody {
    fn from(data: Bytes) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
}

/// One page of a listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Sub-prefixes ending in the delimiter (only for delimited listings)
    pub common_prefixes: Vec<String>,
    /// Objects directly under the prefix (or anywhere below it, if not delimited)
    pub objects: Vec<ObjectSummary>,
    /// Token for the next page, `None` on the last page
    pub next_continuation_token: Option<String>,
}

/// Parameters for a single listing request
#[derive(Clone, Debug)]
pub struct ListRequest<'a> {
    /// Bucket to list
    pub bucket: &'a str,
    /// Key prefix, may be empty
    pub prefix: &'a str,
    /// Group keys by [`DELIMITER`] into common prefixes
    pub delimited: bool,
    /// Maximum entries per page
    pub max_keys: usize,
    /// Token returned by the previous page
    pub continuation_token: Option<&'a str>,
}

/// A finished part of a multipart upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number
    pub part_number: u16,
    /// ETag returned when the part was uploaded
    pub etag: String,
}

/// Abstraction over the remote object store, enabling testability.
///
/// One instance is created per run and shared by traversal, fetch and sink.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one page of a listing
    async fn list_page(&self, request: ListRequest<'_>) -> Result<ListPage, StoreError>;

    /// Read a whole object into memory
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError>;

    /// Start a multipart upload and return its upload ID
    async fn create_multipart_upload(&self, bucket: &str, key: &str)
    -> Result<String, StoreError>;

    /// Upload one part and return its ETag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> Result<String, StoreError>;

    /// Assemble the uploaded parts into the final object
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError>;

    /// Discard an unfinished multipart upload and its parts
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;
}

/// Lazily walks the pages of one listing
pub struct Pager<'a> {
    store: &'a dyn ObjectStore,
    bucket: &'a str,
    prefix: &'a str,
    delimited: bool,
    page_size: usize,
    token: Option<String>,
    done: bool,
}

impl<'a> Pager<'a> {
    /// Prepare a listing of `prefix` in `bucket`; no request is made until the first page
    pub fn new(
        store: &'a dyn ObjectStore,
        bucket: &'a str,
        prefix: &'a str,
        delimited: bool,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            bucket,
            prefix,
            delimited,
            page_size: page_size.max(1),
            token: None,
            done: false,
        }
    }

    /// Fetch the next page, `None` once the listing is exhausted
    pub async fn next_page(&mut self) -> Result<Option<ListPage>, StoreError> {
        if self.done {
            return Ok(None);
        }

        let page = self
            .store
            .list_page(ListRequest {
                bucket: self.bucket,
                prefix: self.prefix,
                delimited: self.delimited,
                max_keys: self.page_size,
                continuation_token: self.token.as_deref(),
            })
            .await?;

        match &page.next_continuation_token {
            Some(token) if Some(token) == self.token.as_ref() => {
                return Err(StoreError::Parse(format!(
                    "listing repeated continuation token '{token}'"
                )));
            }
            Some(token) => self.token = Some(token.clone()),
            None => self.done = true,
        }

        Ok(Some(page))
    }
}

/// List every object below `prefix` without delimiting, across all pages
pub async fn list_all(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    page_size: usize,
) -> Result<Vec<ObjectSummary>, StoreError> {
    let mut pager = Pager::new(store, bucket, prefix, false, page_size);
    let mut objects = Vec::new();
    while let Some(page) = pager.next_page().await? {
        objects.extend(page.objects);
    }
    Ok(objects)
}

/// Strip the quotes S3 puts around ETags
pub(crate) fn unquote_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}
