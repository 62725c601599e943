//! S3-compatible object store over presigned HTTP requests.

use std::time::Duration;

use bytes::Bytes;
use rusty_s3::actions::{CreateMultipartUpload, ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tracing::debug;

use super::{
    CompletedPart, DELIMITER, ListPage, ListRequest, ObjectBody, ObjectStore, ObjectSummary,
};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

/// Validity of each presigned request URL
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const SSE_HEADER: &str = "x-amz-server-side-encryption";
const SSE_CUSTOMER_HEADER: &str = "x-amz-server-side-encryption-customer-algorithm";

/// Longest error body kept in [`StoreError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// S3 client shared by every stage of a run
///
/// Buckets are addressed according to [`StoreConfig::endpoint_for`]; requests
/// are signed with the configured credentials, or sent anonymously when none
/// are set.
pub struct S3Store {
    config: StoreConfig,
    credentials: Option<Credentials>,
    client: reqwest::Client,
}

impl S3Store {
    /// Create a store from connection settings
    pub fn new(config: StoreConfig) -> Result<Self> {
        let credentials = match (&config.access_key_id, &config.secret_access_key) {
            (Some(key), Some(secret)) => Some(match &config.session_token {
                Some(token) => Credentials::new_with_token(key, secret, token),
                None => Credentials::new(key, secret),
            }),
            _ => None,
        };

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            credentials,
            client,
        })
    }

    fn bucket(&self, name: &str) -> std::result::Result<Bucket, StoreError> {
        let (endpoint, path_style) = self.config.endpoint_for(name);
        let base_url: url::Url = endpoint
            .parse()
            .map_err(|e| StoreError::Other(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;
        let url_style = if path_style {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };

        Bucket::new(
            base_url,
            url_style,
            name.to_string(),
            self.config.region.clone(),
        )
        .map_err(|e| StoreError::Other(format!("invalid bucket '{name}': {e}")))
    }

    /// Map non-success responses to [`StoreError`]
    async fn check(resp: reqwest::Response) -> std::result::Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn list_page(
        &self,
        request: ListRequest<'_>,
    ) -> std::result::Result<ListPage, StoreError> {
        let bucket = self.bucket(request.bucket)?;
        let max_keys = request.max_keys.to_string();

        let mut action = bucket.list_objects_v2(self.credentials.as_ref());
        if !request.prefix.is_empty() {
            action.query_mut().insert("prefix", request.prefix);
        }
        if request.delimited {
            action.query_mut().insert("delimiter", DELIMITER);
        }
        action.query_mut().insert("max-keys", max_keys.as_str());
        if let Some(token) = request.continuation_token {
            action.query_mut().insert("continuation-token", token);
        }
        let url = action.sign(PRESIGN_DURATION);

        debug!(bucket = request.bucket, prefix = request.prefix, "S3 LIST");
        let resp = Self::check(self.client.get(url).send().await?).await?;
        let body = resp.text().await?;
        let parsed = ListObjectsV2::parse_response(&body)
            .map_err(|e| StoreError::Parse(format!("ListObjectsV2 response: {e}")))?;

        Ok(ListPage {
            common_prefixes: parsed
                .common_prefixes
                .into_iter()
                .map(|p| p.prefix)
                .collect(),
            objects: parsed
                .contents
                .into_iter()
                .map(|o| ObjectSummary {
                    etag: Some(super::unquote_etag(&o.etag)),
                    key: o.key,
                    size: o.size,
                })
                .collect(),
            next_continuation_token: parsed.next_continuation_token,
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> std::result::Result<ObjectBody, StoreError> {
        let url = self
            .bucket(bucket)?
            .get_object(self.credentials.as_ref(), key)
            .sign(PRESIGN_DURATION);

        debug!(bucket, key, "S3 GET");
        let resp = Self::check(self.client.get(url).send().await?).await?;
        let encryption = resp
            .headers()
            .get(SSE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let customer_key = resp.headers().contains_key(SSE_CUSTOMER_HEADER);
        Ok(ObjectBody {
            data: resp.bytes().await?,
            encryption,
            customer_key,
        })
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> std::result::Result<String, StoreError> {
        let url = self
            .bucket(bucket)?
            .create_multipart_upload(self.credentials.as_ref(), key)
            .sign(PRESIGN_DURATION);

        debug!(bucket, key, "S3 CreateMultipartUpload");
        let resp = Self::check(self.client.post(url).send().await?).await?;
        let body = resp.text().await?;
        let parsed = CreateMultipartUpload::parse_response(&body)
            .map_err(|e| StoreError::Parse(format!("CreateMultipartUpload response: {e}")))?;
        Ok(parsed.upload_id().to_string())
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> std::result::Result<String, StoreError> {
        let url = self
            .bucket(bucket)?
            .upload_part(self.credentials.as_ref(), key, part_number, upload_id)
            .sign(PRESIGN_DURATION);

        debug!(bucket, key, part_number, bytes = body.len(), "S3 UploadPart");
        let resp = Self::check(self.client.put(url).body(body).send().await?).await?;
        resp.headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Parse(format!("part {part_number} response has no ETag")))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> std::result::Result<(), StoreError> {
        let bucket_handle = self.bucket(bucket)?;
        let action = bucket_handle.complete_multipart_upload(
            self.credentials.as_ref(),
            key,
            upload_id,
            parts.iter().map(|p| p.etag.as_str()),
        );
        let url = action.sign(PRESIGN_DURATION);
        let body = action.body();

        debug!(bucket, key, parts = parts.len(), "S3 CompleteMultipartUpload");
        let resp = Self::check(self.client.post(url).body(body).send().await?).await?;

        // S3 can report a failed completion inside a 200 response
        let text = resp.text().await?;
        if text.contains("<Error>") {
            return Err(StoreError::Status {
                status: 200,
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> std::result::Result<(), StoreError> {
        let url = self
            .bucket(bucket)?
            .abort_multipart_upload(self.credentials.as_ref(), key, upload_id)
            .sign(PRESIGN_DURATION);

        debug!(bucket, key, upload_id, "S3 AbortMultipartUpload");
        Self::check(self.client.delete(url).send().await?).await?;
        Ok(())
    }
}
