//! Configuration types for s3packer

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest part size S3 accepts for every part but the last
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Object store connection settings
///
/// Credentials and endpoints are normally taken from the environment with
/// [`StoreConfig::from_env`]. All fields can also be set programmatically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Region used for request signing (default: "us-east-1")
    #[serde(default = "default_region")]
    pub region: String,

    /// Base endpoint URL for all buckets (None = AWS)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-bucket host template, `%(bucket)s` is replaced with the bucket name
    ///
    /// Takes precedence over `endpoint` when set.
    #[serde(default)]
    pub endpoint_template: Option<String>,

    /// Access key ID (None = anonymous requests)
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Secret access key
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Session token for temporary credentials
    #[serde(default)]
    pub session_token: Option<String>,

    /// Use path-style addressing instead of virtual-hosted buckets
    #[serde(default)]
    pub path_style: bool,

    /// Timeout for a single HTTP request (default: 5 minutes)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint: None,
            endpoint_template: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            path_style: false,
            request_timeout: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    /// Build a store configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a store configuration from an arbitrary variable lookup
    ///
    /// Recognized variables: `AWS_REGION` / `AWS_DEFAULT_REGION`,
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN`,
    /// `S3_ENDPOINT_BASE` (shared endpoint host) and `S3_ENDPOINT`
    /// (per-bucket host template).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let region = non_empty("AWS_REGION")
            .or_else(|| non_empty("AWS_DEFAULT_REGION"))
            .unwrap_or_else(default_region);

        // The AWS defaults for both variables mean "no override"
        let endpoint = non_empty("S3_ENDPOINT_BASE")
            .filter(|host| host != "s3.amazon.com")
            .map(|host| with_scheme(&host));
        let endpoint_template = non_empty("S3_ENDPOINT")
            .filter(|host| host != "%(bucket)s.s3.amazonaws.com")
            .map(|host| with_scheme(&host));

        Self {
            region,
            endpoint,
            endpoint_template,
            access_key_id: non_empty("AWS_ACCESS_KEY_ID"),
            secret_access_key: non_empty("AWS_SECRET_ACCESS_KEY"),
            session_token: non_empty("AWS_SESSION_TOKEN"),
            ..Self::default()
        }
    }

    /// Base endpoint URL for a bucket, and whether to use path-style addressing
    ///
    /// A `%(bucket)s.` host template is served virtual-host style from the
    /// remaining host; any other template is expanded and addressed by path.
    /// Custom shared endpoints (MinIO and friends) are always path-style.
    pub fn endpoint_for(&self, bucket: &str) -> (String, bool) {
        if let Some(template) = &self.endpoint_template {
            if template.contains("%(bucket)s.") {
                return (template.replacen("%(bucket)s.", "", 1), false);
            }
            return (template.replace("%(bucket)s", bucket), true);
        }
        match &self.endpoint {
            Some(endpoint) => (endpoint.clone(), true),
            None => (
                format!("https://s3.{}.amazonaws.com", self.region),
                self.path_style,
            ),
        }
    }
}

/// Entry order inside the produced archive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOrder {
    /// Entries appear as retrievals complete (fastest, order varies between runs)
    #[default]
    Completion,
    /// Entries appear in traversal order (reproducible, buffers out-of-order results)
    Enumeration,
}

/// Pipeline tuning knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum concurrent object retrievals (default: 16)
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Capacity of each handoff queue between stages (default: 1)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Buffer size of the archive byte pipe (default: 256 KiB)
    #[serde(default = "default_pipe_buffer")]
    pub pipe_buffer: usize,

    /// Multipart upload chunk size (default: 10 MiB, minimum 5 MiB)
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Deflate level for every entry, 1-9; 0 stores entries uncompressed (default: 9)
    #[serde(default = "default_compression_level")]
    pub compression_level: i64,

    /// Objects requested per listing page (default: 1000)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Order of entries in the archive
    #[serde(default)]
    pub entry_order: EntryOrder,

    /// Verify fetched bytes against single-part ETags (default: true)
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            queue_depth: default_queue_depth(),
            pipe_buffer: default_pipe_buffer(),
            part_size: default_part_size(),
            compression_level: default_compression_level(),
            page_size: default_page_size(),
            entry_order: EntryOrder::default(),
            verify_checksums: true,
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.fetch_concurrency == 0 {
            return Err(Error::config(
                "fetch_concurrency",
                "fetch_concurrency must be at least 1",
            ));
        }
        if self.queue_depth == 0 {
            return Err(Error::config("queue_depth", "queue_depth must be at least 1"));
        }
        if self.pipe_buffer == 0 {
            return Err(Error::config("pipe_buffer", "pipe_buffer must be at least 1"));
        }
        if self.part_size < MIN_PART_SIZE {
            return Err(Error::config(
                "part_size",
                format!(
                    "part_size {} is below the {} byte multipart minimum",
                    self.part_size, MIN_PART_SIZE
                ),
            ));
        }
        if !(0..=9).contains(&self.compression_level) {
            return Err(Error::config(
                "compression_level",
                format!("compression_level {} is outside 0-9", self.compression_level),
            ));
        }
        if self.page_size == 0 || self.page_size > 1000 {
            return Err(Error::config("page_size", "page_size must be within 1-1000"));
        }
        Ok(())
    }
}

/// Main configuration for a pack run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Object store connection settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Configuration with store settings from the environment and default tuning
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig::from_env(),
            pipeline: PipelineConfig::default(),
        }
    }

    /// Reject settings the pipeline or the store cannot run with
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.store.access_key_id.is_some() != self.store.secret_access_key.is_some() {
            return Err(Error::config(
                "access_key_id",
                "access key ID and secret access key must be set together",
            ));
        }
        Ok(())
    }
}

fn with_scheme(host: &str) -> String {
    if host.starts_with("http") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_fetch_concurrency() -> usize {
    16
}

fn default_queue_depth() -> usize {
    1
}

fn default_pipe_buffer() -> usize {
    256 * 1024
}

fn default_part_size() -> usize {
    10 * 1024 * 1024
}

fn default_compression_level() -> i64 {
    9
}

fn default_page_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}
