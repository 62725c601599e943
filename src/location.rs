//! Location strings: `s3://bucket/key` remote locations and local file paths

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Scheme identifying the remote object store
pub const REMOTE_SCHEME: &str = "s3";

/// Scheme identifying an explicit local file
pub const FILE_SCHEME: &str = "file";

/// A parsed location string
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Object or prefix in a bucket
    Remote {
        /// Bucket name
        bucket: String,
        /// Key or key prefix, without a leading slash (may be empty)
        key: String,
    },
    /// Path on the local filesystem
    Local(PathBuf),
}

impl Location {
    /// Split a location string into scheme, bucket and key
    ///
    /// Strings without a `scheme://` prefix are local paths. Unknown schemes are
    /// reported as [`Error::UnsupportedDestination`] so destination checks can
    /// surface them directly; [`Location::parse_source`] maps them to
    /// [`Error::InvalidLocation`].
    pub fn parse(uri: &str) -> Result<Self> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            if uri.trim().is_empty() {
                return Err(Error::invalid_location(uri, "empty location"));
            }
            return Ok(Location::Local(PathBuf::from(uri)));
        };

        match scheme.to_ascii_lowercase().as_str() {
            REMOTE_SCHEME => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(Error::invalid_location(uri, "missing bucket name"));
                }
                Ok(Location::Remote {
                    bucket: bucket.to_string(),
                    key: key.trim_start_matches('/').to_string(),
                })
            }
            FILE_SCHEME => {
                if rest.is_empty() {
                    return Err(Error::invalid_location(uri, "missing file path"));
                }
                Ok(Location::Local(PathBuf::from(rest)))
            }
            "" => Err(Error::invalid_location(uri, "missing scheme")),
            _ => Err(Error::UnsupportedDestination {
                location: uri.to_string(),
                scheme: scheme.to_string(),
            }),
        }
    }

    /// Parse a pack source, which must be a remote location
    pub fn parse_source(uri: &str) -> Result<SourceLocation> {
        match Self::parse(uri) {
            Ok(Location::Remote { bucket, key }) => Ok(SourceLocation {
                bucket,
                prefix: key,
            }),
            Ok(Location::Local(_)) | Err(Error::UnsupportedDestination { .. }) => Err(
                Error::invalid_location(uri, "sources must be prefixed with s3://"),
            ),
            Err(e) => Err(e),
        }
    }
}

/// A source to expand: everything whose key starts with `prefix`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    /// Bucket name
    pub bucket: String,
    /// Key prefix, empty for the whole bucket
    pub prefix: String,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{REMOTE_SCHEME}://{}/{}", self.bucket, self.prefix)
    }
}

/// How archive entries are named after their objects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryNaming {
    /// The object key
    #[default]
    Key,
    /// `bucket/key`, so equal keys from different buckets stay distinct
    BucketAndKey,
}

impl EntryNaming {
    /// Keys alone when every source is in one bucket, `bucket/key` otherwise
    pub fn for_sources(sources: &[SourceLocation]) -> Self {
        match sources.split_first() {
            Some((first, rest)) if rest.iter().any(|s| s.bucket != first.bucket) => {
                EntryNaming::BucketAndKey
            }
            _ => EntryNaming::Key,
        }
    }
}

/// One concrete object discovered by traversal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectLocator {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Size reported by the listing
    pub size: u64,
    /// ETag reported by the listing, quotes stripped
    pub etag: Option<String>,
    /// Position in traversal order, starting at 0
    pub seq: u64,
}

impl ObjectLocator {
    /// Rendered `bucket/key` path, unique within a run
    pub fn path(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Name of the archive entry for this object
    pub fn entry_name(&self, naming: EntryNaming) -> String {
        match naming {
            EntryNaming::Key => self.key.clone(),
            EntryNaming::BucketAndKey => self.path(),
        }
    }

    /// Zero-byte "folder" marker, archived as a directory entry
    pub fn is_directory(&self) -> bool {
        self.key.ends_with('/')
    }
}

impl std::fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{REMOTE_SCHEME}://{}/{}", self.bucket, self.key)
    }
}

/// Where the archive is delivered
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Multipart upload to a bucket
    Remote {
        /// Destination bucket
        bucket: String,
        /// Destination object key
        key: String,
    },
    /// Local file, created or truncated
    Local(PathBuf),
}

impl Destination {
    /// Resolve a destination string, rejecting anything no sink can write
    pub fn parse(uri: &str) -> Result<Self> {
        match Location::parse(uri)? {
            Location::Remote { bucket, key } => {
                if key.is_empty() || key.ends_with('/') {
                    return Err(Error::invalid_location(
                        uri,
                        "destination must name an object, not a prefix",
                    ));
                }
                Ok(Destination::Remote { bucket, key })
            }
            Location::Local(path) => Ok(Destination::Local(path)),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Remote { bucket, key } => write!(f, "{REMOTE_SCHEME}://{bucket}/{key}"),
            Destination::Local(path) => write!(f, "{}", path.display()),
        }
    }
}
