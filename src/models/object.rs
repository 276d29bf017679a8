//! Represents an object (blob) listed in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single listed object.
///
/// Describes the object only; the payload is fetched separately with a
/// download call or copied server-side.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescriptor {
    /// Object name (path-like identifier within the bucket).
    pub name: String,

    /// Bucket the object was listed from.
    #[serde(default)]
    pub bucket: String,

    /// Size in bytes.
    #[serde(default, deserialize_with = "super::de_u64")]
    pub size: u64,

    /// Object generation.
    #[serde(default, deserialize_with = "super::de_opt_u64")]
    pub generation: Option<u64>,

    /// Base64 MD5 digest of the payload, when the service computed one.
    #[serde(default)]
    pub md5_hash: Option<String>,

    /// Content type (MIME type).
    #[serde(default)]
    pub content_type: Option<String>,

    /// Stored content encoding, e.g. `gzip`.
    #[serde(default)]
    pub content_encoding: Option<String>,

    /// Timestamp of the last metadata or payload update.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl ObjectDescriptor {
    /// Stored gzip-compressed. Plain downloads are decompressed by the
    /// service, so their bytes do not match [`Self::md5_hash`].
    pub fn is_gzip_encoded(&self) -> bool {
        self.content_encoding
            .as_deref()
            .is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"))
    }
}

/// One page of a listing.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPage {
    #[serde(default)]
    pub items: Vec<ObjectDescriptor>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Result of a successful download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes written to the destination file.
    pub size: u64,
    /// Base64 MD5 digest of the bytes written, comparable to
    /// [`ObjectDescriptor::md5_hash`].
    pub md5_base64: String,
}
