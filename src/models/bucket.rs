//! Represents a bucket as reported by the storage service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bucket metadata returned by the metadata and restore calls.
///
/// Only the fields an operator needs to confirm a restore are kept; anything
/// else in the service's resource is ignored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetadata {
    /// Globally unique bucket name.
    pub name: String,

    /// Location the bucket lives in (e.g. "US", "EUROPE-WEST1").
    #[serde(default)]
    pub location: Option<String>,

    /// When this bucket (generation) was created.
    #[serde(default)]
    pub time_created: Option<DateTime<Utc>>,

    /// Generation of the bucket; addresses it once soft-deleted.
    #[serde(default, deserialize_with = "super::de_opt_u64")]
    pub generation: Option<u64>,
}

/// Outcome of a create-bucket call; a name conflict is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}
