//! Data carried between the storage client, the recovery run and the report.
//!
//! Bucket and object descriptors deserialize straight from the storage
//! service's JSON resources via `serde`; the report types serialize back out
//! for the `--report` file.

pub mod bucket;
pub mod object;
pub mod report;

use serde::{Deserialize, Deserializer};

/// The service encodes 64-bit counters as JSON strings; accept either form.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

pub(crate) fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

pub(crate) fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
