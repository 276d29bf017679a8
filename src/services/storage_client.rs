//! src/services/storage_client.rs
//!
//! StorageClient: typed wrapper over the storage service's JSON API.
//! One method per control-plane or data-plane call. Each maps HTTP statuses to
//! a typed result or an [`ApiError`]; nothing here retries, and the caller
//! supplies the bearer token on every call.

use crate::{
    errors::{ApiError, ClientBuildError, Operation},
    models::{
        bucket::{BucketMetadata, CreateOutcome},
        object::{DownloadOutcome, ObjectDescriptor, ObjectPage},
    },
    services::credentials::AccessToken,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
pub const MAX_PAGE_SIZE: u32 = 1000;

/// The storage operations a recovery run is built from.
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// True only when the bucket's metadata call returns 200. Any other
    /// outcome, including transport failures, is `false`.
    async fn bucket_exists(&self, token: &AccessToken, bucket: &str) -> bool;

    /// Every object in `bucket`, following page tokens to the end. A failing
    /// page fails the whole call; partial listings are never returned.
    async fn list_all_objects(
        &self,
        token: &AccessToken,
        bucket: &str,
    ) -> Result<Vec<ObjectDescriptor>, ApiError>;

    async fn create_bucket(
        &self,
        token: &AccessToken,
        bucket: &str,
        location: &str,
    ) -> Result<CreateOutcome, ApiError>;

    /// Server-side copy of one object; the payload never passes through us.
    async fn copy_object(
        &self,
        token: &AccessToken,
        src_bucket: &str,
        dst_bucket: &str,
        object: &str,
    ) -> Result<(), ApiError>;

    async fn delete_object(
        &self,
        token: &AccessToken,
        bucket: &str,
        object: &str,
    ) -> Result<(), ApiError>;

    /// Only succeeds on an empty bucket.
    async fn delete_bucket(&self, token: &AccessToken, bucket: &str) -> Result<(), ApiError>;

    async fn restore_bucket(
        &self,
        token: &AccessToken,
        bucket: &str,
        generation: &str,
    ) -> Result<BucketMetadata, ApiError>;

    /// Stream one object to `dest`. Nothing is left at `dest` on failure.
    async fn download_object(
        &self,
        token: &AccessToken,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, ApiError>;
}

/// Tunables for [`StorageClient`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Listing page size, clamped to `1..=MAX_PAGE_SIZE`.
    pub page_size: u32,
    pub request_timeout: Duration,
    /// Project new buckets are billed to, when the service requires one.
    pub project: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            request_timeout: Duration::from_secs(120),
            project: None,
        }
    }
}

/// HTTP implementation of [`StorageApi`].
#[derive(Clone, Debug)]
pub struct StorageClient {
    http: Client,
    base_url: Url,
    options: ClientOptions,
}

#[derive(Serialize)]
struct CreateBucketBody<'a> {
    name: &'a str,
    location: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    rewrite_token: Option<String>,
}

impl StorageClient {
    /// Build a client for the service rooted at `endpoint`.
    pub fn new(endpoint: &str, options: ClientOptions) -> Result<Self, ClientBuildError> {
        let base_url = Url::parse(endpoint).map_err(|err| ClientBuildError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: err.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ClientBuildError::InvalidEndpoint {
                url: endpoint.to_string(),
                reason: "not a hierarchical URL".into(),
            });
        }
        let http = Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        let options = ClientOptions {
            page_size: options.page_size.clamp(1, MAX_PAGE_SIZE),
            ..options
        };
        Ok(Self {
            http,
            base_url,
            options,
        })
    }

    /// `base_url` + `storage/v1/b` + `segments`, each segment percent-encoded
    /// on its own so object names keep their slashes inside one segment.
    fn url(&self, op: Operation, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::transport(op, "endpoint cannot carry a path"))?
            .pop_if_empty()
            .extend(["storage", "v1", "b"])
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        op: Operation,
        token: &AccessToken,
        request: RequestBuilder,
    ) -> Result<Response, ApiError> {
        request
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|err| ApiError::transport(op, err))
    }

    /// Fetch bucket metadata.
    pub async fn bucket_metadata(
        &self,
        token: &AccessToken,
        bucket: &str,
    ) -> Result<BucketMetadata, ApiError> {
        let op = Operation::BucketMetadata;
        let url = self.url(op, &[bucket])?;
        let response = self.send(op, token, self.http.get(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(error_from(op, response).await);
        }
        parse_json(op, response).await
    }

    async fn list_page(
        &self,
        token: &AccessToken,
        bucket: &str,
        page_token: Option<&str>,
    ) -> Result<ObjectPage, ApiError> {
        let op = Operation::ListObjects;
        let mut url = self.url(op, &[bucket, "o"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxResults", &self.options.page_size.to_string());
            if let Some(page_token) = page_token {
                query.append_pair("pageToken", page_token);
            }
        }
        let response = self.send(op, token, self.http.get(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(error_from(op, response).await);
        }
        parse_json(op, response).await
    }

    async fn rewrite_step(
        &self,
        token: &AccessToken,
        src_bucket: &str,
        dst_bucket: &str,
        object: &str,
        rewrite_token: Option<&str>,
    ) -> Result<RewriteResponse, ApiError> {
        let op = Operation::CopyObject;
        let mut url = self.url(op, &[src_bucket, "o", object, "rewriteTo", "b", dst_bucket, "o", object])?;
        if let Some(rewrite_token) = rewrite_token {
            url.query_pairs_mut()
                .append_pair("rewriteToken", rewrite_token);
        }
        let response = self.send(op, token, self.http.post(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(error_from(op, response).await);
        }
        parse_json(op, response).await
    }

    /// Delete request shared by objects and buckets: 200 or 204 is success.
    async fn delete(
        &self,
        op: Operation,
        token: &AccessToken,
        segments: &[&str],
    ) -> Result<(), ApiError> {
        let url = self.url(op, segments)?;
        let response = self.send(op, token, self.http.delete(url)).await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(error_from(op, response).await),
        }
    }
}

#[async_trait]
impl StorageApi for StorageClient {
    async fn bucket_exists(&self, token: &AccessToken, bucket: &str) -> bool {
        match self.bucket_metadata(token, bucket).await {
            Ok(_) => true,
            Err(err) => {
                debug!("bucket `{}` treated as absent: {}", bucket, err);
                false
            }
        }
    }

    async fn list_all_objects(
        &self,
        token: &AccessToken,
        bucket: &str,
    ) -> Result<Vec<ObjectDescriptor>, ApiError> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        let mut pages = 0usize;
        loop {
            let page = self.list_page(token, bucket, page_token.as_deref()).await?;
            pages += 1;
            objects.extend(page.items.into_iter().map(|mut obj| {
                if obj.bucket.is_empty() {
                    obj.bucket = bucket.to_string();
                }
                obj
            }));
            match page.next_page_token {
                Some(next) if !next.is_empty() => {
                    if !seen_tokens.insert(next.clone()) {
                        return Err(ApiError::http(
                            Operation::ListObjects,
                            StatusCode::OK.as_u16(),
                            "service returned a page token it had already issued",
                        ));
                    }
                    page_token = Some(next);
                }
                _ => break,
            }
        }
        debug!(
            "listed {} object(s) in `{}` over {} page(s)",
            objects.len(),
            bucket,
            pages
        );
        Ok(objects)
    }

    async fn create_bucket(
        &self,
        token: &AccessToken,
        bucket: &str,
        location: &str,
    ) -> Result<CreateOutcome, ApiError> {
        let op = Operation::CreateBucket;
        let mut url = self.url(op, &[])?;
        if let Some(project) = &self.options.project {
            url.query_pairs_mut().append_pair("project", project);
        }
        let body = CreateBucketBody {
            name: bucket,
            location,
        };
        let response = self
            .send(op, token, self.http.post(url).json(&body))
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(CreateOutcome::Created),
            StatusCode::CONFLICT => Ok(CreateOutcome::AlreadyExists),
            _ => Err(error_from(op, response).await),
        }
    }

    async fn copy_object(
        &self,
        token: &AccessToken,
        src_bucket: &str,
        dst_bucket: &str,
        object: &str,
    ) -> Result<(), ApiError> {
        let mut rewrite_token: Option<String> = None;
        loop {
            let step = self
                .rewrite_step(token, src_bucket, dst_bucket, object, rewrite_token.as_deref())
                .await?;
            if step.done.unwrap_or(true) {
                return Ok(());
            }
            match step.rewrite_token {
                Some(next) if rewrite_token.as_deref() == Some(next.as_str()) => {
                    return Err(ApiError::http(
                        Operation::CopyObject,
                        StatusCode::OK.as_u16(),
                        "service repeated the previous rewrite token",
                    ));
                }
                Some(next) => {
                    debug!("copy of `{}` continues with a rewrite token", object);
                    rewrite_token = Some(next);
                }
                None => {
                    return Err(ApiError::http(
                        Operation::CopyObject,
                        StatusCode::OK.as_u16(),
                        "rewrite not done and no rewrite token returned",
                    ));
                }
            }
        }
    }

    async fn delete_object(
        &self,
        token: &AccessToken,
        bucket: &str,
        object: &str,
    ) -> Result<(), ApiError> {
        self.delete(Operation::DeleteObject, token, &[bucket, "o", object])
            .await
    }

    async fn delete_bucket(&self, token: &AccessToken, bucket: &str) -> Result<(), ApiError> {
        self.delete(Operation::DeleteBucket, token, &[bucket]).await
    }

    async fn restore_bucket(
        &self,
        token: &AccessToken,
        bucket: &str,
        generation: &str,
    ) -> Result<BucketMetadata, ApiError> {
        let op = Operation::RestoreBucket;
        let mut url = self.url(op, &[bucket, "restore"])?;
        url.query_pairs_mut().append_pair("generation", generation);
        let response = self.send(op, token, self.http.post(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(error_from(op, response).await);
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<BucketMetadata>(&body) {
            Ok(meta) => Ok(meta),
            Err(err) => {
                debug!("restore response for `{}` not parseable: {}", bucket, err);
                Ok(BucketMetadata {
                    name: bucket.to_string(),
                    location: None,
                    time_created: None,
                    generation: generation.parse().ok(),
                })
            }
        }
    }

    async fn download_object(
        &self,
        token: &AccessToken,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, ApiError> {
        let op = Operation::DownloadObject;
        let mut url = self.url(op, &[bucket, "o", object])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self.send(op, token, self.http.get(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(error_from(op, response).await);
        }
        stream_to_file(response, dest).await
    }
}

/// Write the response body to a temporary sibling of `dest`, fsync it and
/// rename it into place. The temporary file is removed on any error.
async fn stream_to_file(response: Response, dest: &Path) -> Result<DownloadOutcome, ApiError> {
    let op = Operation::DownloadObject;
    let io_err = |err: io::Error| ApiError::transport(op, format!("{}: {}", dest.display(), err));

    let tmp_path = temp_sibling(dest).map_err(io_err)?;
    let mut file = File::create(&tmp_path).await.map_err(io_err)?;

    let mut size: u64 = 0;
    let mut digest = md5::Context::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ApiError::transport(op, err));
            }
        };
        size += chunk.len() as u64;
        digest.consume(&chunk);
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_err(err));
        }
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(io_err(err));
    }
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(io_err(err));
    }
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, dest).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(io_err(err));
    }

    Ok(DownloadOutcome {
        size,
        md5_base64: general_purpose::STANDARD.encode(digest.compute().0),
    })
}

fn temp_sibling(dest: &Path) -> io::Result<PathBuf> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::other("destination has no parent directory"))?;
    Ok(parent.join(format!(".part-{}", Uuid::new_v4())))
}

async fn error_from(op: Operation, response: Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ApiError::http(op, status, &body)
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    op: Operation,
    response: Response,
) -> Result<T, ApiError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|err| ApiError::transport(op, err))?;
    serde_json::from_str(&body)
        .map_err(|err| ApiError::http(op, status, &format!("unexpected response body ({err}): {body}")))
}
