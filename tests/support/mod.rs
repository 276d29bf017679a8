#![allow(dead_code)]
//! In-process fake of the storage service's JSON API, for integration tests.
//!
//! ## Routes
//! - `POST   /storage/v1/b` create bucket
//! - `GET    /storage/v1/b/{bucket}` bucket metadata
//! - `DELETE /storage/v1/b/{bucket}` delete (soft-delete) bucket
//! - `POST   /storage/v1/b/{bucket}/restore` restore a generation
//! - `GET    /storage/v1/b/{bucket}/o` list objects (paged)
//! - `GET    /storage/v1/b/{bucket}/o/{object}` download (`alt=media`)
//! - `DELETE /storage/v1/b/{bucket}/o/{object}` delete object
//! - `POST   .../o/{object}/rewriteTo/b/{dst}/o/{dst_object}` server-side copy
//!
//! Deleting a bucket keeps it as soft-deleted under its generation, so it can
//! be restored later. [`Faults`] injects failures per object or per call, and
//! every request is logged as `METHOD /raw/path`.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose};
use bucket_recovery::services::{
    credentials::AccessToken,
    recovery_service::RecoveryOptions,
    storage_client::{ClientOptions, StorageClient},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path as FsPath,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{net::TcpListener, task::JoinHandle};

/// Failures to inject.
#[derive(Default, Debug, Clone)]
pub struct Faults {
    /// Object names whose rewrite returns 403.
    pub fail_copy: HashSet<String>,
    /// Object names whose delete returns 503.
    pub fail_delete: HashSet<String>,
    /// Object names whose download returns 500.
    pub fail_download: HashSet<String>,
    /// Object names listed with a wrong `md5Hash`.
    pub corrupt_md5: HashSet<String>,
    /// `(bucket, zero-based page)` that answers 503.
    pub fail_list_page: Option<(String, usize)>,
    /// Bucket delete answers 500 regardless of contents.
    pub fail_delete_bucket: bool,
    /// Status the restore call answers with instead of doing anything.
    pub restore_status: Option<u16>,
    /// Restored buckets stay invisible to the metadata call.
    pub invisible_after_restore: bool,
    /// Rewrites finish on the second call (first answers `done: false`).
    pub rewrite_in_two_steps: bool,
    /// Rewrites never finish and keep handing back the same token.
    pub stuck_rewrite: bool,
    /// Listings keep handing back the page token they were called with.
    pub repeat_page_token: bool,
    /// Object names stored gzip-encoded: listed with `contentEncoding: gzip`
    /// and the digest of the compressed bytes, served decompressed.
    pub gzip_encoded: HashSet<String>,
}

#[derive(Debug, Clone)]
struct FakeBucket {
    location: String,
    generation: u64,
    objects: BTreeMap<String, Bytes>,
}

#[derive(Default)]
struct Inner {
    active: BTreeMap<String, FakeBucket>,
    soft_deleted: HashMap<(String, u64), FakeBucket>,
    restored: HashSet<String>,
    faults: Faults,
    requests: Vec<String>,
    next_generation: u64,
}

/// Shared state of the fake service.
#[derive(Clone, Default)]
pub struct FakeStorage {
    inner: Arc<Mutex<Inner>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        let storage = Self::default();
        storage.lock().next_generation = 1000;
        storage
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh_generation(inner: &mut Inner) -> u64 {
        inner.next_generation += 1;
        inner.next_generation
    }

    /// Add a live bucket holding `objects`.
    pub fn with_active(self, bucket: &str, objects: &[(&str, &[u8])]) -> Self {
        {
            let mut inner = self.lock();
            let generation = Self::fresh_generation(&mut inner);
            inner.active.insert(bucket.to_string(), make_bucket(generation, objects));
        }
        self
    }

    /// Add a soft-deleted bucket restorable as `(bucket, generation)`.
    pub fn with_soft_deleted(self, bucket: &str, generation: u64, objects: &[(&str, &[u8])]) -> Self {
        self.lock()
            .soft_deleted
            .insert((bucket.to_string(), generation), make_bucket(generation, objects));
        self
    }

    pub fn with_faults(self, faults: Faults) -> Self {
        self.lock().faults = faults;
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    /// Requests whose `METHOD /path` starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    pub fn is_active(&self, bucket: &str) -> bool {
        self.lock().active.contains_key(bucket)
    }

    pub fn active_buckets(&self) -> Vec<String> {
        self.lock().active.keys().cloned().collect()
    }

    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .active
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object_bytes(&self, bucket: &str, object: &str) -> Option<Bytes> {
        self.lock()
            .active
            .get(bucket)
            .and_then(|b| b.objects.get(object).cloned())
    }
}

fn make_bucket(generation: u64, objects: &[(&str, &[u8])]) -> FakeBucket {
    FakeBucket {
        location: "US".into(),
        generation,
        objects: objects
            .iter()
            .map(|(name, data)| (name.to_string(), Bytes::copy_from_slice(data)))
            .collect(),
    }
}

/// Handle for a running fake; the server stops when it is dropped.
pub struct FakeServer {
    pub storage: FakeStorage,
    base_url: String,
    join: JoinHandle<()>,
}

impl FakeServer {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Client pointed at this server with a small page size so pagination
    /// is exercised.
    pub fn client(&self, page_size: u32) -> StorageClient {
        let options = ClientOptions {
            page_size,
            request_timeout: Duration::from_secs(10),
            project: Some("test-project".into()),
        };
        StorageClient::new(&self.base_url, options).unwrap()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.join.abort();
    }
}

pub fn token() -> AccessToken {
    AccessToken::new("test-token")
}

pub fn recovery_options(bucket: &str, generation: &str, output_dir: &FsPath) -> RecoveryOptions {
    RecoveryOptions {
        bucket: bucket.to_string(),
        generation: generation.to_string(),
        output_dir: output_dir.to_path_buf(),
        keep_restored: false,
        backup_location: "US".into(),
        grace_period: Duration::ZERO,
    }
}

/// Serve `storage` on an ephemeral local port.
pub async fn spawn(storage: FakeStorage) -> FakeServer {
    let app = routes()
        .layer(middleware::from_fn_with_state(storage.clone(), record_request))
        .with_state(storage.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let join = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    FakeServer {
        storage,
        base_url,
        join,
    }
}

fn routes() -> Router<FakeStorage> {
    Router::new()
        .route("/storage/v1/b", post(create_bucket))
        .route("/storage/v1/b/{bucket}", get(get_bucket).delete(delete_bucket))
        .route("/storage/v1/b/{bucket}/restore", post(restore_bucket))
        .route("/storage/v1/b/{bucket}/o", get(list_objects))
        .route(
            "/storage/v1/b/{bucket}/o/{object}",
            get(get_object).delete(delete_object),
        )
        .route(
            "/storage/v1/b/{bucket}/o/{object}/rewriteTo/b/{dst}/o/{dst_object}",
            post(rewrite_object),
        )
}

async fn record_request(State(storage): State<FakeStorage>, req: Request, next: Next) -> Response {
    let line = format!("{} {}", req.method(), req.uri().path());
    storage.lock().requests.push(line);
    next.run(req).await
}

fn error(status: StatusCode, message: &str) -> Response {
    let body = json!({"error": {"code": status.as_u16(), "message": message}});
    (status, Json(body)).into_response()
}

fn bucket_json(name: &str, bucket: &FakeBucket) -> Value {
    json!({
        "kind": "storage#bucket",
        "name": name,
        "location": bucket.location,
        "timeCreated": "2024-05-01T12:00:00.000Z",
        "generation": bucket.generation.to_string(),
    })
}

/// Stand-in for the compressed representation the service would store.
fn stored_gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut stored = b"\x1f\x8b".to_vec();
    stored.extend_from_slice(data);
    stored
}

fn md5_base64(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(data).0)
}

#[derive(Deserialize)]
struct CreateBucketReq {
    name: String,
    location: Option<String>,
}

async fn create_bucket(State(storage): State<FakeStorage>, Json(req): Json<CreateBucketReq>) -> Response {
    let mut inner = storage.lock();
    if inner.active.contains_key(&req.name) {
        return error(StatusCode::CONFLICT, "bucket already exists");
    }
    let generation = FakeStorage::fresh_generation(&mut inner);
    let bucket = FakeBucket {
        location: req.location.unwrap_or_else(|| "US".into()),
        generation,
        objects: BTreeMap::new(),
    };
    let body = bucket_json(&req.name, &bucket);
    inner.active.insert(req.name, bucket);
    (StatusCode::OK, Json(body)).into_response()
}

async fn get_bucket(State(storage): State<FakeStorage>, Path(bucket): Path<String>) -> Response {
    let inner = storage.lock();
    if inner.faults.invisible_after_restore && inner.restored.contains(&bucket) {
        return error(StatusCode::NOT_FOUND, "bucket not found");
    }
    match inner.active.get(&bucket) {
        Some(b) => (StatusCode::OK, Json(bucket_json(&bucket, b))).into_response(),
        None => error(StatusCode::NOT_FOUND, "bucket not found"),
    }
}

async fn delete_bucket(State(storage): State<FakeStorage>, Path(bucket): Path<String>) -> Response {
    let mut inner = storage.lock();
    if inner.faults.fail_delete_bucket {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "backend error");
    }
    match inner.active.get(&bucket) {
        None => return error(StatusCode::NOT_FOUND, "bucket not found"),
        Some(b) if !b.objects.is_empty() => {
            return error(StatusCode::CONFLICT, "the bucket you tried to delete is not empty");
        }
        Some(_) => {}
    }
    if let Some(removed) = inner.active.remove(&bucket) {
        inner.soft_deleted.insert((bucket, removed.generation), removed);
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
struct RestoreQuery {
    generation: u64,
}

async fn restore_bucket(
    State(storage): State<FakeStorage>,
    Path(bucket): Path<String>,
    Query(q): Query<RestoreQuery>,
) -> Response {
    let mut inner = storage.lock();
    if let Some(status) = inner.faults.restore_status {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return error(status, "restore rejected");
    }
    if inner.active.contains_key(&bucket) {
        return error(StatusCode::CONFLICT, "a live bucket already uses this name");
    }
    let Some(restored) = inner.soft_deleted.remove(&(bucket.clone(), q.generation)) else {
        return error(StatusCode::NOT_FOUND, "no soft-deleted bucket with that generation");
    };
    let body = bucket_json(&bucket, &restored);
    inner.active.insert(bucket.clone(), restored);
    inner.restored.insert(bucket);
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(rename = "maxResults")]
    max_results: Option<usize>,
    #[serde(rename = "pageToken")]
    page_token: Option<String>,
}

async fn list_objects(
    State(storage): State<FakeStorage>,
    Path(bucket): Path<String>,
    Query(q): Query<ListQuery>,
) -> Response {
    let inner = storage.lock();
    let Some(b) = inner.active.get(&bucket) else {
        return error(StatusCode::NOT_FOUND, "bucket not found");
    };
    let max = q.max_results.unwrap_or(1000).clamp(1, 1000);
    let offset = q.page_token.as_deref().map(decode_page_token).unwrap_or(0);
    let page = offset / max;
    if let Some((fail_bucket, fail_page)) = &inner.faults.fail_list_page {
        if *fail_bucket == bucket && *fail_page == page {
            return error(StatusCode::SERVICE_UNAVAILABLE, "backend unavailable");
        }
    }

    let items: Vec<Value> = b
        .objects
        .iter()
        .skip(offset)
        .take(max)
        .map(|(name, data)| {
            let gzip = inner.faults.gzip_encoded.contains(name);
            let md5 = if inner.faults.corrupt_md5.contains(name) {
                md5_base64(b"something else")
            } else if gzip {
                md5_base64(&stored_gzip_bytes(data))
            } else {
                md5_base64(data)
            };
            let mut item = json!({
                "kind": "storage#object",
                "name": name,
                "bucket": bucket,
                "size": data.len().to_string(),
                "generation": b.generation.to_string(),
                "md5Hash": md5,
                "contentType": "application/octet-stream",
            });
            if gzip {
                item["contentEncoding"] = Value::String("gzip".into());
            }
            item
        })
        .collect();

    let mut body = json!({"kind": "storage#objects"});
    if !items.is_empty() {
        body["items"] = Value::Array(items);
    }
    if inner.faults.repeat_page_token {
        let token = q.page_token.clone().unwrap_or_else(|| encode_page_token(offset + max));
        body["nextPageToken"] = Value::String(token);
    } else if offset + max < b.objects.len() {
        body["nextPageToken"] = Value::String(encode_page_token(offset + max));
    }
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Deserialize)]
struct ObjectQuery {
    alt: Option<String>,
}

async fn get_object(
    State(storage): State<FakeStorage>,
    Path((bucket, object)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
) -> Response {
    let inner = storage.lock();
    if q.alt.as_deref() != Some("media") {
        return error(StatusCode::BAD_REQUEST, "only alt=media is supported");
    }
    if inner.faults.fail_download.contains(&object) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "backend error while reading");
    }
    let Some(data) = inner
        .active
        .get(&bucket)
        .and_then(|b| b.objects.get(&object))
        .cloned()
    else {
        return error(StatusCode::NOT_FOUND, "object not found");
    };

    let mut response = Response::new(Body::from(data));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    response
}

async fn delete_object(
    State(storage): State<FakeStorage>,
    Path((bucket, object)): Path<(String, String)>,
) -> Response {
    let mut inner = storage.lock();
    if inner.faults.fail_delete.contains(&object) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "try again later");
    }
    match inner
        .active
        .get_mut(&bucket)
        .and_then(|b| b.objects.remove(&object))
    {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, "object not found"),
    }
}

#[derive(Deserialize)]
struct RewriteQuery {
    #[serde(rename = "rewriteToken")]
    rewrite_token: Option<String>,
}

async fn rewrite_object(
    State(storage): State<FakeStorage>,
    Path((src, object, dst, dst_object)): Path<(String, String, String, String)>,
    Query(q): Query<RewriteQuery>,
) -> Response {
    let mut inner = storage.lock();
    if inner.faults.fail_copy.contains(&object) {
        return error(StatusCode::FORBIDDEN, "copy denied");
    }
    let Some(data) = inner
        .active
        .get(&src)
        .and_then(|b| b.objects.get(&object))
        .cloned()
    else {
        return error(StatusCode::NOT_FOUND, "source object not found");
    };
    if !inner.active.contains_key(&dst) {
        return error(StatusCode::NOT_FOUND, "destination bucket not found");
    }
    if inner.faults.stuck_rewrite {
        let body = json!({"kind": "storage#rewriteResponse", "done": false, "rewriteToken": "again"});
        return (StatusCode::OK, Json(body)).into_response();
    }
    if inner.faults.rewrite_in_two_steps && q.rewrite_token.is_none() {
        let body = json!({"kind": "storage#rewriteResponse", "done": false, "rewriteToken": "step-2"});
        return (StatusCode::OK, Json(body)).into_response();
    }
    let size = data.len();
    if let Some(b) = inner.active.get_mut(&dst) {
        b.objects.insert(dst_object, data);
    }
    let body = json!({
        "kind": "storage#rewriteResponse",
        "totalBytesRewritten": size.to_string(),
        "objectSize": size.to_string(),
        "done": true,
    });
    (StatusCode::OK, Json(body)).into_response()
}

fn encode_page_token(offset: usize) -> String {
    general_purpose::STANDARD.encode(offset.to_string())
}

fn decode_page_token(token: &str) -> usize {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
