//! Databricks File System (DBFS) storage backend.
//!
//! Maps the storage trait onto the DBFS 2.0 REST API. The API is slow,
//! throttles aggressively and forbids parallel use, so this backend keeps a
//! single request in flight and reports rate limiting as
//! [`Throttled`](ErrorKind::Throttled); wrap it in a
//! [`RetryingBackend`](super::RetryingBackend) to back off and retry.
//!
//! Writes go through `create` / `add-block` / `close`. Blocks are base64
//! encoded and limited to 1 MiB; data is visible at the target path as soon
//! as a block lands.

use crate::backend::{DEFAULT_MAX_BLOCK_SIZE, WriteHandle, check_block_size};
use crate::error::{ErrorKind, Result};
use crate::{FileInfo, StorageBackend, to_absolute_string, validate_path};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;

/// The API refuses parallel use from one client; keep a single request in flight.
const CONCURRENT_REQUESTS: usize = 1;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RATE_LIMIT_HEADER: &str = "x-envoy-ratelimited";

#[derive(Debug, Deserialize)]
struct ApiFileInfo {
    path: String,
    is_dir: bool,
    #[serde(default)]
    file_size: u64,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    modification_time: i64,
}
impl ApiFileInfo {
    fn into_file_info(self) -> Result<FileInfo> {
        let path = validate_path(&self.path)?;
        let modified = OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.modification_time) * 1_000_000)
            .map_err(|e| ErrorKind::BackendError(format!("timestamp out of range for {}: {e}", self.path)))?;
        Ok(if self.is_dir { FileInfo::dir(path, modified) } else { FileInfo::file(path, self.file_size, modified) })
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    files: Vec<ApiFileInfo>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    handle: u64,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    bytes_read: usize,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error_code: String,
    #[serde(default)]
    message: String,
}

/// Translate a DBFS error response into an actionable category.
fn api_error_kind(status: StatusCode, error: ApiError, path: &Path) -> ErrorKind {
    match error.error_code.as_str() {
        "RESOURCE_DOES_NOT_EXIST" => ErrorKind::NotFound(path.to_path_buf()),
        "RESOURCE_ALREADY_EXISTS" => ErrorKind::AlreadyExists(path.to_path_buf()),
        "PERMISSION_DENIED" => ErrorKind::PermissionDenied(path.to_path_buf()),
        "REQUEST_LIMIT_EXCEEDED" | "TOO_MANY_REQUESTS" => ErrorKind::Throttled,
        "TEMPORARILY_UNAVAILABLE" => ErrorKind::Network(error.message),
        _ if status.is_server_error() => ErrorKind::Network(format!("{}: {}", error.error_code, error.message)),
        _ => ErrorKind::BackendError(format!("{}: {}", error.error_code, error.message)),
    }
}

fn transport_error_kind(err: reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::BackendError(format!("unexpected response from API: {err}"))
    } else {
        ErrorKind::Network(err.to_string())
    }
}

/// DBFS storage backend.
///
/// # Examples
///
/// ```no_run
/// use fastdbfs_storage::backend::DbfsBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = DbfsBackend::new("DEFAULT", "https://adb-1234.azuredatabricks.net", "dapi...")?;
/// # Ok(())
/// # }
/// ```
pub struct DbfsBackend {
    name: String,
    client: Client,
    host: String,
    token: String,
    rate_limiter: Semaphore,
}

impl DbfsBackend {
    /// Create a new DBFS backend for the workspace at `host`.
    pub fn new(name: impl Into<String>, host: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let host = host.into().trim_end_matches('/').to_string();
        if !(host.starts_with("https://") || host.starts_with("http://")) {
            exn::bail!(ErrorKind::BackendError(format!("host must be an http(s) URL, got `{host}`")));
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("fastdbfs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ErrorKind::BackendError(format!("unable to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            client,
            host,
            token: token.into(),
            rate_limiter: Semaphore::new(CONCURRENT_REQUESTS),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/dbfs/{endpoint}", self.host)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)], path: &Path) -> Result<T> {
        let request = self.client.get(self.url(endpoint)).query(query);
        self.send(request, path).await
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: serde_json::Value, path: &Path) -> Result<T> {
        let request = self.client.post(self.url(endpoint)).json(&body);
        self.send(request, path).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, path: &Path) -> Result<T> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| ErrorKind::BackendError("request limiter closed".to_string()))?;
        let response = request.bearer_auth(&self.token).send().await.map_err(transport_error_kind)?;

        let status = response.status();
        let rate_limited = response.headers().get(RATE_LIMIT_HEADER).is_some_and(|value| value == "true");
        if rate_limited || status == StatusCode::TOO_MANY_REQUESTS {
            tracing::debug!(path = %path.display(), %status, "request rate limited");
            exn::bail!(ErrorKind::Throttled);
        }
        if status.is_success() {
            return Ok(response.json::<T>().await.map_err(transport_error_kind)?);
        }
        let body = response.text().await.map_err(transport_error_kind)?;
        match serde_json::from_str::<ApiError>(&body) {
            Ok(error) => exn::bail!(api_error_kind(status, error, path)),
            Err(_) if status.is_server_error() => exn::bail!(ErrorKind::Network(format!("HTTP {status}"))),
            Err(_) => exn::bail!(ErrorKind::BackendError(format!("HTTP {status}: {body}"))),
        }
    }
}

#[async_trait]
impl StorageBackend for DbfsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let info: ApiFileInfo = self.get("get-status", &[("path", to_absolute_string(&path))], &path).await?;
        info.into_file_info()
    }

    async fn list(&self, dir: &Path) -> Result<Vec<FileInfo>> {
        let dir = validate_path(dir)?;
        let response: ListResponse = self.get("list", &[("path", to_absolute_string(&dir))], &dir).await?;
        // Listing a file answers with the file itself.
        if let [only] = response.files.as_slice()
            && !only.is_dir
            && validate_path(&only.path)? == dir
        {
            exn::bail!(ErrorKind::NotADirectory(dir));
        }
        response.files.into_iter().map(ApiFileInfo::into_file_info).collect()
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        let _: IgnoredAny = self.post("mkdirs", json!({ "path": to_absolute_string(&path) }), &path).await?;
        Ok(())
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        let path = validate_path(path)?;
        if path.as_os_str().is_empty() {
            exn::bail!(ErrorKind::InvalidPath(path));
        }
        let body = json!({ "path": to_absolute_string(&path), "recursive": recursive });
        let _: IgnoredAny = self.post("delete", body, &path).await?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        // The move endpoint refuses existing destinations.
        if overwrite {
            return super::replace(self, &from, &to).await;
        }
        let body = json!({
            "source_path": to_absolute_string(&from),
            "destination_path": to_absolute_string(&to),
        });
        match self.post::<IgnoredAny>("move", body, &to).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => exn::bail!(ErrorKind::NotFound(from)),
            Err(err) => Err(err),
        }
    }

    async fn open_write(&self, path: &Path, overwrite: bool) -> Result<WriteHandle> {
        let path = validate_path(path)?;
        let body = json!({ "path": to_absolute_string(&path), "overwrite": overwrite });
        let response: CreateResponse = self.post("create", body, &path).await?;
        tracing::trace!(path = %path.display(), handle = response.handle, "opened remote write");
        Ok(WriteHandle(response.handle))
    }

    async fn append_block(&self, handle: WriteHandle, data: &[u8]) -> Result<()> {
        check_block_size(data, DEFAULT_MAX_BLOCK_SIZE)?;
        let body = json!({ "handle": handle.0, "data": BASE64.encode(data) });
        let _: IgnoredAny = self.post("add-block", body, &handle_path(handle)).await?;
        Ok(())
    }

    async fn close_write(&self, handle: WriteHandle) -> Result<()> {
        let _: IgnoredAny = self.post("close", json!({ "handle": handle.0 }), &handle_path(handle)).await?;
        Ok(())
    }

    async fn abort_write(&self, handle: WriteHandle) -> Result<()> {
        // The API has no abort; closing releases the handle and the caller removes the object.
        if let Err(err) = self.close_write(handle).await {
            tracing::debug!(handle = handle.0, "ignoring error while releasing handle: {err}");
        }
        Ok(())
    }

    async fn read_range(&self, path: &Path, offset: u64, length: usize) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let length = length.min(DEFAULT_MAX_BLOCK_SIZE);
        let query = [
            ("path", to_absolute_string(&path)),
            ("offset", offset.to_string()),
            ("length", length.to_string()),
        ];
        let response: ReadResponse = self.get("read", &query, &path).await?;
        let data = BASE64
            .decode(response.data.as_bytes())
            .map_err(|e| ErrorKind::BackendError(format!("invalid base64 payload for {}: {e}", path.display())))?;
        if data.len() != response.bytes_read {
            exn::bail!(ErrorKind::BackendError(format!(
                "read of {} reported {} bytes but carried {}",
                path.display(),
                response.bytes_read,
                data.len()
            )));
        }
        Ok(data)
    }

    fn max_block_size(&self) -> usize {
        DEFAULT_MAX_BLOCK_SIZE
    }
}

/// Handle-based calls have no path; errors name the handle instead.
fn handle_path(handle: WriteHandle) -> PathBuf {
    PathBuf::from(format!("<handle {}>", handle.0))
}
