//! Remote object-store client.
//!
//! The remote is a cloud-drive HTTP API: bearer-token-authenticated list,
//! upload and download of opaque named objects inside an application-scoped
//! folder. Sync logic talks to the [`RemoteStore`] trait so tests can run
//! against an in-memory remote.

use satchel_core::codec::CodecError;
use satchel_core::storage::{BoxFuture, StorageError};
use serde::Deserialize;
use thiserror::Error;

/// Drive errors.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed remote response: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One remote object, as returned by a listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
}

/// The remote object store.
pub trait RemoteStore: Send + Sync {
    /// All objects in the application folder. Implementations must follow
    /// pagination to completion before returning.
    fn list_objects(&self) -> BoxFuture<'_, Result<Vec<RemoteObject>, DriveError>>;

    /// Create an object named `name` with the given content.
    fn upload_object(&self, name: &str, data: Vec<u8>) -> BoxFuture<'_, Result<(), DriveError>>;

    /// Fetch the content of the object with the given id.
    fn download_object(&self, id: &str) -> BoxFuture<'_, Result<Vec<u8>, DriveError>>;
}

const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const PAGE_SIZE: u32 = 300;

#[derive(Debug, Deserialize)]
struct FileListPage {
    #[serde(default)]
    files: Vec<RemoteObject>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// [`RemoteStore`] over the drive HTTP API.
///
/// The caller already holds a bearer token; token acquisition and refresh
/// are outside this crate.
pub struct DriveClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_urls(token, DEFAULT_API_BASE, DEFAULT_UPLOAD_BASE)
    }

    /// Client against non-default endpoints (proxies, test servers).
    pub fn with_base_urls(
        token: impl Into<String>,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            api_base: api_base.into(),
            upload_base: upload_base.into(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DriveError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl RemoteStore for DriveClient {
    fn list_objects(&self) -> BoxFuture<'_, Result<Vec<RemoteObject>, DriveError>> {
        Box::pin(async move {
            let mut objects = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let mut url = format!(
                    "{}/files?spaces=appDataFolder&pageSize={PAGE_SIZE}",
                    self.api_base
                );
                if let Some(token) = &page_token {
                    url.push_str("&pageToken=");
                    url.push_str(token);
                }
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(&self.token)
                    .send()
                    .await?;
                let page: FileListPage = Self::check(response).await?.json().await?;
                objects.extend(page.files);
                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            Ok(objects)
        })
    }

    fn upload_object(&self, name: &str, data: Vec<u8>) -> BoxFuture<'_, Result<(), DriveError>> {
        let name = name.to_string();
        Box::pin(async move {
            let metadata = serde_json::json!({
                "name": name,
                "mimeType": "application/octet-stream",
                "parents": ["appDataFolder"],
            });
            let form = reqwest::multipart::Form::new()
                .part(
                    "metadata",
                    reqwest::multipart::Part::text(metadata.to_string())
                        .mime_str("application/json")?,
                )
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(data)
                        .mime_str("application/octet-stream")?,
                );

            let response = self
                .http
                .post(format!(
                    "{}/files?uploadType=multipart",
                    self.upload_base
                ))
                .bearer_auth(&self.token)
                .multipart(form)
                .send()
                .await?;
            Self::check(response).await?;
            Ok(())
        })
    }

    fn download_object(&self, id: &str) -> BoxFuture<'_, Result<Vec<u8>, DriveError>> {
        let id = id.to_string();
        Box::pin(async move {
            let response = self
                .http
                .get(format!("{}/files/{id}?alt=media", self.api_base))
                .bearer_auth(&self.token)
                .send()
                .await?;
            let bytes = Self::check(response).await?.bytes().await?;
            Ok(bytes.to_vec())
        })
    }
}
