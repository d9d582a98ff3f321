//! Secondary backend: third-party document store reached over HTTPS with OAuth.
//!
//! Every request is authorized with a token from [`CredentialManager`]. A 401
//! from the API forces one refresh and the request is replayed exactly once.

use super::{
    cancellable, BackendId, ByteStream, ContentDigest, ObjectStat, PutOutcome, StorageAdapter,
    StoreHints,
};
use crate::credentials::CredentialManager;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Body, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use urlencoding::encode;

/// Connection settings for the secondary document store.
#[derive(Clone, Debug)]
pub struct SecondaryConfig {
    /// Metadata API root, e.g. `https://www.googleapis.com/drive/v3`
    pub api_base_url: String,
    /// Content upload root, e.g. `https://www.googleapis.com/upload/drive/v3`
    pub upload_base_url: String,
    /// Folder new files are created in; listing is scoped to it when set.
    pub folder_id: Option<String>,
    /// Credential that authorizes every request.
    pub credential_id: String,
    /// Applies to metadata calls. Content transfers are bounded by cancellation.
    pub request_timeout: Duration,
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeField {
    Text(String),
    Number(u64),
}

impl SizeField {
    fn as_u64(&self) -> u64 {
        match self {
            SizeField::Text(text) => text.parse().unwrap_or(0),
            SizeField::Number(n) => *n,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    size: Option<SizeField>,
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct FileEntry {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
    next_page_token: Option<String>,
}

/// Request bodies must be `Sync`; the stream is only ever polled through
/// `&mut`, so the mutex is never contended.
struct SyncBody(Mutex<ByteStream>);

impl Stream for SyncBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .0
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .poll_next_unpin(cx)
    }
}

/// OAuth-authorized adapter over a Drive-style files API.
pub struct SecondaryAdapter {
    config: SecondaryConfig,
    credentials: CredentialManager,
    http: reqwest::Client,
}

impl SecondaryAdapter {
    pub fn new(mut config: SecondaryConfig, credentials: CredentialManager) -> Result<Self> {
        config.api_base_url = config.api_base_url.trim_end_matches('/').to_string();
        config.upload_base_url = config.upload_base_url.trim_end_matches('/').to_string();

        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            credentials,
            http,
        })
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.config.api_base_url, encode(file_id))
    }

    /// Sends a replayable request with a current access token.
    ///
    /// On 401 the token is force-refreshed and the request rebuilt and sent
    /// once more. A second 401 is `Error::Unauthorized`. Returns the token that
    /// authorized the final attempt together with the response.
    async fn send_authorized<F>(
        &self,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<(String, Response)>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let credential_id = self.config.credential_id.as_str();

        let token = cancellable(cancel, self.credentials.get_access_token(credential_id)).await?;
        let response = cancellable(cancel, async {
            Ok::<_, Error>(build(&token).send().await?)
        })
        .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok((token, response));
        }

        debug!(
            credential_id = %credential_id,
            "Secondary backend rejected access token, forcing refresh"
        );

        let token =
            cancellable(cancel, self.credentials.force_refresh(credential_id, &token)).await?;
        let response = cancellable(cancel, async {
            Ok::<_, Error>(build(&token).send().await?)
        })
        .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(
                credential_id = %credential_id,
                "Secondary backend rejected a freshly refreshed token"
            );
            return Err(Error::Unauthorized);
        }

        Ok((token, response))
    }

    /// Best-effort removal of an object whose upload did not complete.
    ///
    /// Runs even when the caller's token has fired; failure is only logged.
    async fn discard_partial(&self, file_id: &str) {
        match self.delete(file_id, &CancellationToken::new()).await {
            Ok(()) => info!(native_ref = %file_id, "Removed partial object from secondary backend"),
            Err(e) => warn!(
                native_ref = %file_id,
                error = %e,
                "Failed to remove partial object from secondary backend"
            ),
        }
    }
}

/// Maps a non-success response to the error taxonomy.
async fn check_status(response: Response, native_ref: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Error::NotFound(native_ref.to_string()),
        StatusCode::UNAUTHORIZED => Error::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::TransientBackend(format!("status {}: {}", status.as_u16(), message))
        }
        s if s.is_server_error() => {
            Error::TransientBackend(format!("status {}: {}", s.as_u16(), message))
        }
        s => Error::BackendRejected {
            status: s.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl StorageAdapter for SecondaryAdapter {
    fn backend(&self) -> BackendId {
        BackendId::Secondary
    }

    async fn put(
        &self,
        body: ByteStream,
        _size_hint: Option<u64>,
        content_type: &str,
        hints: &StoreHints,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome> {
        let name = hints
            .file_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let mut metadata = json!({ "name": name, "mimeType": content_type });
        if let Some(folder) = &self.config.folder_id {
            metadata["parents"] = json!([folder]);
        }

        let create_url = format!("{}/files", self.config.api_base_url);
        let (token, response) = self
            .send_authorized(cancel, |token| {
                self.http
                    .post(&create_url)
                    .bearer_auth(token)
                    .query(&[("fields", "id")])
                    .timeout(self.config.request_timeout)
                    .json(&metadata)
            })
            .await?;
        let created: CreatedFile = check_status(response, "new file").await?.json().await?;

        debug!(native_ref = %created.id, "Created file record on secondary backend");

        let digest = ContentDigest::default();
        let upload = self
            .http
            .patch(format!(
                "{}/files/{}",
                self.config.upload_base_url,
                encode(&created.id)
            ))
            .query(&[("uploadType", "media")])
            .bearer_auth(&token)
            .header(CONTENT_TYPE, content_type)
            .body(Body::wrap_stream(SyncBody(Mutex::new(digest.observe(body)))));

        let uploaded = cancellable(cancel, async {
            let response = upload.send().await?;
            check_status(response, &created.id).await?;
            Ok::<_, Error>(())
        })
        .await;

        if let Err(e) = uploaded {
            warn!(
                native_ref = %created.id,
                error = %e,
                "Upload to secondary backend did not complete"
            );
            if matches!(e, Error::Unauthorized) {
                // The streamed body cannot be replayed; replace the token so the
                // cleanup below and the caller's next attempt do not reuse it.
                if let Err(refresh_err) = self
                    .credentials
                    .force_refresh(&self.config.credential_id, &token)
                    .await
                {
                    warn!(
                        credential_id = %self.config.credential_id,
                        error = %refresh_err,
                        "Failed to refresh token rejected during upload"
                    );
                }
            }
            self.discard_partial(&created.id).await;
            return Err(e);
        }

        let (size_bytes, checksum) = digest.finish();
        info!(native_ref = %created.id, size_bytes, "Stored object on secondary backend");

        Ok(PutOutcome {
            native_ref: created.id,
            size_bytes,
            checksum,
        })
    }

    async fn get(&self, native_ref: &str, cancel: &CancellationToken) -> Result<ByteStream> {
        let url = self.file_url(native_ref);
        let (_, response) = self
            .send_authorized(cancel, |token| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("alt", "media")])
            })
            .await?;
        let response = check_status(response, native_ref).await?;

        Ok(response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed())
    }

    async fn delete(&self, native_ref: &str, cancel: &CancellationToken) -> Result<()> {
        let url = self.file_url(native_ref);
        let (_, response) = self
            .send_authorized(cancel, |token| {
                self.http
                    .delete(&url)
                    .bearer_auth(token)
                    .timeout(self.config.request_timeout)
            })
            .await?;

        match check_status(response, native_ref).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, native_ref: &str, cancel: &CancellationToken) -> Result<ObjectStat> {
        let url = self.file_url(native_ref);
        let (_, response) = self
            .send_authorized(cancel, |token| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .header(ACCEPT, "application/json")
                    .query(&[("fields", "id,size,mimeType")])
                    .timeout(self.config.request_timeout)
            })
            .await?;

        let response = match check_status(response, native_ref).await {
            Ok(response) => response,
            Err(Error::NotFound(_)) => return Ok(ObjectStat::missing()),
            Err(e) => return Err(e),
        };
        let resource: FileResource = response.json().await?;

        Ok(ObjectStat {
            exists: true,
            size_bytes: resource.size.as_ref().map(SizeField::as_u64).unwrap_or(0),
            content_type: resource.mime_type,
        })
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let url = format!("{}/files", self.config.api_base_url);
        let query = match &self.config.folder_id {
            Some(folder) => format!("'{}' in parents and trashed = false", folder),
            None => "trashed = false".to_string(),
        };

        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let (_, response) = self
                .send_authorized(cancel, |token| {
                    let request = self
                        .http
                        .get(&url)
                        .bearer_auth(token)
                        .query(&[
                            ("q", query.as_str()),
                            ("fields", "nextPageToken,files(id)"),
                        ])
                        .timeout(self.config.request_timeout);
                    match &page_token {
                        Some(page) => request.query(&[("pageToken", page.as_str())]),
                        None => request,
                    }
                })
                .await?;

            let page: FileList = check_status(response, "file list").await?.json().await?;
            refs.extend(page.files.into_iter().map(|file| file.id));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(refs)
    }
}
