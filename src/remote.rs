use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Externally managed OAuth token pair. Consent-flow mechanics live outside
/// this crate; tokens arrive via settings or the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

/// Narrow interface over the remote object-storage service.
///
/// `is_authenticated` must never trigger an interactive flow; shutdown-time
/// backups call it on the teardown path.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    fn is_authenticated(&self) -> bool;
    async fn upload(&self, path: &Path, name: &str) -> AppResult<RemoteObject>;
    async fn list(&self) -> AppResult<Vec<RemoteObject>>;
    async fn download(&self, id: &str, dest_path: &Path) -> AppResult<()>;
}

/// HTTP-backed remote store speaking a small JSON file API with bearer auth.
pub struct DriveRemote {
    base_url: String,
    client: reqwest::Client,
    tokens: RwLock<Option<TokenPair>>,
}

impl DriveRemote {
    pub fn new(base_url: impl Into<String>, tokens: Option<TokenPair>) -> Self {
        DriveRemote {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            tokens: RwLock::new(tokens),
        }
    }

    pub fn set_tokens(&self, tokens: Option<TokenPair>) {
        *self.tokens.write().unwrap_or_else(|e| e.into_inner()) = tokens;
    }

    fn bearer(&self) -> AppResult<String> {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| {
                AppError::new("REMOTE/UNAUTHENTICATED", "Remote storage is not connected")
            })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), tail)
    }
}

fn remote_error(context: &str, err: reqwest::Error) -> AppError {
    AppError::new("REMOTE/HTTP", "Remote storage request failed")
        .with_context("operation", context.to_string())
        .with_context("detail", err.to_string())
}

async fn ensure_success(context: &str, response: reqwest::Response) -> AppResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(
        AppError::new("REMOTE/STATUS", "Remote storage rejected the request")
            .with_context("operation", context.to_string())
            .with_context("status", status.as_u16().to_string()),
    )
}

#[async_trait]
impl RemoteStorage for DriveRemote {
    fn is_authenticated(&self) -> bool {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn upload(&self, path: &Path, name: &str) -> AppResult<RemoteObject> {
        let token = self.bearer()?;
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_upload_source")
                .with_context("path", path.display().to_string())
        })?;
        let response = self
            .client
            .post(self.url("files"))
            .bearer_auth(token)
            .query(&[("name", name)])
            .body(bytes)
            .send()
            .await
            .map_err(|err| remote_error("upload", err))?;
        let response = ensure_success("upload", response).await?;
        let object: RemoteObject = response
            .json()
            .await
            .map_err(|err| remote_error("upload_decode", err))?;
        Ok(object)
    }

    async fn list(&self) -> AppResult<Vec<RemoteObject>> {
        let token = self.bearer()?;
        let response = self
            .client
            .get(self.url("files"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| remote_error("list", err))?;
        let response = ensure_success("list", response).await?;
        let objects: Vec<RemoteObject> = response
            .json()
            .await
            .map_err(|err| remote_error("list_decode", err))?;
        Ok(objects)
    }

    async fn download(&self, id: &str, dest_path: &Path) -> AppResult<()> {
        let token = self.bearer()?;
        let response = self
            .client
            .get(self.url(&format!("files/{id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| remote_error("download", err))?;
        let response = ensure_success("download", response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| remote_error("download_body", err))?;
        crate::db::write_atomic(dest_path, &bytes).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_download")
                .with_context("path", dest_path.display().to_string())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_until_tokens_arrive() {
        let remote = DriveRemote::new("http://localhost:9", None);
        assert!(!remote.is_authenticated());
        remote.set_tokens(Some(TokenPair {
            access_token: "tok".into(),
            refresh_token: None,
        }));
        assert!(remote.is_authenticated());
    }

    #[test]
    fn url_join_handles_trailing_slash() {
        let remote = DriveRemote::new("http://host/api/", None);
        assert_eq!(remote.url("files"), "http://host/api/files");
    }
}
