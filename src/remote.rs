//! Off-machine copies of snapshots.
//!
//! Remote stores only ever see opaque archive blobs and logical keys of the
//! form `<game_id>/<snapshot name>.zip`. Credentials live in [`Session`] and
//! never reach the snapshot engine.

use crate::error::{CheckpointError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const DRIVE_ENDPOINT: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/drive/v3";
const APP_DATA_FOLDER: &str = "appDataFolder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub remote_id: String,
    pub logical_key: String,
    pub modified_time: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

/// Blob storage addressed by remote ids, scoped by game.
pub trait RemoteStore: Send + Sync {
    /// Stores `blob` under `logical_key` and returns the id assigned by the remote.
    fn upload(&self, blob: Vec<u8>, logical_key: &str) -> Result<String>;
    /// Entries whose logical key belongs to `game_scope`.
    fn list(&self, game_scope: &str) -> Result<Vec<RemoteEntry>>;
    fn download(&self, remote_id: &str) -> Result<Vec<u8>>;
    fn delete(&self, remote_id: &str) -> Result<()>;
}

pub fn remote_key(game_id: &str, snapshot_name: &str) -> String {
    let name = snapshot_name.trim().replace(['/', '\\'], "_");
    format!("{}/{}.zip", game_id, name)
}

/// Snapshot name encoded in a logical key, if the key has the expected shape.
pub fn snapshot_name_from_key(logical_key: &str) -> Option<&str> {
    let (_, file) = logical_key.split_once('/')?;
    let name = file.strip_suffix(".zip").unwrap_or(file);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Session {
    #[default]
    Unauthenticated,
    Google(GoogleSession),
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Session::Google(_))
    }
}

// --- Google Drive ---

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "modifiedTime", default)]
    modified_time: Option<DateTime<Utc>>,
    // Drive reports sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
}

#[derive(Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

impl From<DriveFile> for RemoteEntry {
    fn from(file: DriveFile) -> Self {
        RemoteEntry {
            remote_id: file.id,
            logical_key: file.name,
            modified_time: file.modified_time,
            size: file.size.and_then(|s| s.parse().ok()),
        }
    }
}

/// Google Drive v3 client storing archives in the app's hidden data folder.
pub struct DriveStore {
    client: reqwest::blocking::Client,
    access_token: String,
}

impl DriveStore {
    /// Only a signed-in Google session with an unexpired token is accepted.
    pub fn new(session: &Session) -> Result<Self> {
        let google = match session {
            Session::Google(google) => google,
            Session::Unauthenticated => {
                return Err(CheckpointError::Remote(
                    "not signed in to Google Drive".to_string(),
                ))
            }
        };
        if google.access_token.trim().is_empty() {
            return Err(CheckpointError::Remote("Google session has no access token".to_string()));
        }
        if google.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(CheckpointError::Remote("Google session has expired".to_string()));
        }

        let client = reqwest::blocking::Client::builder()
            .user_agent("checkpoint")
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(remote_error)?;

        Ok(Self {
            client,
            access_token: google.access_token.clone(),
        })
    }

    fn check(response: reqwest::blocking::Response, action: &str) -> Result<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(CheckpointError::Remote(format!(
            "Failed to {}: HTTP {} {}",
            action,
            status.as_u16(),
            body.trim()
        )))
    }
}

fn remote_error(e: reqwest::Error) -> CheckpointError {
    CheckpointError::Remote(e.to_string())
}

fn multipart_related_body(boundary: &str, metadata: &serde_json::Value, blob: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(blob.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
    body.extend_from_slice(blob);
    body.extend_from_slice(format!("\r\n--{}--", boundary).as_bytes());
    body
}

fn drive_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

impl RemoteStore for DriveStore {
    fn upload(&self, blob: Vec<u8>, logical_key: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }

        let boundary = format!("checkpoint-{}", Uuid::new_v4().simple());
        let metadata = serde_json::json!({
            "name": logical_key,
            "parents": [APP_DATA_FOLDER],
        });
        let size = blob.len();
        let body = multipart_related_body(&boundary, &metadata, &blob);

        let response = self
            .client
            .post(format!("{}/files", DRIVE_UPLOAD_ENDPOINT))
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .bearer_auth(&self.access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .map_err(remote_error)?;
        let created: Created = Self::check(response, "upload snapshot")?
            .json()
            .map_err(remote_error)?;

        log::info!("Uploaded {} ({} bytes) as {}", logical_key, size, created.id);
        Ok(created.id)
    }

    fn list(&self, game_scope: &str) -> Result<Vec<RemoteEntry>> {
        let query = format!(
            "name contains '{}/' and trashed = false",
            drive_query_literal(game_scope)
        );
        let prefix = format!("{}/", game_scope);

        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/files", DRIVE_ENDPOINT))
                .bearer_auth(&self.access_token)
                .query(&[
                    ("spaces", APP_DATA_FOLDER),
                    ("q", query.as_str()),
                    ("fields", "nextPageToken,files(id,name,modifiedTime,size)"),
                    ("orderBy", "modifiedTime desc"),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().map_err(remote_error)?;
            let page: DriveFileList = Self::check(response, "list cloud snapshots")?
                .json()
                .map_err(remote_error)?;

            // `contains` matches anywhere in the name.
            entries.extend(
                page.files
                    .into_iter()
                    .filter(|f| f.name.starts_with(&prefix))
                    .map(RemoteEntry::from),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(entries)
    }

    fn download(&self, remote_id: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/files/{}", DRIVE_ENDPOINT, remote_id))
            .query(&[("alt", "media")])
            .bearer_auth(&self.access_token)
            .send()
            .map_err(remote_error)?;
        let bytes = Self::check(response, "download snapshot")?
            .bytes()
            .map_err(remote_error)?;
        Ok(bytes.to_vec())
    }

    fn delete(&self, remote_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/files/{}", DRIVE_ENDPOINT, remote_id))
            .bearer_auth(&self.access_token)
            .send()
            .map_err(remote_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CheckpointError::NotFound {
                entity: "remote snapshot",
                id: remote_id.to_string(),
            });
        }
        Self::check(response, "delete cloud snapshot")?;
        Ok(())
    }
}

// --- In-memory ---

struct StoredBlob {
    entry: RemoteEntry,
    blob: Vec<u8>,
}

/// Process-local [`RemoteStore`], used by tests and offline setups.
#[derive(Default)]
pub struct MemoryRemote {
    blobs: Mutex<Vec<StoredBlob>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RemoteStore for MemoryRemote {
    fn upload(&self, blob: Vec<u8>, logical_key: &str) -> Result<String> {
        let remote_id = Uuid::new_v4().simple().to_string();
        let entry = RemoteEntry {
            remote_id: remote_id.clone(),
            logical_key: logical_key.to_string(),
            modified_time: Some(Utc::now()),
            size: Some(blob.len() as u64),
        };
        self.blobs.lock().push(StoredBlob { entry, blob });
        Ok(remote_id)
    }

    fn list(&self, game_scope: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = format!("{}/", game_scope);
        let mut entries: Vec<RemoteEntry> = self
            .blobs
            .lock()
            .iter()
            .filter(|stored| stored.entry.logical_key.starts_with(&prefix))
            .map(|stored| stored.entry.clone())
            .collect();
        entries.reverse();
        Ok(entries)
    }

    fn download(&self, remote_id: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .iter()
            .find(|stored| stored.entry.remote_id == remote_id)
            .map(|stored| stored.blob.clone())
            .ok_or_else(|| CheckpointError::NotFound {
                entity: "remote snapshot",
                id: remote_id.to_string(),
            })
    }

    fn delete(&self, remote_id: &str) -> Result<()> {
        let mut blobs = self.blobs.lock();
        let before = blobs.len();
        blobs.retain(|stored| stored.entry.remote_id != remote_id);
        if blobs.len() == before {
            return Err(CheckpointError::NotFound {
                entity: "remote snapshot",
                id: remote_id.to_string(),
            });
        }
        Ok(())
    }
}
