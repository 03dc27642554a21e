//! Google Drive adapter. Titles and descriptions act as the header; bodies are
//! plain-text exports of Docs, Sheets and Slides or raw `text/*` content.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use unify_auth_bridge::{Credential, Platform};

use super::{call_with_backoff, sort_most_recent_first, MessageSource, SourceError};
use crate::model::CandidateHeader;

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const LIST_FIELDS: &str = "files(id,name,mimeType,modifiedTime,webViewLink,description,owners(emailAddress,displayName),lastModifyingUser(emailAddress,displayName))";

pub struct DriveSource {
    http: Client,
    base_url: String,
}

impl DriveSource {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            base_url: DRIVE_API.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn download(&self, token: &str, url: &str, params: &[(&str, &str)]) -> Result<String, SourceError> {
        let response = call_with_backoff("drive", || {
            self.http.get(url).query(params).bearer_auth(token)
        })
        .await?;
        response
            .text()
            .await
            .map_err(|e| SourceError::decode("drive", e))
    }
}

/// How a file's text is obtained, by MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyRoute {
    Export(&'static str),
    Media,
    Unsupported,
}

fn body_route(mime_type: &str) -> BodyRoute {
    match mime_type {
        "application/vnd.google-apps.document" => BodyRoute::Export("text/plain"),
        "application/vnd.google-apps.presentation" => BodyRoute::Export("text/plain"),
        "application/vnd.google-apps.spreadsheet" => BodyRoute::Export("text/csv"),
        m if m.starts_with("text/") => BodyRoute::Media,
        _ => BodyRoute::Unsupported,
    }
}

#[async_trait]
impl MessageSource for DriveSource {
    fn platform(&self) -> Platform {
        Platform::Google
    }

    fn name(&self) -> &'static str {
        "drive"
    }

    async fn list_recent(
        &self,
        credential: &Credential,
        max_results: usize,
    ) -> Result<Vec<CandidateHeader>, SourceError> {
        if max_results == 0 {
            return Ok(Vec::new());
        }
        let token = credential.access_token.as_str();
        let url = format!("{}/files", self.base_url);
        let params = vec![
            ("q", "trashed = false".to_string()),
            ("orderBy", "modifiedTime desc".to_string()),
            ("pageSize", max_results.min(1000).to_string()),
            ("fields", LIST_FIELDS.to_string()),
        ];

        let response = call_with_backoff("drive", || {
            self.http.get(&url).query(&params).bearer_auth(token)
        })
        .await?;
        let list: DriveListResponse = response
            .json()
            .await
            .map_err(|e| SourceError::decode("drive", e))?;

        let mut headers: Vec<CandidateHeader> = list
            .files
            .unwrap_or_default()
            .into_iter()
            .map(header_from_file)
            .collect();
        sort_most_recent_first(&mut headers);
        headers.truncate(max_results);
        info!("drive: listed {} files", headers.len());
        Ok(headers)
    }

    async fn fetch_body(&self, credential: &Credential, id: &str) -> Result<String, SourceError> {
        let token = credential.access_token.as_str();
        let url = format!("{}/files/{}", self.base_url, id);
        let response = call_with_backoff("drive", || {
            self.http
                .get(&url)
                .query(&[("fields", "id,mimeType")])
                .bearer_auth(token)
        })
        .await?;
        let meta: DriveFileMeta = response
            .json()
            .await
            .map_err(|e| SourceError::decode("drive", e))?;

        let mime_type = meta.mime_type.unwrap_or_default();
        match body_route(&mime_type) {
            BodyRoute::Export(target) => {
                let export_url = format!("{}/export", url);
                self.download(token, &export_url, &[("mimeType", target)]).await
            }
            BodyRoute::Media => self.download(token, &url, &[("alt", "media")]).await,
            BodyRoute::Unsupported => Err(SourceError::decode(
                "drive",
                format!("no text rendition for {}", mime_type),
            )),
        }
    }
}

fn header_from_file(file: DriveFile) -> CandidateHeader {
    let received_at = file
        .modified_time
        .as_ref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let sender = file
        .owners
        .as_ref()
        .and_then(|owners| owners.iter().find_map(|o| o.email_address.clone()))
        .or_else(|| file.last_modifying_user.as_ref().and_then(|u| u.email_address.clone()))
        .unwrap_or_default();

    CandidateHeader {
        link: file
            .web_view_link
            .clone()
            .or_else(|| Some(format!("https://drive.google.com/open?id={}", file.id))),
        id: file.id,
        platform: Platform::Google,
        sender,
        received_at,
        subject: file.name,
        snippet: file.description.unwrap_or_default(),
    }
}

// --- API Response Types ---

#[derive(Debug, Clone, Deserialize)]
struct DriveListResponse {
    files: Option<Vec<DriveFile>>,
}

#[derive(Debug, Clone, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<String>,
    #[serde(rename = "webViewLink")]
    web_view_link: Option<String>,
    description: Option<String>,
    owners: Option<Vec<DriveUser>>,
    #[serde(rename = "lastModifyingUser")]
    last_modifying_user: Option<DriveUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct DriveFileMeta {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DriveUser {
    #[serde(rename = "emailAddress")]
    email_address: Option<String>,
}
