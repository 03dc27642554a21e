//! Gmail adapter over the REST API (`users.messages.list` / `get`).

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use unify_auth_bridge::{Credential, Platform};

use super::{call_with_backoff, decode_entities, sort_most_recent_first, MessageSource, SourceError};
use crate::model::CandidateHeader;

const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1";

static SCRIPT_STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
static BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*(br|/p|/div|/li|/tr|/h[1-6])\s*/?>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());

pub struct GmailSource {
    http: Client,
    base_url: String,
    query: Option<String>,
}

impl GmailSource {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            base_url: GMAIL_API.to_string(),
            query: None,
        }
    }

    /// Gmail search query applied to the listing (e.g. `newer_than:30d`).
    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.trim().is_empty());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_metadata(
        &self,
        token: &str,
        id: &str,
    ) -> Result<GmailMessage, SourceError> {
        let url = format!("{}/users/me/messages/{}", self.base_url, id);
        let response = call_with_backoff("gmail", || {
            self.http
                .get(&url)
                .query(&[
                    ("format", "metadata"),
                    ("metadataHeaders", "From"),
                    ("metadataHeaders", "Subject"),
                    ("metadataHeaders", "Date"),
                ])
                .bearer_auth(token)
        })
        .await?;
        response
            .json()
            .await
            .map_err(|e| SourceError::decode("gmail", e))
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn platform(&self) -> Platform {
        Platform::Google
    }

    fn name(&self) -> &'static str {
        "gmail"
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
        let url = format!("{}/users/me/messages", self.base_url);
        let mut params: Vec<(&str, String)> = vec![("maxResults", max_results.to_string())];
        if let Some(query) = &self.query {
            params.push(("q", query.clone()));
        }

        let response = call_with_backoff("gmail", || {
            self.http.get(&url).query(&params).bearer_auth(token)
        })
        .await?;
        let list: GmailListResponse = response
            .json()
            .await
            .map_err(|e| SourceError::decode("gmail", e))?;

        let refs = list.messages.unwrap_or_default();
        info!("gmail: listed {} message ids", refs.len());

        let mut headers = Vec::with_capacity(refs.len());
        for message_ref in refs.into_iter().take(max_results) {
            match self.get_metadata(token, &message_ref.id).await {
                Ok(message) => headers.push(header_from_message(message)),
                Err(SourceError::Unauthorized { origin, status }) => {
                    return Err(SourceError::Unauthorized { origin, status });
                }
                Err(e) => {
                    warn!(document_id = %message_ref.id, "gmail: skipping message: {}", e);
                }
            }
        }

        sort_most_recent_first(&mut headers);
        Ok(headers)
    }

    async fn fetch_body(&self, credential: &Credential, id: &str) -> Result<String, SourceError> {
        let url = format!("{}/users/me/messages/{}", self.base_url, id);
        let token = credential.access_token.as_str();
        let response = call_with_backoff("gmail", || {
            self.http
                .get(&url)
                .query(&[("format", "full")])
                .bearer_auth(token)
        })
        .await?;
        let message: GmailMessage = response
            .json()
            .await
            .map_err(|e| SourceError::decode("gmail", e))?;

        let body = message
            .payload
            .as_ref()
            .and_then(extract_body)
            .unwrap_or_default();
        if body.trim().is_empty() {
            debug!(document_id = %id, "gmail: no text part, using snippet");
            return Ok(decode_entities(message.snippet.as_deref().unwrap_or_default()));
        }
        Ok(body)
    }
}

fn header_from_message(message: GmailMessage) -> CandidateHeader {
    let headers = message
        .payload
        .as_ref()
        .and_then(|p| p.headers.clone())
        .unwrap_or_default();
    let find = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| h.value.clone())
    };

    let received_at = message
        .internal_date
        .as_ref()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| {
            find("date")
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })
        .unwrap_or_else(Utc::now);

    CandidateHeader {
        link: Some(format!("https://mail.google.com/mail/u/0/#inbox/{}", message.id)),
        id: message.id,
        platform: Platform::Google,
        sender: find("from").unwrap_or_default(),
        received_at,
        subject: find("subject").unwrap_or_else(|| "(No subject)".to_string()),
        snippet: decode_entities(message.snippet.as_deref().unwrap_or_default()),
    }
}

/// Prefer the first `text/plain` part anywhere in the tree, then `text/html`.
fn extract_body(payload: &GmailPayload) -> Option<String> {
    find_part(payload, "text/plain")
        .and_then(decode_part)
        .or_else(|| find_part(payload, "text/html").and_then(decode_part).map(|html| strip_html(&html)))
}

fn find_part<'a>(payload: &'a GmailPayload, mime: &str) -> Option<&'a GmailPayload> {
    let matches = payload
        .mime_type
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case(mime))
        .unwrap_or(false);
    if matches && payload.body.as_ref().and_then(|b| b.data.as_ref()).is_some() {
        return Some(payload);
    }
    payload
        .parts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find_map(|part| find_part(part, mime))
}

fn decode_part(part: &GmailPayload) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn strip_html(html: &str) -> String {
    let text = SCRIPT_STYLE_RE.replace_all(html, "");
    let text = BLOCK_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = SPACES_RE.replace_all(&text, " ");
    BLANK_LINES_RE.replace_all(&text, "\n\n").trim().to_string()
}

// --- API Response Types ---

#[derive(Debug, Clone, Deserialize)]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessage {
    id: String,
    snippet: Option<String>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<GmailPayload>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: Option<String>,
}
