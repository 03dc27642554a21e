//! Message sources: bounded, most-recent-first listings of candidate headers
//! with lazy body fetch.
//!
//! Adapters for Google live next to this module. Every HTTP call goes through
//! [`call_with_backoff`] so rate limiting is handled in one place.

mod drive;
mod gmail;

pub use drive::DriveSource;
pub use gmail::GmailSource;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use unify_auth_bridge::{Credential, Platform};

use crate::model::CandidateHeader;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{origin} unavailable: {reason}")]
    Unavailable { origin: String, reason: String },
    #[error("{origin} rejected the credential (HTTP {status})")]
    Unauthorized { origin: String, status: u16 },
    #[error("{origin} returned an unreadable response: {reason}")]
    Decode { origin: String, reason: String },
}

impl SourceError {
    pub fn unavailable(origin: &str, reason: impl ToString) -> Self {
        SourceError::Unavailable {
            origin: origin.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(origin: &str, reason: impl ToString) -> Self {
        SourceError::Decode {
            origin: origin.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    fn platform(&self) -> Platform;

    /// Short identifier used in logs ("gmail", "drive").
    fn name(&self) -> &'static str;

    /// At most `max_results` headers, newest first.
    async fn list_recent(
        &self,
        credential: &Credential,
        max_results: usize,
    ) -> Result<Vec<CandidateHeader>, SourceError>;

    async fn fetch_body(&self, credential: &Credential, id: &str) -> Result<String, SourceError>;
}

/// Newest first, ties broken by id so listings are stable.
pub fn sort_most_recent_first(headers: &mut [CandidateHeader]) {
    headers.sort_by(|a, b| {
        b.received_at
            .cmp(&a.received_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const MAX_SERVER_ERROR_RETRIES: u32 = 3;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Send a request, retrying on 429 (honouring `Retry-After`) and on a
/// bounded number of server errors. 401 and 403 fail immediately.
pub async fn call_with_backoff<F>(
    origin: &str,
    mut builder_fn: F,
) -> Result<reqwest::Response, SourceError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut rate_limited = 0;
    let mut server_errors = 0;
    let mut delay = Duration::from_secs(1);

    loop {
        let response = builder_fn()
            .send()
            .await
            .map_err(|e| SourceError::unavailable(origin, e))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            if rate_limited >= MAX_RATE_LIMIT_RETRIES {
                return Err(SourceError::unavailable(
                    origin,
                    format!("rate limited after {} retries", rate_limited),
                ));
            }
            let wait = retry_after(response.headers()).unwrap_or(delay);
            warn!(
                "{}: rate limited, waiting {:?} (attempt {}/{})",
                origin,
                wait,
                rate_limited + 1,
                MAX_RATE_LIMIT_RETRIES
            );
            sleep(wait).await;
            rate_limited += 1;
            delay = std::cmp::min(delay * 2, MAX_BACKOFF);
            continue;
        }

        if status.is_server_error() && server_errors < MAX_SERVER_ERROR_RETRIES {
            warn!("{}: server error {}, retrying", origin, status);
            sleep(delay).await;
            server_errors += 1;
            delay = std::cmp::min(delay * 2, MAX_BACKOFF);
            continue;
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SourceError::Unauthorized {
                origin: origin.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        return Err(SourceError::unavailable(
            origin,
            format!("HTTP {} - {}", status, truncate(&body, 200)),
        ));
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Decode the handful of HTML entities Google puts in snippets.
pub(crate) fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use reqwest::header::HeaderValue;

    fn header(id: &str, secs: i64) -> CandidateHeader {
        CandidateHeader {
            id: id.to_string(),
            platform: Platform::Google,
            sender: String::new(),
            received_at: Utc.timestamp_opt(secs, 0).unwrap(),
            subject: String::new(),
            snippet: String::new(),
            link: None,
        }
    }

    #[test]
    fn test_sort_newest_first_with_id_tiebreak() {
        let mut headers = vec![header("b", 10), header("c", 30), header("a", 10)];
        sort_most_recent_first(&mut headers);
        let ids: Vec<&str> = headers.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(
            reqwest::header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_entities_and_truncate() {
        assert_eq!(
            decode_entities("Iftar &amp; talk &quot;tonight&quot; &lt;3"),
            "Iftar & talk \"tonight\" <3"
        );
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
