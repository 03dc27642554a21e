use chrono::{DateTime, Utc};

use crate::model::CandidateDocument;

/// One document handed to the extractor.
#[derive(Debug, Clone)]
pub struct ExtractionInput {
    pub document_id: String,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub text: String,
}

impl From<CandidateDocument> for ExtractionInput {
    fn from(document: CandidateDocument) -> Self {
        let CandidateDocument { header, body } = document;
        Self {
            document_id: header.id,
            subject: header.subject,
            sender: header.sender,
            date: Some(header.received_at),
            text: body,
        }
    }
}

/// Longest prefix of `text` that fits in `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn build_prompt(input: &ExtractionInput, max_chars: usize) -> String {
    let date = input
        .date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let body = truncate_chars(&input.text, max_chars);

    format!(
        r#"You extract structured data for a student society from one email or document.

Return only a JSON object with this shape:
{{
  "category": "event" | "contact" | "document" | "financial" | "administrative" | "unknown",
  "events": [{{
    "title": string,
    "description": string,
    "start_date": "YYYY-MM-DD" or best guess,
    "end_date": string or null,
    "event_type": "social" | "cultural" | "religious" | "educational" | "charity" | "sports" | "meeting" | "other",
    "venue": string or null,
    "expected_attendance": number or null,
    "budget_estimate": number or null,
    "tags": [string],
    "confidence": number between 0 and 1
  }}],
  "contacts": [{{
    "name": string,
    "contact_type": "vendor" | "speaker" | "partner" | "alumni" | "staff",
    "email": string or null,
    "phone": string or null,
    "organisation": string or null,
    "description": string,
    "tags": [string],
    "confidence": number between 0 and 1
  }}],
  "insights": [string]
}}

Use empty arrays when nothing applies. Do not invent details that are not in the text.

Subject: {subject}
From: {sender}
Date: {date}

---
{body}
---"#,
        subject = input.subject,
        sender = input.sender,
        date = date,
        body = body,
    )
}
