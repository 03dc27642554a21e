//! Locating, parsing and validating model output.
//!
//! Model text is untrusted: it may wrap the JSON in prose or code fences,
//! use the wrong types, or omit fields. Parsing is lenient about shape and
//! strict about what survives validation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::model::{ContactType, DocumentCategory, EventType, ExtractedContact, ExtractedEvent};

const DEFAULT_CONFIDENCE: f32 = 0.5;
const UNDATED: &str = "TBD";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object in model output")]
    NoJsonObject,
    #[error("malformed JSON object: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Raw model output, before validation. A field of the wrong type reads as
/// absent rather than failing the whole object.
#[derive(Debug, Default, Deserialize)]
pub struct ExtractionPayload {
    #[serde(default, deserialize_with = "lenient_text")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub events: Option<Vec<RawEvent>>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub contacts: Option<Vec<RawContact>>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub insights: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default, alias = "name", deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: Option<String>,
    #[serde(default, alias = "date")]
    pub start_date: Option<Value>,
    #[serde(default)]
    pub end_date: Option<Value>,
    #[serde(default, alias = "type", deserialize_with = "lenient_text")]
    pub event_type: Option<String>,
    #[serde(default, alias = "location", deserialize_with = "lenient_text")]
    pub venue: Option<String>,
    #[serde(default)]
    pub expected_attendance: Option<Value>,
    #[serde(default, alias = "budget")]
    pub budget_estimate: Option<Value>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub tags: Option<Vec<Value>>,
    #[serde(default)]
    pub confidence: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawContact {
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(default, alias = "type", deserialize_with = "lenient_text")]
    pub contact_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<Value>,
    #[serde(default, alias = "organization", deserialize_with = "lenient_text")]
    pub organisation: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub tags: Option<Vec<Value>>,
    #[serde(default)]
    pub confidence: Option<Value>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_text(&value))
}

/// Arrays keep the elements that read as `T`; anything else is absent.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(Some(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
        )),
        _ => Ok(None),
    }
}

/// Validated entities from one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub category: DocumentCategory,
    pub events: Vec<ExtractedEvent>,
    pub contacts: Vec<ExtractedContact>,
    pub insights: Vec<String>,
}

impl ExtractionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.contacts.is_empty() && self.insights.is_empty()
    }
}

/// First balanced `{...}` span, ignoring braces inside JSON strings.
pub fn locate_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..=i]);
                    }
                }
                _ => {}
            }
        }
        // Unbalanced from this brace; try the next one.
        search_from = start + 1;
    }
    None
}

pub fn parse_extraction(text: &str) -> Result<ExtractionPayload, ParseError> {
    let span = locate_json_object(text).ok_or(ParseError::NoJsonObject)?;
    Ok(serde_json::from_str(span)?)
}

/// Turn a payload into typed entities, dropping anything unusable. Events are
/// tagged with the originating document.
pub fn validate(payload: ExtractionPayload, document_id: &str, subject: &str) -> ExtractionResult {
    let category = payload
        .category
        .as_deref()
        .map(DocumentCategory::from_label)
        .unwrap_or_default();

    let events = payload
        .events
        .unwrap_or_default()
        .into_iter()
        .filter_map(|raw| validate_event(raw, document_id, subject))
        .collect();

    let contacts = payload
        .contacts
        .unwrap_or_default()
        .into_iter()
        .filter_map(validate_contact)
        .collect();

    let insights = payload
        .insights
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| non_blank(value_text(&v)?))
        .collect();

    ExtractionResult {
        category,
        events,
        contacts,
        insights,
    }
}

fn validate_event(raw: RawEvent, document_id: &str, subject: &str) -> Option<ExtractedEvent> {
    let title = non_blank(raw.title?)?;
    Some(ExtractedEvent {
        title,
        description: raw.description.unwrap_or_default().trim().to_string(),
        start_date: raw
            .start_date
            .as_ref()
            .and_then(value_text)
            .and_then(non_blank)
            .unwrap_or_else(|| UNDATED.to_string()),
        end_date: raw.end_date.as_ref().and_then(value_text).and_then(non_blank),
        event_type: raw
            .event_type
            .as_deref()
            .map(EventType::from_label)
            .unwrap_or_default(),
        venue: raw.venue.and_then(non_blank),
        expected_attendance: raw
            .expected_attendance
            .as_ref()
            .and_then(value_number)
            .filter(|n| *n >= 0.0)
            .map(|n| n.round() as u32),
        budget_estimate: raw
            .budget_estimate
            .as_ref()
            .and_then(value_number)
            .filter(|n| *n >= 0.0),
        tags: tags(raw.tags),
        source_document_id: Some(document_id.to_string()),
        source_subject: non_blank(subject.to_string()),
        confidence: confidence(raw.confidence.as_ref()),
    })
}

fn validate_contact(raw: RawContact) -> Option<ExtractedContact> {
    let name = non_blank(raw.name?)?;
    Some(ExtractedContact {
        name,
        contact_type: raw
            .contact_type
            .as_deref()
            .map(ContactType::from_label)
            .unwrap_or_default(),
        email: raw
            .email
            .and_then(non_blank)
            .filter(|e| e.contains('@')),
        phone: raw.phone.as_ref().and_then(value_text).and_then(non_blank),
        organisation: raw.organisation.and_then(non_blank),
        description: raw.description.unwrap_or_default().trim().to_string(),
        tags: tags(raw.tags),
        confidence: confidence(raw.confidence.as_ref()),
    })
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers, or strings like "€1,200", "~150" and "-0.5".
fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let negative = s
                .chars()
                .take_while(|c| !c.is_ascii_digit() && *c != '.')
                .any(|c| c == '-');
            let mut cleaned = String::with_capacity(s.len() + 1);
            if negative {
                cleaned.push('-');
            }
            cleaned.extend(s.chars().filter(|c| c.is_ascii_digit() || *c == '.'));
            cleaned.parse().ok()
        }
        _ => None,
    }
}

fn confidence(value: Option<&Value>) -> f32 {
    match value.and_then(value_number) {
        Some(n) if n.is_finite() => n.clamp(0.0, 1.0) as f32,
        _ => DEFAULT_CONFIDENCE,
    }
}

fn tags(values: Option<Vec<Value>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .iter()
        .filter_map(value_text)
        .filter_map(non_blank)
        .collect()
}
