//! Entities flowing through a sync run and the published snapshot.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use unify_auth_bridge::Platform;

/// Lightweight listing entry from a source; the body is fetched lazily.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateHeader {
    pub id: String,
    pub platform: Platform,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub link: Option<String>,
}

impl CandidateHeader {
    /// Text the cheap pre-filter runs on.
    pub fn prefilter_text(&self) -> String {
        if self.snippet.is_empty() {
            self.subject.clone()
        } else {
            format!("{} {}", self.subject, self.snippet)
        }
    }
}

/// A header that passed the pre-filter, with its full text.
#[derive(Debug, Clone)]
pub struct CandidateDocument {
    pub header: CandidateHeader,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocumentCategory {
    Event,
    Contact,
    Document,
    Financial,
    Administrative,
    #[default]
    Unknown,
}

impl DocumentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentCategory::Event => "event",
            DocumentCategory::Contact => "contact",
            DocumentCategory::Document => "document",
            DocumentCategory::Financial => "financial",
            DocumentCategory::Administrative => "administrative",
            DocumentCategory::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "event" | "events" => DocumentCategory::Event,
            "contact" | "contacts" => DocumentCategory::Contact,
            "document" | "documents" => DocumentCategory::Document,
            "financial" | "finance" => DocumentCategory::Financial,
            "administrative" | "admin" => DocumentCategory::Administrative,
            _ => DocumentCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Social,
    Cultural,
    Religious,
    Educational,
    Charity,
    Sports,
    Meeting,
    #[default]
    Other,
}

impl EventType {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "social" => EventType::Social,
            "cultural" | "culture" => EventType::Cultural,
            "religious" | "religion" => EventType::Religious,
            "educational" | "education" | "workshop" | "talk" | "lecture" => {
                EventType::Educational
            }
            "charity" | "fundraiser" | "fundraising" => EventType::Charity,
            "sports" | "sport" => EventType::Sports,
            "meeting" | "agm" | "egm" => EventType::Meeting,
            _ => EventType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    Vendor,
    Speaker,
    #[default]
    Partner,
    Alumni,
    Staff,
}

impl ContactType {
    /// Unrecognised labels fall back to `Partner`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "vendor" | "supplier" | "caterer" => ContactType::Vendor,
            "speaker" | "guest" => ContactType::Speaker,
            "partner" | "sponsor" => ContactType::Partner,
            "alumni" | "alumnus" | "alumna" => ContactType::Alumni,
            "staff" | "faculty" => ContactType::Staff,
            _ => ContactType::Partner,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEvent {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Best-effort date as the model wrote it ("2025-03-14", "mid March").
    pub start_date: String,
    #[serde(default)]
    pub end_date: Option<String>,
    pub event_type: EventType,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub expected_attendance: Option<u32>,
    #[serde(default)]
    pub budget_estimate: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_document_id: Option<String>,
    #[serde(default)]
    pub source_subject: Option<String>,
    pub confidence: f32,
}

impl ExtractedEvent {
    pub fn parsed_start(&self) -> Option<NaiveDate> {
        parse_iso_date(&self.start_date)
    }

    pub fn parsed_end(&self) -> Option<NaiveDate> {
        self.end_date.as_deref().and_then(parse_iso_date)
    }
}

fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedContact {
    pub name: String,
    pub contact_type: ContactType,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub organisation: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f32,
}

impl ExtractedContact {
    /// Lower-cased email when present, else lower-cased name.
    pub fn identity_key(&self) -> String {
        match self.email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => email.to_lowercase(),
            _ => self.name.trim().to_lowercase(),
        }
    }
}

/// Drive file that passed the relevance filter during the secondary check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelevantDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub link: Option<String>,
    pub modified_at: DateTime<Utc>,
    pub category: DocumentCategory,
    pub relevance_score: u8,
}

/// The published result of the last successful sync for one organisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncSnapshot {
    pub events: Vec<ExtractedEvent>,
    pub contacts: Vec<ExtractedContact>,
    pub insights: Vec<String>,
    #[serde(default)]
    pub documents: Vec<RelevantDocument>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            events: self.events.len(),
            contacts: self.contacts.len(),
            insights: self.insights.len(),
            documents: self.documents.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub events: usize,
    pub contacts: usize,
    pub insights: usize,
    pub documents: usize,
}

/// One contact per identity key; on collision the higher confidence wins and
/// the first seen wins a tie. Output keeps first-seen key order.
pub fn dedup_contacts(contacts: impl IntoIterator<Item = ExtractedContact>) -> Vec<ExtractedContact> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<ExtractedContact> = Vec::new();

    for contact in contacts {
        let key = contact.identity_key();
        if key.is_empty() {
            continue;
        }
        match slots.get(&key) {
            Some(&idx) => {
                if contact.confidence > out[idx].confidence {
                    out[idx] = contact;
                }
            }
            None => {
                slots.insert(key, out.len());
                out.push(contact);
            }
        }
    }
    out
}

/// Exact-value dedup, first occurrence kept.
pub fn dedup_insights(insights: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    insights
        .into_iter()
        .filter(|insight| seen.insert(insight.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(name: &str, email: Option<&str>, confidence: f32) -> ExtractedContact {
        ExtractedContact {
            name: name.to_string(),
            contact_type: ContactType::Vendor,
            email: email.map(str::to_string),
            phone: None,
            organisation: None,
            description: String::new(),
            tags: Vec::new(),
            confidence,
        }
    }

    #[test]
    fn test_identity_key_prefers_email() {
        assert_eq!(
            contact("Aisha", Some("Aisha@Caterers.ie "), 0.5).identity_key(),
            "aisha@caterers.ie"
        );
        assert_eq!(contact(" Aisha Khan ", None, 0.5).identity_key(), "aisha khan");
        assert_eq!(contact("Aisha Khan", Some("  "), 0.5).identity_key(), "aisha khan");
    }

    #[test]
    fn test_dedup_keeps_higher_confidence() {
        let deduped = dedup_contacts(vec![
            contact("Halal Bites", Some("orders@halalbites.ie"), 0.4),
            contact("Halal Bites Ltd", Some("ORDERS@halalbites.ie"), 0.9),
        ]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].confidence, 0.9);
        assert_eq!(deduped[0].name, "Halal Bites Ltd");
    }

    #[test]
    fn test_dedup_tie_keeps_first() {
        let deduped = dedup_contacts(vec![
            contact("Dr. Omar", None, 0.7),
            contact("dr. omar", None, 0.7),
            contact("Sarah", None, 0.2),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].name, "Dr. Omar");
        assert_eq!(deduped[1].name, "Sarah");
    }

    #[test]
    fn test_dedup_insights_exact_match_only() {
        let deduped = dedup_insights(vec![
            "Iftar attendance is growing".to_string(),
            "Iftar attendance is growing".to_string(),
            "iftar attendance is growing".to_string(),
        ]);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn test_event_date_parsing() {
        let mut event = ExtractedEvent {
            title: "Charity Iftar".to_string(),
            description: String::new(),
            start_date: "2025-03-14T18:30:00Z".to_string(),
            end_date: Some("sometime in April".to_string()),
            event_type: EventType::Charity,
            venue: None,
            expected_attendance: None,
            budget_estimate: None,
            tags: Vec::new(),
            source_document_id: None,
            source_subject: None,
            confidence: 0.8,
        };
        assert_eq!(event.parsed_start(), NaiveDate::from_ymd_opt(2025, 3, 14));
        assert_eq!(event.parsed_end(), None);

        event.start_date = "mid March".to_string();
        assert_eq!(event.parsed_start(), None);
    }

    #[test]
    fn test_label_fallbacks() {
        assert_eq!(EventType::from_label("Fundraiser"), EventType::Charity);
        assert_eq!(EventType::from_label("gala"), EventType::Other);
        assert_eq!(ContactType::from_label("SPEAKER"), ContactType::Speaker);
        assert_eq!(ContactType::from_label("cousin"), ContactType::Partner);
        assert_eq!(DocumentCategory::from_label("finance"), DocumentCategory::Financial);
        assert_eq!(DocumentCategory::from_label(""), DocumentCategory::Unknown);
    }
}
