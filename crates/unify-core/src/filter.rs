//! Keyword and sender-domain relevance scoring.
//!
//! Pure and deterministic: no I/O, no clock. The weights below are fixed;
//! changing them changes which emails reach the extractor.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::model::DocumentCategory;

pub const KEYWORD_WEIGHT: u32 = 15;
pub const KEYWORD_SCORE_CAP: u32 = 80;
pub const TRUSTED_DOMAIN_BONUS: u32 = 20;
pub const RELEVANCE_THRESHOLD: u8 = 30;
const MAX_SCORE: u32 = 100;

const EVENT_TERMS: &[&str] = &[
    "event", "iftar", "eid", "ramadan", "fundraiser", "charity", "gala", "dinner", "workshop",
    "lecture", "seminar", "conference", "talk", "social", "trip", "tournament", "competition",
    "ceremony", "festival", "meetup", "screening", "quiz", "bake sale", "open day", "freshers",
    "prayer", "jummah", "halaqa",
];

const CONTACT_TERMS: &[&str] = &[
    "speaker", "contact", "vendor", "supplier", "caterer", "catering", "sponsor", "partner",
    "alumni", "president", "treasurer", "secretary", "officer", "chairperson", "volunteer",
    "guest",
];

const FINANCIAL_TERMS: &[&str] = &[
    "invoice", "budget", "payment", "receipt", "fund", "raise", "grant", "donation", "ticket",
    "refund", "quote", "expense", "reimburse", "bank",
];

const ADMINISTRATIVE_TERMS: &[&str] = &[
    "agm", "egm", "minutes", "agenda", "constitution", "election", "meeting", "registration",
    "deadline", "policy", "room booking", "insurance", "risk assessment", "capitation",
];

const DOCUMENT_TERMS: &[&str] = &[
    "report", "proposal", "poster", "newsletter", "handbook", "brochure", "slides", "flyer",
    "template", "application form",
];

const ORGANISATION_TERMS: &[&str] = &[
    "society", "isoc", "muslim", "islamic", "student", "members", "membership", "committee",
    "venue", "auditorium", "campus",
];

const TRUSTED_DOMAINS: &[&str] = &[
    "tcd.ie",
    "tcdsu.org",
    "ucd.ie",
    "dcu.ie",
    "tudublin.ie",
    "ucc.ie",
    "universityofgalway.ie",
    "maynoothuniversity.ie",
];

/// Category sub-groups in priority order. Anything else that matched is a document.
const CATEGORY_GROUPS: &[(DocumentCategory, &[&str])] = &[
    (DocumentCategory::Event, EVENT_TERMS),
    (DocumentCategory::Contact, CONTACT_TERMS),
    (DocumentCategory::Financial, FINANCIAL_TERMS),
    (DocumentCategory::Administrative, ADMINISTRATIVE_TERMS),
];

static DEFAULT_FILTER: Lazy<RelevanceFilter> = Lazy::new(RelevanceFilter::default);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterVerdict {
    pub is_relevant: bool,
    pub relevance_score: u8,
    pub matched_keywords: Vec<String>,
    pub category: DocumentCategory,
}

#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    keywords: Vec<String>,
    trusted_domains: Vec<String>,
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        let mut keywords: Vec<String> = Vec::new();
        for term in EVENT_TERMS
            .iter()
            .chain(CONTACT_TERMS)
            .chain(FINANCIAL_TERMS)
            .chain(ADMINISTRATIVE_TERMS)
            .chain(DOCUMENT_TERMS)
            .chain(ORGANISATION_TERMS)
        {
            if !keywords.iter().any(|k| k == term) {
                keywords.push(term.to_string());
            }
        }
        Self {
            keywords,
            trusted_domains: TRUSTED_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl RelevanceFilter {
    /// Default vocabulary plus organisation-specific trusted domains.
    pub fn with_trusted_domains<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for domain in extra {
            let domain = domain.as_ref().trim().trim_start_matches('@').to_lowercase();
            if !domain.is_empty() && !filter.trusted_domains.contains(&domain) {
                filter.trusted_domains.push(domain);
            }
        }
        filter
    }

    pub fn trusted_domains(&self) -> &[String] {
        &self.trusted_domains
    }

    pub fn classify(&self, text: &str, sender: &str) -> FilterVerdict {
        let haystack = text.to_lowercase();
        let matched_keywords: Vec<String> = self
            .keywords
            .iter()
            .filter(|kw| haystack.contains(kw.as_str()))
            .cloned()
            .collect();

        let keyword_score = (KEYWORD_WEIGHT * matched_keywords.len() as u32).min(KEYWORD_SCORE_CAP);
        let sender = sender.to_lowercase();
        let domain_bonus = if self
            .trusted_domains
            .iter()
            .any(|domain| sender.contains(domain.as_str()))
        {
            TRUSTED_DOMAIN_BONUS
        } else {
            0
        };
        let relevance_score = (keyword_score + domain_bonus).min(MAX_SCORE) as u8;

        FilterVerdict {
            is_relevant: relevance_score >= RELEVANCE_THRESHOLD,
            relevance_score,
            category: categorize(&haystack, !matched_keywords.is_empty()),
            matched_keywords,
        }
    }
}

fn categorize(haystack: &str, any_match: bool) -> DocumentCategory {
    for (category, terms) in CATEGORY_GROUPS {
        if terms.iter().any(|term| haystack.contains(term)) {
            return *category;
        }
    }
    if any_match {
        DocumentCategory::Document
    } else {
        DocumentCategory::Unknown
    }
}

/// Classify with the built-in vocabulary and trusted domains.
pub fn classify(text: &str, sender: &str) -> FilterVerdict {
    DEFAULT_FILTER.classify(text, sender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_iftar_fundraiser_scores_full() {
        let verdict = classify("iftar fundraiser charity event", "someone@tcd.ie");
        assert!(verdict.matched_keywords.len() >= 4);
        assert_eq!(verdict.relevance_score, 100);
        assert!(verdict.is_relevant);
        assert_eq!(verdict.category, DocumentCategory::Event);
    }

    #[test]
    fn test_vendor_invoice_is_irrelevant() {
        let verdict = classify(
            "please see attached invoice for office chairs",
            "vendor@randomsupplier.com",
        );
        assert!(verdict.matched_keywords.len() <= 2);
        assert!(verdict.relevance_score < RELEVANCE_THRESHOLD);
        assert!(!verdict.is_relevant);
        assert_eq!(verdict.category, DocumentCategory::Financial);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let text = "AGM agenda and minutes for the Islamic Society";
        let first = classify(text, "secretary@tcdsu.org");
        let second = classify(text, "secretary@tcdsu.org");
        assert_eq!(first, second);
    }

    #[test]
    fn test_adding_keyword_never_lowers_score() {
        let sender = "someone@gmail.com";
        let mut text = String::new();
        let mut last = classify(&text, sender).relevance_score;
        for word in ["workshop", "budget", "speaker", "agenda", "poster", "venue", "quiz"] {
            text.push(' ');
            text.push_str(word);
            let score = classify(&text, sender).relevance_score;
            assert!(score >= last, "{} dropped score {} -> {}", word, last, score);
            assert!(score <= 100);
            last = score;
        }
        assert_eq!(last, KEYWORD_SCORE_CAP as u8);
    }

    #[test]
    fn test_distinct_keywords_only() {
        let verdict = classify("event event event", "x@example.com");
        assert_eq!(verdict.matched_keywords, vec!["event".to_string()]);
        assert_eq!(verdict.relevance_score, 15);
    }

    #[test]
    fn test_domain_bonus_alone_is_not_enough() {
        let verdict = classify("hello there", "registrar@tcd.ie");
        assert_eq!(verdict.relevance_score, 20);
        assert!(!verdict.is_relevant);
        assert_eq!(verdict.category, DocumentCategory::Unknown);
    }

    #[test]
    fn test_two_keywords_cross_threshold() {
        let verdict = classify("Speaker and caterer confirmed", "someone@gmail.com");
        assert_eq!(verdict.relevance_score, 30);
        assert!(verdict.is_relevant);
        assert_eq!(verdict.category, DocumentCategory::Contact);
    }

    #[test]
    fn test_category_priority_order() {
        assert_eq!(
            classify("budget for the gala", "").category,
            DocumentCategory::Event
        );
        assert_eq!(
            classify("caterer sent the budget", "").category,
            DocumentCategory::Contact
        );
        assert_eq!(
            classify("refund and agenda", "").category,
            DocumentCategory::Financial
        );
        assert_eq!(
            classify("constitution review", "").category,
            DocumentCategory::Administrative
        );
        assert_eq!(
            classify("newsletter poster", "").category,
            DocumentCategory::Document
        );
    }

    #[test]
    fn test_extra_trusted_domains() {
        let filter = RelevanceFilter::with_trusted_domains(["@isoc.example.org"]);
        let verdict = filter.classify("hello", "board@isoc.example.org");
        assert_eq!(verdict.relevance_score, 20);
        assert!(filter.trusted_domains().iter().any(|d| d == "isoc.example.org"));
    }
}
