//! Structured extraction: prompt a language model per document and keep only
//! what validates.

pub mod llm;
mod parse;
mod prompt;

pub use llm::{AnthropicModel, DisabledModel, GeminiModel, LanguageModel, LlmError};
pub use parse::{
    locate_json_object, parse_extraction, validate, ExtractionPayload, ExtractionResult, ParseError,
};
pub use prompt::{build_prompt, truncate_chars, ExtractionInput};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::model::{dedup_contacts, dedup_insights, ExtractedContact, ExtractedEvent};

pub const DEFAULT_MAX_PROMPT_CHARS: usize = 8000;
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EXTRACT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub max_prompt_chars: usize,
    pub llm_timeout: Duration,
    /// Pause between consecutive model calls in a batch.
    pub extract_delay: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            llm_timeout: DEFAULT_LLM_TIMEOUT,
            extract_delay: DEFAULT_EXTRACT_DELAY,
        }
    }
}

/// Merged output of a batch. Contacts and insights are already deduplicated.
#[derive(Debug, Clone, Default)]
pub struct BatchExtraction {
    pub events: Vec<ExtractedEvent>,
    pub contacts: Vec<ExtractedContact>,
    pub insights: Vec<String>,
    pub documents_processed: usize,
    pub documents_empty: usize,
}

pub struct Extractor {
    model: Arc<dyn LanguageModel>,
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(model: Arc<dyn LanguageModel>, config: ExtractorConfig) -> Self {
        Self { model, config }
    }

    pub fn model_id(&self) -> &str {
        self.model.id()
    }

    /// Extract from one document. Only fatal model errors are returned;
    /// everything else degrades to an empty result.
    pub async fn extract(&self, input: &ExtractionInput) -> Result<ExtractionResult, LlmError> {
        let prompt = build_prompt(input, self.config.max_prompt_chars);

        let output = match timeout(self.config.llm_timeout, self.model.generate(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) if err.is_fatal() => return Err(err),
            Ok(Err(err)) => {
                warn!(document_id = %input.document_id, "model call failed: {}", err);
                return Ok(ExtractionResult::empty());
            }
            Err(_) => {
                warn!(
                    document_id = %input.document_id,
                    "model call timed out after {:?}", self.config.llm_timeout
                );
                return Ok(ExtractionResult::empty());
            }
        };

        match parse_extraction(&output) {
            Ok(payload) => {
                let result = validate(payload, &input.document_id, &input.subject);
                debug!(
                    document_id = %input.document_id,
                    events = result.events.len(),
                    contacts = result.contacts.len(),
                    "extracted"
                );
                Ok(result)
            }
            Err(err) => {
                warn!(document_id = %input.document_id, "discarding model output: {}", err);
                Ok(ExtractionResult::empty())
            }
        }
    }

    /// Sequential extraction with a fixed pause between calls. `on_item`
    /// runs after each document with (done, total).
    pub async fn extract_batch<F>(
        &self,
        inputs: &[ExtractionInput],
        mut on_item: F,
    ) -> Result<BatchExtraction, LlmError>
    where
        F: FnMut(usize, usize),
    {
        let mut events = Vec::new();
        let mut contacts = Vec::new();
        let mut insights = Vec::new();
        let mut documents_empty = 0;

        for (idx, input) in inputs.iter().enumerate() {
            if idx > 0 && !self.config.extract_delay.is_zero() {
                sleep(self.config.extract_delay).await;
            }
            let result = self.extract(input).await?;
            if result.is_empty() {
                documents_empty += 1;
            }
            events.extend(result.events);
            contacts.extend(result.contacts);
            insights.extend(result.insights);
            on_item(idx + 1, inputs.len());
        }

        Ok(BatchExtraction {
            events,
            contacts: dedup_contacts(contacts),
            insights: dedup_insights(insights),
            documents_processed: inputs.len(),
            documents_empty,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedModel;
    use super::*;
    use crate::model::ContactType;

    fn input(id: &str) -> ExtractionInput {
        ExtractionInput {
            document_id: id.to_string(),
            subject: format!("subject {}", id),
            sender: "isoc@tcd.ie".to_string(),
            date: None,
            text: "Charity iftar on 14 March, catering by Halal Bites".to_string(),
        }
    }

    fn fast_config() -> ExtractorConfig {
        ExtractorConfig {
            extract_delay: Duration::ZERO,
            ..ExtractorConfig::default()
        }
    }

    const IFTAR_JSON: &str = r#"Here is the data:
{"category": "event",
 "events": [{"title": "Charity Iftar", "start_date": "2025-03-14", "event_type": "charity", "confidence": 0.9}],
 "contacts": [{"name": "Halal Bites", "contact_type": "vendor", "email": "orders@halalbites.ie", "confidence": 0.4}],
 "insights": ["Iftars draw the biggest crowds"]}"#;

    #[tokio::test]
    async fn test_non_json_output_yields_empty_result() {
        let model = Arc::new(ScriptedModel::new("Sorry, I can't help with that."));
        let extractor = Extractor::new(model.clone(), fast_config());

        let result = extractor.extract(&input("m1")).await.unwrap();
        assert_eq!(result, ExtractionResult::empty());
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_wrapped_json_is_extracted_and_tagged() {
        let extractor = Extractor::new(Arc::new(ScriptedModel::new(IFTAR_JSON)), fast_config());

        let result = extractor.extract(&input("m1")).await.unwrap();
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].source_document_id.as_deref(), Some("m1"));
        assert_eq!(result.events[0].source_subject.as_deref(), Some("subject m1"));
        assert_eq!(result.contacts[0].contact_type, ContactType::Vendor);
    }

    #[tokio::test]
    async fn test_transient_model_error_degrades() {
        let model = ScriptedModel::new(IFTAR_JSON)
            .then(Err(LlmError::RateLimited { retry_after_secs: Some(1) }));
        let extractor = Extractor::new(Arc::new(model), fast_config());

        assert!(extractor.extract(&input("m1")).await.unwrap().is_empty());
        assert_eq!(extractor.extract(&input("m2")).await.unwrap().events.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_degrades() {
        let model = ScriptedModel::new(IFTAR_JSON).with_latency(Duration::from_millis(200));
        let extractor = Extractor::new(
            Arc::new(model),
            ExtractorConfig {
                llm_timeout: Duration::from_millis(20),
                ..fast_config()
            },
        );
        assert!(extractor.extract(&input("slow")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_merges_and_dedups() {
        let higher = IFTAR_JSON.replace("0.4", "0.9").replace("Halal Bites\"", "Halal Bites Ltd\"");
        let model = ScriptedModel::new("nothing")
            .then(Ok(IFTAR_JSON.to_string()))
            .then(Ok("no json".to_string()))
            .then(Ok(higher));
        let extractor = Extractor::new(Arc::new(model), fast_config());

        let mut seen = Vec::new();
        let batch = extractor
            .extract_batch(&[input("a"), input("b"), input("c")], |done, total| {
                seen.push((done, total))
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(batch.documents_processed, 3);
        assert_eq!(batch.documents_empty, 1);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.contacts.len(), 1);
        assert_eq!(batch.contacts[0].confidence, 0.9);
        assert_eq!(batch.contacts[0].name, "Halal Bites Ltd");
        assert_eq!(batch.insights.len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_batch() {
        let model = Arc::new(
            ScriptedModel::new(IFTAR_JSON)
                .then(Ok(IFTAR_JSON.to_string()))
                .then(Err(LlmError::Unauthorized(401))),
        );
        let extractor = Extractor::new(model.clone(), fast_config());

        let err = extractor
            .extract_batch(&[input("a"), input("b"), input("c")], |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unauthorized(401)));
        assert_eq!(model.call_count(), 2);
    }
}
