//! Routes a user message to one agent intent.
//!
//! The model is asked first; any failure (transport, timeout, unparseable
//! answer, unknown intent) falls back to keyword matching, so classification
//! never fails.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use tandem_core::domain::intent::{AgentIntent, ClassificationSource, IntentClassification};

use crate::llm::{ChatMessage, CompletionOptions, LlmClient};

const CLASSIFIER_TEMPERATURE: f32 = 0.1;

const SYSTEM_PROMPT: &str = "Classify the user's message for a therapy practice assistant. \
     Intents: booking (scheduling, availability, appointments), session (emotional support \
     during or about a therapy session), insights (practice statistics, progress, trends), \
     followup (check-ins and questionnaires), general (anything else). Answer with JSON only: \
     {\"intent\": \"<intent>\", \"confidence\": <0-100>, \"reasoning\": [\"<short reason>\"]}";

/// Ordered keyword table; the first matching row wins.
const KEYWORD_RULES: [(AgentIntent, u8, &[&str]); 4] = [
    (AgentIntent::Booking, 70, &["book", "appointment", "schedule", "reschedule", "availability"]),
    (AgentIntent::Session, 65, &["session", "feeling", "anxious", "panic", "overwhelmed"]),
    (AgentIntent::Insights, 60, &["insight", "progress", "trend", "dashboard", "report"]),
    (
        AgentIntent::Followup,
        60,
        &["follow up", "follow-up", "check-in", "check in", "questionnaire"],
    ),
];
const FALLBACK_CONFIDENCE: u8 = 50;

#[derive(Deserialize)]
struct RawClassification {
    intent: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<Value>,
}

pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn classify(
        &self,
        message: &str,
        context: &Map<String, Value>,
    ) -> IntentClassification {
        let mut prompt = message.to_string();
        if !context.is_empty() {
            prompt.push_str("\n\nContext: ");
            prompt.push_str(&Value::Object(context.clone()).to_string());
        }
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let options = CompletionOptions {
            temperature: Some(CLASSIFIER_TEMPERATURE),
            json_mode: true,
            ..CompletionOptions::default()
        };

        let reason = match self.llm.complete(&messages, &options).await {
            Ok(completion) => match parse_classification(&completion.content) {
                Some(classification) => {
                    debug!(
                        event_name = "intent.classified",
                        intent = classification.intent.as_str(),
                        confidence = classification.confidence,
                    );
                    return classification;
                }
                None => "model answer was not a valid classification".to_string(),
            },
            Err(error) => error.to_string(),
        };

        warn!(event_name = "intent.fallback", reason = %reason, "using keyword classification");
        keyword_classification(message)
    }
}

/// Accepts a bare JSON object or one wrapped in a markdown code fence.
pub fn parse_classification(content: &str) -> Option<IntentClassification> {
    let raw: RawClassification = serde_json::from_str(strip_code_fence(content)).ok()?;
    let intent = AgentIntent::parse(&raw.intent)?;
    let confidence = raw.confidence.unwrap_or(f64::from(FALLBACK_CONFIDENCE)).clamp(0.0, 100.0);
    let reasoning = match raw.reasoning {
        Some(Value::Array(items)) => {
            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
        }
        Some(Value::String(reason)) => vec![reason],
        _ => Vec::new(),
    };

    Some(IntentClassification {
        intent,
        confidence: confidence.round() as u8,
        reasoning,
        source: ClassificationSource::Llm,
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn keyword_classification(message: &str) -> IntentClassification {
    let lowered = message.to_lowercase();
    for (intent, confidence, keywords) in KEYWORD_RULES {
        if let Some(keyword) = keywords.iter().find(|keyword| lowered.contains(*keyword)) {
            return IntentClassification {
                intent,
                confidence,
                reasoning: vec![format!("matched keyword `{keyword}`")],
                source: ClassificationSource::Fallback,
            };
        }
    }
    IntentClassification {
        intent: AgentIntent::General,
        confidence: FALLBACK_CONFIDENCE,
        reasoning: vec!["no routing keyword matched".to_string()],
        source: ClassificationSource::Fallback,
    }
}
