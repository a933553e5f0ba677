//! Intent classification
//!
//! Textual perception events (transcripts, notifications, wake words) go
//! through the LLM classifier under a timeout; non-textual events synthesize
//! a default intent from their kind. Classifier output is compact JSON; a
//! keyword heuristic catches malformed replies.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::llm::{CompletionRequest, LlmClient};

/// A classified intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub intent: String,
    pub confidence: f64,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Intent {
    pub fn new(intent: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent: intent.into(),
            confidence,
            params: Map::new(),
        }
    }

    pub fn noop() -> Self {
        Self::new("noop", 0.0)
    }
}

const CLASSIFY_SYSTEM: &str = "You are an intent classifier for an autonomous agent. Given an \
event, return a compact JSON object with keys: \"intent\" (string), \"confidence\" (0.0-1.0), \
\"params\" (object). Return only JSON.";

/// Classifies events into intents
pub struct IntentClassifier {
    llm: Option<Arc<dyn LlmClient>>,
    max_tokens: u32,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            llm,
            max_tokens,
            timeout,
        }
    }

    /// Classify one perception event
    pub async fn classify(&self, event: &Value) -> Intent {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

        match event_type {
            "transcript" | "notification" | "wakeword_detected" => {
                let text = event
                    .get("text")
                    .and_then(Value::as_str)
                    .or_else(|| event.pointer("/payload/body").and_then(Value::as_str))
                    .unwrap_or("");
                self.classify_text(text, event).await
            }
            "active_window" => {
                let mut intent = Intent::new("context_change", 0.6);
                if let Some(title) = event.pointer("/window/title").and_then(Value::as_str) {
                    intent.params.insert("title".to_string(), title.into());
                }
                intent
            }
            t if t.starts_with("mouse_") || t.starts_with("key_") => {
                let mut intent = Intent::new("user_activity", 0.9);
                intent.params.insert("type".to_string(), t.into());
                intent
            }
            _ => Intent::noop(),
        }
    }

    async fn classify_text(&self, text: &str, event: &Value) -> Intent {
        if let Some(llm) = &self.llm {
            let prompt = format!("Event: {}\nText: {}", event, text);
            let request = CompletionRequest::new(prompt)
                .with_system(CLASSIFY_SYSTEM)
                .with_max_tokens(self.max_tokens);

            match tokio::time::timeout(self.timeout, llm.complete(request)).await {
                Ok(Ok(response)) => {
                    if let Some(intent) = parse_intent_json(&response.text) {
                        return intent;
                    }
                    debug!("IntentClassifier: JSON parse failed, using heuristic");
                    return heuristic_intent(&response.text);
                }
                Ok(Err(e)) => warn!("IntentClassifier: provider call failed: {}", e),
                Err(_) => warn!("Intent classification timeout"),
            }
        }
        heuristic_intent(text)
    }
}

/// Parse the classifier's JSON reply, tolerating surrounding prose
fn parse_intent_json(raw: &str) -> Option<Intent> {
    let direct: Option<Value> = serde_json::from_str(raw).ok();
    let value = direct.or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&raw[start..=end]).ok()
    })?;

    let intent = value.get("intent")?.as_str()?.to_string();
    Some(Intent {
        intent,
        confidence: value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
        params: value
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    })
}

/// Keyword fallback when the model reply is unusable
fn heuristic_intent(text: &str) -> Intent {
    let text = text.to_lowercase();
    if text.contains("summarize") || text.contains("summarise") {
        return Intent::new("summarize", 0.7);
    }
    if text.contains("visit") || text.contains("browse") || text.contains("open website") {
        return Intent::new("open_url", 0.5);
    }
    if text.contains("open") && (text.contains("file") || text.contains("document")) {
        return Intent::new("open_file", 0.4);
    }
    if text.contains("call") || text.contains("reply") {
        return Intent::new("reply_or_call", 0.45);
    }
    Intent::new("unknown", 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;
    use serde_json::json;

    fn classifier_with(texts: &[&str]) -> IntentClassifier {
        IntentClassifier::new(
            Some(Arc::new(MockLlmClient::with_texts(texts))),
            128,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_textual_event_uses_llm_json() {
        let classifier = classifier_with(&["{\"intent\": \"open_url\", \"confidence\": 0.92, \"params\": {\"url\": \"x\"}}"]);
        let intent = classifier
            .classify(&json!({"type": "transcript", "text": "open example.com"}))
            .await;
        assert_eq!(intent.intent, "open_url");
        assert_eq!(intent.confidence, 0.92);
        assert_eq!(intent.params["url"], "x");
    }

    #[tokio::test]
    async fn test_json_embedded_in_prose_still_parses() {
        let classifier = classifier_with(&["Sure! {\"intent\": \"summarize\", \"confidence\": 0.8} done"]);
        let intent = classifier
            .classify(&json!({"type": "notification", "payload": {"body": "article"}}))
            .await;
        assert_eq!(intent.intent, "summarize");
    }

    #[tokio::test]
    async fn test_malformed_reply_falls_back_to_heuristic() {
        let classifier = classifier_with(&["please summarize that page"]);
        let intent = classifier
            .classify(&json!({"type": "transcript", "text": "x"}))
            .await;
        assert_eq!(intent.intent, "summarize");
        assert_eq!(intent.confidence, 0.7);
    }

    #[tokio::test]
    async fn test_active_window_synthesizes_context_change() {
        let classifier = IntentClassifier::new(None, 128, Duration::from_secs(1));
        let intent = classifier
            .classify(&json!({"type": "active_window", "window": {"title": "Editor"}}))
            .await;
        assert_eq!(intent.intent, "context_change");
        assert_eq!(intent.confidence, 0.6);
        assert_eq!(intent.params["title"], "Editor");
    }

    #[tokio::test]
    async fn test_input_events_synthesize_user_activity() {
        let classifier = IntentClassifier::new(None, 128, Duration::from_secs(1));
        let intent = classifier.classify(&json!({"type": "mouse_click"})).await;
        assert_eq!(intent.intent, "user_activity");
        assert_eq!(intent.confidence, 0.9);

        let intent = classifier.classify(&json!({"type": "key_press"})).await;
        assert_eq!(intent.intent, "user_activity");
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_noop() {
        let classifier = IntentClassifier::new(None, 128, Duration::from_secs(1));
        let intent = classifier.classify(&json!({"type": "heartbeat"})).await;
        assert_eq!(intent.intent, "noop");
        assert_eq!(intent.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_no_llm_uses_heuristics_on_text() {
        let classifier = IntentClassifier::new(None, 128, Duration::from_secs(1));
        let intent = classifier
            .classify(&json!({"type": "transcript", "text": "please open the file report.pdf"}))
            .await;
        assert_eq!(intent.intent, "open_file");
    }
}
