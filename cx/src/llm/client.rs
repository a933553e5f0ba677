//! LlmClient trait definition

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmError};

/// Stateless LLM client - each call is independent
///
/// No conversation state is kept between calls; the planner and intent
/// classifier build their full context into every prompt.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single completion request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Embed a text into a vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Mock LLM client for unit tests: returns scripted responses in order
    pub struct MockLlmClient {
        responses: Vec<CompletionResponse>,
        call_count: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<CompletionResponse>) -> Self {
            Self {
                responses,
                call_count: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        /// Build a mock whose replies are the given texts, in order
        pub fn with_texts(texts: &[&str]) -> Self {
            Self::new(texts.iter().map(|t| CompletionResponse::text_only(*t)).collect())
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Prompts seen so far, for assertions
        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(idx)
                .cloned()
                .ok_or_else(|| LlmError::InvalidResponse("No more mock responses".to_string()))
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
            // Deterministic toy embedding: character histogram buckets
            let mut vector = vec![0.0f32; 8];
            for (i, byte) in text.bytes().enumerate() {
                vector[i % 8] += byte as f32 / 255.0;
            }
            Ok(vector)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_returns_responses_in_order() {
            let client = MockLlmClient::with_texts(&["one", "two"]);

            let r1 = client.complete(CompletionRequest::new("a")).await.unwrap();
            let r2 = client.complete(CompletionRequest::new("b")).await.unwrap();
            assert_eq!(r1.text, "one");
            assert_eq!(r2.text, "two");
            assert_eq!(client.call_count(), 2);
            assert_eq!(client.prompts(), vec!["a".to_string(), "b".to_string()]);
        }

        #[tokio::test]
        async fn test_mock_errors_when_exhausted() {
            let client = MockLlmClient::with_texts(&[]);
            let result = client.complete(CompletionRequest::new("x")).await;
            assert!(result.is_err());
        }

        #[tokio::test]
        async fn test_mock_embed_is_deterministic() {
            let client = MockLlmClient::with_texts(&[]);
            let a = client.embed("hello").await.unwrap();
            let b = client.embed("hello").await.unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), 8);
        }
    }
}
