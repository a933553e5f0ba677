//! HTTP LLM client (OpenAI-compatible chat/embeddings endpoints)

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError};
use crate::config::LlmConfig;

/// Client for any OpenAI-compatible completion API
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            LlmError::InvalidResponse(format!("API key env var '{}' not set", config.api_key_env))
        })?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "HttpLlmClient: request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Network(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30));
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(stop) = &request.stop {
            body["stop"] = json!(stop);
        }

        let raw = self.post("/chat/completions", body).await?;
        let text = raw["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".to_string()))?
            .to_string();

        Ok(CompletionResponse { text, raw })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = json!({"model": self.model, "input": text});
        let raw = self.post("/embeddings", body).await?;

        let embedding = raw["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| LlmError::InvalidResponse("missing data[0].embedding".to_string()))?
            .iter()
            .filter_map(Value::as_f64)
            .map(|f| f as f32)
            .collect();
        Ok(embedding)
    }
}
