//! LLM-backed DSL generation

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::llm::{CompletionRequest, LlmClient, LlmError};

const SYSTEM_PROMPT: &str = "You are an autonomous agent planner. You write plans in a small \
line-oriented DSL with Python-like indentation.\n\
Statements:\n\
  v = task(name=\"...\", key=value, ...)\n\
  task(name=\"...\")\n\
  if <expr>:\n\
  else:\n\
  for <name> in <expr>:\n\
  retry attempts=N backoff=F:\n\
Expressions may use names, attribute paths (a.b.c), literals and the \
operators and/or/not/==/!=/</<=/>/>=/in/is. No function calls inside \
expressions.\n\
Return ONLY the DSL, no commentary and no code fences.";

/// Generates and repairs DSL text through an LLM
pub struct DslGenerator {
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl DslGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    /// Ask the model for a plan for `instruction`, with optional capability
    /// manifests and few-shot examples woven into the prompt
    pub async fn generate(
        &self,
        instruction: &str,
        manifests: Option<&BTreeMap<String, Value>>,
        examples: &[String],
    ) -> Result<String, LlmError> {
        let mut prompt = String::new();
        if let Some(manifests) = manifests {
            if !manifests.is_empty() {
                prompt.push_str("Available capabilities:\n");
                for (name, manifest) in manifests {
                    prompt.push_str(&format!("- {}: {}\n", name, manifest));
                }
                prompt.push('\n');
            }
        }
        for example in examples {
            prompt.push_str("Example plan:\n");
            prompt.push_str(example);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Task:\n");
        prompt.push_str(instruction);

        let request = CompletionRequest::new(prompt)
            .with_system(SYSTEM_PROMPT)
            .with_max_tokens(self.max_tokens);
        let response = self.llm.complete(request).await?;
        let dsl = clean_dsl(&response.text);
        debug!(len = dsl.len(), "DslGenerator: produced DSL");
        Ok(dsl)
    }

    /// Ask for a corrected DSL, feeding the parser error back verbatim
    pub async fn rewrite(&self, bad_dsl: &str, parse_error: &str, attempt: u32) -> Result<String, LlmError> {
        let prompt = format!(
            "The following plan DSL failed to parse. Return ONLY the corrected DSL.\n\n\
             PARSER ERROR:\n{}\n\nFAILING DSL:\n{}\n\n(Attempt {})",
            parse_error, bad_dsl, attempt
        );
        let request = CompletionRequest::new(prompt)
            .with_system(SYSTEM_PROMPT)
            .with_max_tokens(self.max_tokens);
        let response = self.llm.complete(request).await?;
        Ok(clean_dsl(&response.text))
    }
}

/// Strip code fences and language markers the model sometimes adds
pub fn clean_dsl(text: &str) -> String {
    let mut lines: Vec<&str> = text.trim().lines().collect();
    if lines.first().map(|l| l.trim_start().starts_with("```")) == Some(true) {
        lines.remove(0);
    }
    if lines.last().map(|l| l.trim() == "```") == Some(true) {
        lines.pop();
    }
    lines.join("\n").trim_end().to_string()
}
