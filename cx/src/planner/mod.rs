//! Plan production: instruction -> DSL -> AST -> CFG -> Plan
//!
//! The planner asks the LLM for DSL, parses and validates it, and compiles
//! the result into an executable Plan. A parse failure buys a bounded
//! number of LLM rewrites (the parser error is fed back verbatim); once the
//! budget is spent the caller receives the parser error unchanged.

mod generator;

pub use generator::{clean_dsl, DslGenerator};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compiler::{compile_ast_to_cfg, CompileError};
use crate::config::PlannerConfig;
use crate::dsl::{parse, validate_ast, ParseError};
use crate::events::{Event, EventBus, EventType};
use crate::llm::{LlmClient, LlmError};
use crate::memory::VectorStore;
use crate::plan::Plan;
use crate::providers::CapabilityRegistry;

const PLANNER_NAME: &str = "cortexd_planner_v1";

/// Planner failures
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Plan validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("No LLM client configured for plan generation")]
    NoLlm,
}

/// Coordinates DSL generation, validation and compilation
pub struct Planner {
    generator: Option<DslGenerator>,
    vector_store: Option<Arc<dyn VectorStore>>,
    llm: Option<Arc<dyn LlmClient>>,
    capabilities: Option<Arc<CapabilityRegistry>>,
    bus: Option<Arc<EventBus>>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            generator: None,
            vector_store: None,
            llm: None,
            capabilities: None,
            bus: None,
            config,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>, max_tokens: u32) -> Self {
        self.generator = Some(DslGenerator::new(llm.clone(), max_tokens));
        self.llm = Some(llm);
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Arc<CapabilityRegistry>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn emit(&self, event_type: EventType, plan_id: Option<&str>, payload: Value) {
        if let Some(bus) = &self.bus {
            let mut event = Event::new(event_type).with_payload(payload);
            if let Some(plan_id) = plan_id {
                event = event.with_plan(plan_id);
            }
            bus.emit(&event);
        }
    }

    /// Compile DSL text directly into a Plan (no LLM involved)
    pub fn plan_from_dsl(&self, dsl: &str, session_id: Option<&str>) -> Result<Plan, PlanError> {
        let ast = parse(dsl)?;
        self.emit(
            EventType::AstParsed,
            None,
            serde_json::json!({"statements": ast.statements.len()}),
        );

        let report = validate_ast(&ast);
        for warning in &report.warnings {
            debug!(message = %warning.message, "Plan validation warning");
        }
        if !report.ok() {
            let messages: Vec<String> = report.errors.iter().map(|e| e.message.clone()).collect();
            return Err(PlanError::Validation(messages.join("; ")));
        }

        let cfg = compile_ast_to_cfg(&ast)?;
        let mut plan = Plan::new(cfg);
        plan.dsl = Some(dsl.to_string());
        plan.ast = Some(ast);
        plan.metadata.insert("planner".to_string(), PLANNER_NAME.into());
        if let Some(session_id) = session_id {
            plan.metadata.insert("session_id".to_string(), session_id.into());
        }
        if let Some(hash) = plan.canonical_hash() {
            plan.metadata.insert("canonical_hash".to_string(), hash.into());
        }

        self.emit(
            EventType::PlanCreated,
            Some(&plan.id),
            serde_json::json!({"hash": plan.canonical_hash()}),
        );
        info!(plan_id = %plan.id, "Planner: plan compiled");
        Ok(plan)
    }

    /// Few-shot examples retrieved from vector memory for the instruction
    async fn retrieve_examples(&self, instruction: &str) -> Vec<String> {
        let (Some(llm), Some(store)) = (&self.llm, &self.vector_store) else {
            return Vec::new();
        };
        let embedding = match llm.embed(instruction).await {
            Ok(embedding) => embedding,
            Err(e) => {
                debug!("Planner: embedding failed, skipping retrieval: {}", e);
                return Vec::new();
            }
        };
        store
            .query(&embedding, 3)
            .into_iter()
            .filter_map(|hit| {
                hit.metadata
                    .get("dsl")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or(Some(hit.text))
            })
            .collect()
    }

    /// Full pipeline: instruction -> DSL (LLM) -> rewrite loop -> Plan
    pub async fn plan(
        &self,
        session_id: &str,
        instruction: &str,
        context: &Map<String, Value>,
    ) -> Result<Plan, PlanError> {
        let generator = self.generator.as_ref().ok_or(PlanError::NoLlm)?;
        info!(session_id, "Planner: generating plan");

        let examples = self.retrieve_examples(instruction).await;
        let manifests = self.capabilities.as_ref().map(|c| c.export_manifests());

        let mut instruction = instruction.to_string();
        if !context.is_empty() {
            instruction.push_str("\n\nContext:\n");
            instruction.push_str(&serde_json::to_string(context).unwrap_or_default());
        }

        let mut dsl = generator.generate(&instruction, manifests.as_ref(), &examples).await?;
        self.emit(
            EventType::DslProduced,
            None,
            serde_json::json!({"len": dsl.len(), "session_id": session_id}),
        );

        // Parse, with a bounded rewrite budget on failure
        let mut attempt: u32 = 0;
        loop {
            match self.plan_from_dsl(&dsl, Some(session_id)) {
                Ok(plan) => return Ok(plan),
                Err(PlanError::Parse(parse_error)) => {
                    if attempt >= self.config.max_rewrite_attempts {
                        warn!(attempts = attempt, "Planner: rewrite budget spent, surfacing parse error");
                        return Err(PlanError::Parse(parse_error));
                    }
                    attempt += 1;
                    warn!(attempt, error = %parse_error, "Planner: DSL parse failed, requesting rewrite");
                    dsl = generator.rewrite(&dsl, &parse_error.to_string(), attempt).await?;
                    tokio::time::sleep(Duration::from_millis(self.config.rewrite_backoff_ms * attempt as u64)).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;

    fn planner_with_texts(texts: &[&str]) -> Planner {
        let mock = Arc::new(MockLlmClient::with_texts(texts));
        Planner::new(PlannerConfig::default()).with_llm(mock, 256)
    }

    #[test]
    fn test_plan_from_dsl() {
        let planner = Planner::new(PlannerConfig::default());
        let plan = planner
            .plan_from_dsl("t1 = task(name=\"load\")", Some("sess-1"))
            .unwrap();

        assert!(plan.cfg.is_some());
        assert_eq!(plan.metadata["session_id"], "sess-1");
        assert_eq!(plan.metadata["planner"], PLANNER_NAME);
        assert!(plan.metadata.contains_key("canonical_hash"));
    }

    #[test]
    fn test_plan_from_dsl_surfaces_parse_error() {
        let planner = Planner::new(PlannerConfig::default());
        let err = planner.plan_from_dsl("t1 = = task()", None).unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)));
    }

    #[test]
    fn test_validation_errors_reject_plan() {
        let planner = Planner::new(PlannerConfig::default());
        let err = planner
            .plan_from_dsl("retry attempts=0:\n    task(name=\"x\")", None)
            .unwrap_err();
        assert!(matches!(err, PlanError::Validation(_)));
    }

    #[tokio::test]
    async fn test_plan_generates_via_llm() {
        let planner = planner_with_texts(&["t1 = task(name=\"download\")"]);
        let plan = planner.plan("sess", "download the report", &Map::new()).await.unwrap();
        assert!(plan.dsl.unwrap().contains("download"));
    }

    #[tokio::test]
    async fn test_rewrite_loop_recovers_once() {
        // First response fails to parse, second parses
        let mut config = PlannerConfig::default();
        config.rewrite_backoff_ms = 1;
        let mock = Arc::new(MockLlmClient::with_texts(&[
            "t1 = = broken",
            "t1 = task(name=\"fixed\")",
        ]));
        let planner = Planner::new(config).with_llm(mock.clone(), 256);

        let plan = planner.plan("sess", "do it", &Map::new()).await.unwrap();
        assert!(plan.dsl.unwrap().contains("fixed"));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_rewrite_budget_surfaces_parse_error_verbatim() {
        let mut config = PlannerConfig::default();
        config.max_rewrite_attempts = 1;
        config.rewrite_backoff_ms = 1;
        let mock = Arc::new(MockLlmClient::with_texts(&["broken ( (", "still broken ( ("]));
        let planner = Planner::new(config).with_llm(mock.clone(), 256);

        let err = planner.plan("sess", "do it", &Map::new()).await.unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)));
        assert_eq!(mock.call_count(), 2); // one generate + one rewrite
    }

    #[tokio::test]
    async fn test_no_llm_is_an_error() {
        let planner = Planner::new(PlannerConfig::default());
        let err = planner.plan("sess", "x", &Map::new()).await.unwrap_err();
        assert!(matches!(err, PlanError::NoLlm));
    }
}
