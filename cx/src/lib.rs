//! Cortexd - autonomous agent runtime
//!
//! Cortexd turns high-level intent and ambient perception events into
//! validated execution plans, then runs them with bounded concurrency,
//! policy enforcement and retry/recovery.
//!
//! # Core pipeline
//!
//! sensors -> event bus -> (autonomy engine | skills) -> intents/proposals
//! -> decision policy -> plan compilation -> orchestrator -> worker pool
//! -> providers
//!
//! # Modules
//!
//! - [`dsl`] - the indentation-sensitive plan language (lexer, parser, AST)
//! - [`plan`] - CFG model, plans, actions, canonical hashing
//! - [`compiler`] - AST to CFG lowering
//! - [`exec`] - state tracking, condition evaluation, worker pool,
//!   orchestrator
//! - [`events`] - lifecycle event vocabulary and the pub/sub bus
//! - [`policy`] - rule-matched allow/deny with trust levels
//! - [`providers`] - sandbox, hostbridge and plugin capabilities
//! - [`planner`] - LLM-backed DSL generation with a bounded rewrite loop
//! - [`autonomy`] - event -> intent -> decision -> plan control loop
//! - [`skills`] - tick/event-driven proposal producers
//! - [`cognition`] - load balancing, fusion, scheduling, the heartbeat
//! - [`supervisor`] - watchdog with backoff and circuit breaking
//! - [`session`] - durable per-session context with write-behind
//!   persistence
//! - [`runtime`] - full component assembly

pub mod autonomy;
pub mod cli;
pub mod cognition;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod events;
pub mod exec;
pub mod llm;
pub mod memory;
pub mod negotiator;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod providers;
pub mod runtime;
pub mod session;
pub mod skills;
pub mod supervisor;

// Re-export commonly used types
pub use autonomy::{AutonomyEngine, AutonomyMode, Decision, DecisionKind, DecisionPolicy, Intent, IntentClassifier};
pub use cognition::{CognitiveLoadBalancer, CognitiveLoop, CrossSkillReasoner, ScheduledJob, TemporalScheduler};
pub use compiler::{compile_ast_to_cfg, CompileError};
pub use config::Config;
pub use dsl::{parse, unparse, validate_ast, AstRoot, ParseError};
pub use events::{Event, EventBus, EventType, ProvenanceEntry};
pub use exec::{
    ActionRequest, CancelToken, ConditionEvaluator, DispatchResult, DispatchStatus, NodeState, NodeStatus,
    Orchestrator, RunSummary, StateTracker, WorkerPool,
};
pub use llm::{CompletionRequest, CompletionResponse, HttpLlmClient, LlmClient, LlmError};
pub use memory::{InMemoryVectorStore, MemoryHit, VectorStore};
pub use negotiator::{NegotiationDecision, Negotiator};
pub use plan::{Action, ActionType, Cfg, CfgNode, GraphError, NodeKind, Plan, PlanStatus};
pub use planner::{PlanError, Planner};
pub use policy::{Effect, PolicyDecision, PolicyEngine, PolicyMode, PolicyRule, TrustManager};
pub use providers::{
    CapabilityRegistry, ExecContext, HostBridge, Manifest, PluginRegistry, Provider, ProviderError, SandboxRunner,
    SimulatedProvider,
};
pub use runtime::Runtime;
pub use session::{SessionError, SessionManager};
pub use skills::{FusedProposal, RiskLevel, Skill, SkillContext, SkillManager, SkillProposal};
pub use supervisor::Supervisor;
