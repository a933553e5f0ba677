//! Autonomy control plane: perception events -> intents -> decisions ->
//! plans

mod decision;
mod engine;
mod intent;

pub use decision::{AutonomyMode, Decision, DecisionKind, DecisionPolicy};
pub use engine::AutonomyEngine;
pub use intent::{Intent, IntentClassifier};
