//! Cognition layer: load balancing, cross-skill fusion, the heartbeat
//! cycle and the temporal scheduler

mod cycle;
mod load;
mod reasoner;
mod temporal;

pub use cycle::{CognitiveLoop, CycleConfig};
pub use load::{CognitiveLoadBalancer, LoadEventKind};
pub use reasoner::CrossSkillReasoner;
pub use temporal::{ScheduledJob, TemporalScheduler};
