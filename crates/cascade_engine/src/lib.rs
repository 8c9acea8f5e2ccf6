//! Beta network, commit orchestration, and sessions for Cascade.
//!
//! This crate provides:
//! - [`RuleBuilder`] / [`RuleCompiler`] - Rule declaration and network planning
//! - [`RuleNetwork`] - Delta-aware multi-way join nodes per rule
//! - [`ActionBuffer`] - Coalescing buffer of insert/update/delete actions
//! - [`TaskScheduler`] - Sequential and rayon-backed work execution
//! - [`Knowledge`] / [`Session`] - Shared rule base and working-memory sessions
//! - [`SessionConfig`] - Session tuning knobs and kill switches

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agenda;
pub mod beta;
pub mod buffer;
pub mod commit;
pub mod config;
pub mod rule;
pub mod scheduler;
pub mod session;

pub use agenda::{Activation, ActivationManager, RhsContext, SalienceOrder};
pub use beta::{
    BetaNode, ConditionNode, FactSlot, MAX_JOIN_ARITY, MatchFact, NodeId, RuleNetwork,
};
pub use buffer::{Action, ActionBuffer, Coalesced};
pub use commit::{CommitPhase, CommitStats};
pub use config::{Parallelism, SessionConfig};
pub use rule::{
    JoinTest, Rhs, RuleBuilder, RuleCompiler, RuleDescriptor, join_test,
};
pub use scheduler::{RayonScheduler, SequentialScheduler, TaskScheduler, WorkUnit};
pub use session::{Knowledge, Session};
