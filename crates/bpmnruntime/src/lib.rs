//! Process execution runtime
//!
//! This crate runs deployed process definitions: it persists instances through
//! a [`ProcessStore`], drives flow nodes through their states, correlates
//! messages, signals and timers, and recovers unfinished work after a restart.

mod config;
mod context;
mod contract;
mod correlation;
mod deployment;
mod engine;
mod graph;
mod lifecycle;
mod operations;
mod recovery;
mod resolver;
mod scheduler;
mod search;
mod state_machine;
mod store;
mod working_set;

pub use config::{ConfigError, EngineConfig};
pub use contract::validate_inputs;
pub use deployment::validate_definition;
pub use engine::ProcessEngine;
pub use graph::FlowGraph;
pub use operations::OperationEvaluator;
pub use recovery::RecoveryReport;
pub use resolver::ExpressionResolver;
pub use scheduler::{EngineHandle, WorkItem};
pub use search::{FlowNodeFilter, FlowNodeSort, SearchOptions, SearchResult};
pub use store::{
    DataUpdate, DocumentUpdate, ExecutionClaim, FlowNodeTrigger, MemoryStore, MutationBatch,
    ProcessActivation, ProcessStore, Successor,
};
pub use working_set::WorkingSet;
