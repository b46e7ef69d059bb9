//! # apm-coordination
//!
//! Cross-agent task coordination for the APM runtime: a dependency
//! resolver over the pre-parsed implementation-plan task graph, and a
//! handoff coordinator that releases tasks as their dependencies complete
//! on other agents.
//!
//! The resolver is pure graph analysis (topological order, batches, cycle
//! detection, cross-agent edges); the coordinator layers a small state
//! machine and event history on top of it.

pub mod coordinator;
pub mod events;
pub mod resolver;

pub use coordinator::{
    AgentCoordinationState, AgentCoordinator, CoordinationError, Handoff, HandoffState,
};
pub use events::{CoordinationEvent, CoordinationEventKind};
pub use resolver::{
    CrossAgentDependency, DependencyResolver, GraphAnalysis, ResolverError, TaskGraphSpec,
    TaskNode, TaskSpec,
};
