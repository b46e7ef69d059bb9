//! Coordination end-to-end scenarios: resolver batching plus handoff
//! release across agents, and handoff liveness when every dependency
//! eventually completes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;

use apm_coordination::{
    AgentCoordinator, CoordinationEventKind, CrossAgentDependency, DependencyResolver,
    HandoffState, TaskGraphSpec, TaskSpec,
};

fn task(dependencies: &[&str], agent: &str) -> TaskSpec {
    TaskSpec {
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        agent_assignment: agent.to_string(),
        phase: None,
    }
}

/// A(no deps, AgentX); B and C both depend on A and run on AgentY.
fn fan_out_spec() -> TaskGraphSpec {
    let mut tasks = BTreeMap::new();
    tasks.insert("a".to_string(), task(&[], "agent_x"));
    tasks.insert("b".to_string(), task(&["a"], "agent_y"));
    tasks.insert("c".to_string(), task(&["a"], "agent_y"));
    TaskGraphSpec { tasks }
}

/// Resolver produces batches [[A], [B, C]] and both cross-agent edges;
/// completing A flips both handoffs to Ready and unblocks B and C.
#[test]
fn fan_out_release_after_dependency_completes() -> Result<()> {
    let resolver = Arc::new(DependencyResolver::from_spec(&fan_out_spec())?);

    let analysis = resolver.analyze();
    assert_eq!(
        analysis.execution_batches,
        vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()]]
    );
    let cross: HashSet<(String, String)> = analysis
        .cross_agent_dependencies
        .iter()
        .map(|d: &CrossAgentDependency| (d.task_id.clone(), d.depends_on.clone()))
        .collect();
    assert_eq!(
        cross,
        [("b".to_string(), "a".to_string()), ("c".to_string(), "a".to_string())]
            .into_iter()
            .collect()
    );

    let coordinator = AgentCoordinator::new(resolver);
    coordinator.initialize(&HashSet::new());

    let handoffs = coordinator.handoffs();
    assert_eq!(handoffs.len(), 2);
    assert!(handoffs.iter().all(|h| h.status == HandoffState::Pending));
    assert!(!coordinator.can_task_proceed("b"));

    coordinator.mark_task_completed("a", "agent_x");

    assert!(coordinator
        .handoffs()
        .iter()
        .all(|h| h.status == HandoffState::Ready));
    let unblocked: Vec<_> = coordinator
        .events()
        .into_iter()
        .filter(|e| e.kind == CoordinationEventKind::TaskUnblocked)
        .map(|e| e.task_id)
        .collect();
    assert_eq!(unblocked.len(), 2);
    assert!(unblocked.contains(&"b".to_string()));
    assert!(unblocked.contains(&"c".to_string()));
    Ok(())
}

/// A deeper two-agent pipeline: when every dependency task eventually
/// completes, every handoff reaches Ready and every requesting task can
/// proceed.
#[test]
fn handoff_liveness_over_pipeline() -> Result<()> {
    // x1 -> y1 -> x2 -> y2 (alternating agents, each step cross-agent)
    let mut tasks = BTreeMap::new();
    tasks.insert("x1".to_string(), task(&[], "agent_x"));
    tasks.insert("y1".to_string(), task(&["x1"], "agent_y"));
    tasks.insert("x2".to_string(), task(&["y1"], "agent_x"));
    tasks.insert("y2".to_string(), task(&["x2"], "agent_y"));
    let resolver = Arc::new(DependencyResolver::from_spec(&TaskGraphSpec { tasks })?);

    let coordinator = AgentCoordinator::new(resolver.clone());
    coordinator.initialize(&HashSet::new());
    assert_eq!(coordinator.handoffs().len(), 3);

    // Drive completions in dependency order
    let mut completed = HashSet::new();
    for batch in resolver.analyze().execution_batches {
        for task_id in batch {
            assert!(
                resolver.is_task_ready(&task_id, &completed),
                "{task_id} should be ready"
            );
            // Cross-agent gate opens before the task runs
            assert!(
                coordinator.can_task_proceed(&task_id),
                "{task_id} should be able to proceed"
            );
            let agent = resolver.node(&task_id).unwrap().agent_assignment.clone();
            coordinator.mark_task_completed(&task_id, &agent);
            completed.insert(task_id);
        }
    }

    // Every handoff reached Ready; none is stuck Pending
    assert!(coordinator
        .handoffs()
        .iter()
        .all(|h| h.status == HandoffState::Ready));
    assert!(coordinator.blocked_tasks("agent_x").is_empty());
    assert!(coordinator.blocked_tasks("agent_y").is_empty());

    // Acks complete the handoffs terminally
    for handoff in coordinator.handoffs() {
        coordinator.complete_handoff(&handoff.handoff_id)?;
    }
    assert!(coordinator
        .handoffs()
        .iter()
        .all(|h| h.status == HandoffState::Completed));
    Ok(())
}

/// Agent-level views stay consistent while the pipeline advances.
#[test]
fn agent_views_track_pipeline_progress() -> Result<()> {
    let resolver = Arc::new(DependencyResolver::from_spec(&fan_out_spec())?);
    let coordinator = AgentCoordinator::new(resolver);
    coordinator.initialize(&HashSet::new());

    let y_before = coordinator.agent_coordination_state("agent_y");
    assert_eq!(y_before.blocked_tasks, vec!["b", "c"]);
    assert_eq!(y_before.pending_handoffs.len(), 2);

    let x_before = coordinator.agent_coordination_state("agent_x");
    assert_eq!(x_before.providing_handoffs.len(), 2);
    assert!(x_before.completed_outputs.is_empty());

    coordinator.mark_task_completed("a", "agent_x");

    let y_after = coordinator.agent_coordination_state("agent_y");
    assert!(y_after.blocked_tasks.is_empty());
    assert!(y_after.pending_handoffs.is_empty());

    let x_after = coordinator.agent_coordination_state("agent_x");
    assert_eq!(x_after.completed_outputs, vec!["a"]);
    Ok(())
}
