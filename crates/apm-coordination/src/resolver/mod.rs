//! # Dependency Resolver
//!
//! Builds a directed task graph from a pre-parsed implementation plan and
//! answers the scheduling questions the coordinator needs: topological
//! execution order, parallel execution batches, cross-agent dependencies,
//! and live readiness queries.
//!
//! Cycle detection is an explicit safety net: the plan is expected to be a
//! DAG, but a cyclic input yields an empty execution order, sets
//! `has_circular_dependencies`, and enumerates every cycle found.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One task as it appears in the plan input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub agent_assignment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// The plan input: a map of task id to spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGraphSpec {
    pub tasks: BTreeMap<String, TaskSpec>,
}

/// A resolved graph node with both edge directions materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub task_id: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub agent_assignment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// An edge whose two endpoints run on different agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossAgentDependency {
    /// The task that needs the output
    pub task_id: String,
    /// The task that produces it
    pub depends_on: String,
    pub task_agent: String,
    pub dependency_agent: String,
}

/// Full analysis of the task graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAnalysis {
    /// Tasks with no dependencies
    pub root_tasks: Vec<String>,
    /// Tasks nothing depends on
    pub leaf_tasks: Vec<String>,
    /// Dependency-respecting order; empty when the graph is cyclic
    pub execution_order: Vec<String>,
    pub has_circular_dependencies: bool,
    /// Every cycle found, as the task ids along it
    pub cycles: Vec<Vec<String>>,
    /// Waves of tasks whose dependencies are satisfied by earlier waves
    pub execution_batches: Vec<Vec<String>>,
    pub cross_agent_dependencies: Vec<CrossAgentDependency>,
}

/// Errors building the graph from a plan.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
}

/// Resolved task graph for one implementation plan.
#[derive(Debug)]
pub struct DependencyResolver {
    nodes: BTreeMap<String, TaskNode>,
}

impl DependencyResolver {
    /// Build the graph, materializing reverse edges and rejecting
    /// references to tasks the plan does not define.
    pub fn from_spec(spec: &TaskGraphSpec) -> Result<Self, ResolverError> {
        let mut nodes: BTreeMap<String, TaskNode> = spec
            .tasks
            .iter()
            .map(|(task_id, task)| {
                (
                    task_id.clone(),
                    TaskNode {
                        task_id: task_id.clone(),
                        dependencies: task.dependencies.clone(),
                        dependents: Vec::new(),
                        agent_assignment: task.agent_assignment.clone(),
                        phase: task.phase.clone(),
                    },
                )
            })
            .collect();

        // Reverse edges; validate forward edges while at it
        for (task_id, task) in &spec.tasks {
            for dependency in &task.dependencies {
                if !nodes.contains_key(dependency) {
                    return Err(ResolverError::UnknownDependency {
                        task: task_id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                if let Some(node) = nodes.get_mut(dependency) {
                    node.dependents.push(task_id.clone());
                }
            }
        }

        debug!(tasks = nodes.len(), "Built dependency graph");
        Ok(Self { nodes })
    }

    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.nodes.get(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every `(task, dependency)` pair assigned to different agents.
    pub fn cross_agent_dependencies(&self) -> Vec<CrossAgentDependency> {
        let mut result = Vec::new();
        for node in self.nodes.values() {
            for dependency in &node.dependencies {
                if let Some(dep_node) = self.nodes.get(dependency) {
                    if dep_node.agent_assignment != node.agent_assignment {
                        result.push(CrossAgentDependency {
                            task_id: node.task_id.clone(),
                            depends_on: dependency.clone(),
                            task_agent: node.agent_assignment.clone(),
                            dependency_agent: dep_node.agent_assignment.clone(),
                        });
                    }
                }
            }
        }
        result
    }

    /// Run the full analysis: roots, leaves, order, cycles, batches, and
    /// cross-agent edges.
    pub fn analyze(&self) -> GraphAnalysis {
        let root_tasks: Vec<String> = self
            .nodes
            .values()
            .filter(|node| node.dependencies.is_empty())
            .map(|node| node.task_id.clone())
            .collect();
        let leaf_tasks: Vec<String> = self
            .nodes
            .values()
            .filter(|node| node.dependents.is_empty())
            .map(|node| node.task_id.clone())
            .collect();

        let (execution_order, cycles) = self.topological_sort();
        let has_circular_dependencies = !cycles.is_empty();
        if has_circular_dependencies {
            warn!(cycles = cycles.len(), "Task graph contains circular dependencies");
        }

        GraphAnalysis {
            root_tasks,
            leaf_tasks,
            execution_batches: if has_circular_dependencies {
                Vec::new()
            } else {
                self.execution_batches()
            },
            execution_order: if has_circular_dependencies {
                Vec::new()
            } else {
                execution_order
            },
            has_circular_dependencies,
            cycles,
            cross_agent_dependencies: self.cross_agent_dependencies(),
        }
    }

    /// Depth-first topological sort with a three-colour visit.
    ///
    /// Dependencies are visited before their dependents, so the resulting
    /// order places every dependency ahead of the tasks that need it. A
    /// back-edge to a task on the current stack records the cycle.
    fn topological_sort(&self) -> (Vec<String>, Vec<Vec<String>>) {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colours: BTreeMap<&str, Colour> =
            self.nodes.keys().map(|id| (id.as_str(), Colour::White)).collect();
        let mut order = Vec::new();
        let mut cycles = Vec::new();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            task_id: &'a str,
            nodes: &'a BTreeMap<String, TaskNode>,
            colours: &mut BTreeMap<&'a str, Colour>,
            stack: &mut Vec<&'a str>,
            order: &mut Vec<String>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            colours.insert(task_id, Colour::Grey);
            stack.push(task_id);

            if let Some(node) = nodes.get(task_id) {
                for dependency in &node.dependencies {
                    match colours.get(dependency.as_str()).copied() {
                        Some(Colour::White) => {
                            visit(dependency, nodes, colours, stack, order, cycles);
                        }
                        Some(Colour::Grey) => {
                            // Back-edge: the cycle is the stack slice from
                            // the dependency to the current task
                            if let Some(start) =
                                stack.iter().position(|id| *id == dependency.as_str())
                            {
                                let cycle: Vec<String> =
                                    stack[start..].iter().map(|id| id.to_string()).collect();
                                if !cycles.contains(&cycle) {
                                    cycles.push(cycle);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }

            stack.pop();
            colours.insert(task_id, Colour::Black);
            order.push(task_id.to_string());
        }

        for task_id in self.nodes.keys() {
            if colours.get(task_id.as_str()) == Some(&Colour::White) {
                visit(
                    task_id,
                    &self.nodes,
                    &mut colours,
                    &mut stack,
                    &mut order,
                    &mut cycles,
                );
            }
        }
        (order, cycles)
    }

    /// Group tasks into waves: each batch holds every not-yet-scheduled
    /// task whose dependencies are all in earlier batches. Stops when no
    /// progress can be made (only possible on cyclic input).
    fn execution_batches(&self) -> Vec<Vec<String>> {
        let mut completed: HashSet<&str> = HashSet::new();
        let mut batches = Vec::new();

        while completed.len() < self.nodes.len() {
            let batch: Vec<String> = self
                .nodes
                .values()
                .filter(|node| !completed.contains(node.task_id.as_str()))
                .filter(|node| {
                    node.dependencies
                        .iter()
                        .all(|dep| completed.contains(dep.as_str()))
                })
                .map(|node| node.task_id.clone())
                .collect();
            if batch.is_empty() {
                warn!("Execution batching stalled; remaining tasks are cyclic");
                break;
            }
            for task_id in &batch {
                if let Some(node) = self.nodes.get(task_id) {
                    completed.insert(node.task_id.as_str());
                }
            }
            batches.push(batch);
        }
        batches
    }

    /// Tasks whose dependencies are all completed and which are neither
    /// completed nor currently running.
    pub fn ready_tasks(
        &self,
        completed: &HashSet<String>,
        in_progress: &HashSet<String>,
    ) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| {
                !completed.contains(&node.task_id) && !in_progress.contains(&node.task_id)
            })
            .filter(|node| node.dependencies.iter().all(|dep| completed.contains(dep)))
            .map(|node| node.task_id.clone())
            .collect()
    }

    pub fn is_task_ready(&self, task_id: &str, completed: &HashSet<String>) -> bool {
        self.nodes
            .get(task_id)
            .map(|node| node.dependencies.iter().all(|dep| completed.contains(dep)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(entries: &[(&str, &[&str], &str)]) -> TaskGraphSpec {
        TaskGraphSpec {
            tasks: entries
                .iter()
                .map(|(id, deps, agent)| {
                    (
                        id.to_string(),
                        TaskSpec {
                            dependencies: deps.iter().map(|d| d.to_string()).collect(),
                            agent_assignment: agent.to_string(),
                            phase: None,
                        },
                    )
                })
                .collect(),
        }
    }

    fn diamond() -> TaskGraphSpec {
        // a -> b, a -> c, b/c -> d
        spec(&[
            ("a", &[], "agent_x"),
            ("b", &["a"], "agent_y"),
            ("c", &["a"], "agent_y"),
            ("d", &["b", "c"], "agent_x"),
        ])
    }

    #[test]
    fn test_roots_and_leaves() {
        let resolver = DependencyResolver::from_spec(&diamond()).unwrap();
        let analysis = resolver.analyze();
        assert_eq!(analysis.root_tasks, vec!["a"]);
        assert_eq!(analysis.leaf_tasks, vec!["d"]);
    }

    #[test]
    fn test_reverse_edges() {
        let resolver = DependencyResolver::from_spec(&diamond()).unwrap();
        let node = resolver.node("a").unwrap();
        assert_eq!(node.dependents, vec!["b", "c"]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let bad = spec(&[("a", &["ghost"], "agent_x")]);
        let err = DependencyResolver::from_spec(&bad).unwrap_err();
        assert!(matches!(err, ResolverError::UnknownDependency { .. }));
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let resolver = DependencyResolver::from_spec(&diamond()).unwrap();
        let analysis = resolver.analyze();
        assert!(!analysis.has_circular_dependencies);
        assert_eq!(analysis.execution_order.len(), 4);

        let position = |id: &str| {
            analysis
                .execution_order
                .iter()
                .position(|t| t == id)
                .unwrap()
        };
        // Every dependency precedes its dependent
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
    }

    #[test]
    fn test_execution_batches() {
        let resolver = DependencyResolver::from_spec(&diamond()).unwrap();
        let analysis = resolver.analyze();
        assert_eq!(
            analysis.execution_batches,
            vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()], vec!["d".to_string()]]
        );
    }

    #[test]
    fn test_cycle_detection() {
        let cyclic = spec(&[
            ("a", &["c"], "agent_x"),
            ("b", &["a"], "agent_x"),
            ("c", &["b"], "agent_x"),
            ("solo", &[], "agent_y"),
        ]);
        let resolver = DependencyResolver::from_spec(&cyclic).unwrap();
        let analysis = resolver.analyze();

        assert!(analysis.has_circular_dependencies);
        assert!(analysis.execution_order.is_empty());
        assert!(analysis.execution_batches.is_empty());
        assert_eq!(analysis.cycles.len(), 1);
        let cycle: HashSet<_> = analysis.cycles[0].iter().cloned().collect();
        assert_eq!(
            cycle,
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_self_cycle() {
        let selfish = spec(&[("a", &["a"], "agent_x")]);
        let resolver = DependencyResolver::from_spec(&selfish).unwrap();
        let analysis = resolver.analyze();
        assert!(analysis.has_circular_dependencies);
        assert_eq!(analysis.cycles, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn test_cross_agent_dependencies() {
        let resolver = DependencyResolver::from_spec(&diamond()).unwrap();
        let cross = resolver.cross_agent_dependencies();
        // b<-a and c<-a cross x/y; d<-b and d<-c cross y/x
        assert_eq!(cross.len(), 4);
        assert!(cross.contains(&CrossAgentDependency {
            task_id: "b".to_string(),
            depends_on: "a".to_string(),
            task_agent: "agent_y".to_string(),
            dependency_agent: "agent_x".to_string(),
        }));
    }

    #[test]
    fn test_ready_tasks_live_query() {
        let resolver = DependencyResolver::from_spec(&diamond()).unwrap();
        let mut completed = HashSet::new();
        let mut in_progress = HashSet::new();

        assert_eq!(resolver.ready_tasks(&completed, &in_progress), vec!["a"]);

        completed.insert("a".to_string());
        in_progress.insert("b".to_string());
        assert_eq!(resolver.ready_tasks(&completed, &in_progress), vec!["c"]);

        assert!(resolver.is_task_ready("b", &completed));
        assert!(!resolver.is_task_ready("d", &completed));
        assert!(!resolver.is_task_ready("ghost", &completed));
    }

    #[test]
    fn test_plan_json_round_trip() {
        let raw = r#"{
            "tasks": {
                "task_1_1": {"dependencies": [], "agentAssignment": "agent_manager"},
                "task_2_1": {
                    "dependencies": ["task_1_1"],
                    "agentAssignment": "agent_impl",
                    "phase": "Phase 2"
                }
            }
        }"#;
        let spec: TaskGraphSpec = serde_json::from_str(raw).unwrap();
        let resolver = DependencyResolver::from_spec(&spec).unwrap();
        assert_eq!(resolver.task_count(), 2);
        assert_eq!(resolver.node("task_2_1").unwrap().phase.as_deref(), Some("Phase 2"));
        assert_eq!(resolver.cross_agent_dependencies().len(), 1);
    }
}
