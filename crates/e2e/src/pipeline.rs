//! Pipeline scheduler
//!
//! Workflows form a dependency graph. The graph is ordered with Kahn's
//! algorithm before anything runs; nodes then run one at a time in that
//! order, sharing one browser session and one [`ExecutionContext`]. A node
//! whose dependency failed or was skipped is handled by its failure policy.
//! Cleanup runs once, after the walk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{error, info, warn};

use tidyrun_common::{infer_cleanup, Layered};

use crate::context::ExecutionContext;
use crate::definition::{FailurePolicy, PipelineDefinition, WorkflowReference};
use crate::error::{E2eError, E2eResult};
use crate::result::{CleanupPlan, NodeResult, NodeStatus, PipelineResult, RunStatus, TestStatus};
use crate::step::StepExecutor;
use crate::workflow::{run_planned_cleanup, set_variables, RunEnvironment, RunOptions, WorkflowRunner};

pub const REASON_NOT_MET: &str = "dependencies not met";
pub const REASON_FAILED: &str = "dependencies failed";
pub const REASON_STOPPED: &str = "pipeline stopped";

/// Validated, ordered workflow graph
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    deps: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Check ids and edges, then order the nodes.
    ///
    /// Ties are broken by declaration order, so the same graph always yields
    /// the same order.
    pub fn build(refs: &[WorkflowReference]) -> E2eResult<Self> {
        let ids: Vec<String> = refs.iter().enumerate().map(|(i, r)| r.node_id(i)).collect();

        let mut index = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            if index.insert(id.as_str(), i).is_some() {
                return Err(E2eError::DuplicateNodeId(id.clone()));
            }
        }

        let mut deps = Vec::with_capacity(refs.len());
        for (i, r) in refs.iter().enumerate() {
            let mut node_deps = Vec::new();
            for dep in &r.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| E2eError::UnknownDependency {
                    node: ids[i].clone(),
                    dependency: dep.clone(),
                })?;
                if !node_deps.contains(&d) {
                    node_deps.push(d);
                }
            }
            deps.push(node_deps);
        }

        let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut dependents = vec![Vec::new(); ids.len()];
        for (node, node_deps) in deps.iter().enumerate() {
            for &d in node_deps {
                dependents[d].push(node);
            }
        }

        let mut queue: VecDeque<usize> = (0..ids.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < ids.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let nodes = (0..ids.len())
                .filter(|i| !placed.contains(i))
                .map(|i| ids[i].clone())
                .collect();
            return Err(E2eError::CycleDetected { nodes });
        }

        Ok(Self { ids, deps, order })
    }

    /// Node ids in execution order
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct PipelineRunner<'a> {
    env: &'a RunEnvironment,
    executor: &'a dyn StepExecutor,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(env: &'a RunEnvironment, executor: &'a dyn StepExecutor) -> Self {
        Self { env, executor }
    }

    /// Run every node and then clean up once.
    ///
    /// Graph errors are returned before any node runs. Node failures,
    /// including definitions that fail to load, are part of the result.
    pub async fn run(&self, pipeline: &PipelineDefinition) -> E2eResult<PipelineResult> {
        let graph = DependencyGraph::build(&pipeline.workflows)?;
        let start = Instant::now();
        let base = pipeline.base_dir();

        info!(
            pipeline = %pipeline.name,
            session = %self.env.session_id,
            order = ?graph.order(),
            "Running pipeline"
        );

        let mut ctx = ExecutionContext::new(self.env.session_id.clone());
        set_variables(&mut ctx, &pipeline.variables);

        let pipeline_cleanup = infer_cleanup(pipeline.cleanup.as_ref(), pipeline.appwrite.as_ref());
        let runner = WorkflowRunner::new(self.env, self.executor);

        let mut statuses: HashMap<usize, NodeStatus> = HashMap::new();
        let mut nodes = Vec::with_capacity(graph.len());
        let mut plan: Option<CleanupPlan> = None;
        let mut page_open = false;
        let mut stopped = false;

        for &i in &graph.order {
            let reference = &pipeline.workflows[i];
            let id = graph.ids[i].clone();
            let node_start = Instant::now();

            let mut node = NodeResult {
                id: id.clone(),
                file: reference.file.clone(),
                status: NodeStatus::Skipped,
                reason: None,
                duration_ms: 0,
                workflow: None,
            };

            if stopped {
                node.reason = Some(REASON_STOPPED.to_string());
                statuses.insert(i, node.status);
                nodes.push(node);
                continue;
            }

            let unmet: Vec<&str> = graph.deps[i]
                .iter()
                .filter(|&&d| statuses.get(&d) != Some(&NodeStatus::Passed))
                .map(|&d| graph.ids[d].as_str())
                .collect();

            if !unmet.is_empty() {
                match reference.on_failure.unwrap_or(pipeline.on_failure) {
                    FailurePolicy::Skip => {
                        warn!(node = %id, unmet = ?unmet, "Skipping node");
                        node.reason = Some(format!("{}: {}", REASON_NOT_MET, unmet.join(", ")));
                        statuses.insert(i, node.status);
                        nodes.push(node);
                        continue;
                    }
                    FailurePolicy::Fail => {
                        error!(node = %id, unmet = ?unmet, "Dependencies failed, stopping pipeline");
                        node.status = NodeStatus::Failed;
                        node.reason = Some(format!("{}: {}", REASON_FAILED, unmet.join(", ")));
                        statuses.insert(i, node.status);
                        nodes.push(node);
                        stopped = true;
                        continue;
                    }
                    FailurePolicy::Ignore => {
                        warn!(node = %id, unmet = ?unmet, "Running node despite unmet dependencies");
                    }
                }
            }

            info!(node = %id, "Running node");
            ctx.push_scope(id.clone());
            match reference.load(&base) {
                Ok(workflow) => {
                    set_variables(&mut ctx, &reference.variables);
                    let opts = RunOptions {
                        skip_cleanup: true,
                        pipeline_cleanup: pipeline_cleanup.clone(),
                        page_open,
                    };
                    let result = runner.run(&workflow, &mut ctx, &opts).await;
                    page_open = true;

                    // First node decides the config; any node can opt out on failure.
                    match &mut plan {
                        None => plan = Some(result.cleanup_plan.clone()),
                        Some(plan) => plan.on_failure &= result.cleanup_plan.on_failure,
                    }
                    if result.passed() {
                        node.status = NodeStatus::Passed;
                    } else {
                        node.status = NodeStatus::Failed;
                        node.reason = result
                            .tests
                            .iter()
                            .find(|t| t.status == TestStatus::Failed)
                            .and_then(|t| t.error.clone())
                            .or_else(|| Some("workflow failed".to_string()));
                    }
                    node.workflow = Some(result);
                }
                Err(e) => {
                    error!(node = %id, error = %e, "Node failed to load");
                    node.status = NodeStatus::Failed;
                    node.reason = Some(e.to_string());
                }
            }
            ctx.pop_scope();

            node.duration_ms = node_start.elapsed().as_millis() as u64;
            info!(node = %id, status = ?node.status, duration_ms = node.duration_ms, "Node finished");
            statuses.insert(i, node.status);
            nodes.push(node);
        }

        if page_open {
            if let Err(e) = self.executor.close().await {
                warn!(error = %e, "Failed to close browser session");
            }
        }

        let status = if nodes.iter().all(|n| n.status == NodeStatus::Passed) {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };

        let plan = plan.unwrap_or_else(|| CleanupPlan {
            config: Layered::new(self.env.global.effective_cleanup())
                .pipeline(pipeline_cleanup)
                .resolve(),
            on_failure: self.env.global.run.cleanup_on_failure,
        });
        let cleanup = run_planned_cleanup(self.env, &mut ctx, &plan, status == RunStatus::Failed).await;

        Ok(PipelineResult {
            name: pipeline.name.clone(),
            status,
            session_id: self.env.session_id.clone(),
            nodes,
            cleanup,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn node(id: &str, deps: &[&str]) -> WorkflowReference {
        let mut r = WorkflowReference::new(format!("{}.yaml", id));
        r.id = Some(id.to_string());
        r.depends_on = deps.iter().map(|d| d.to_string()).collect();
        r
    }

    /// `"C:A,B"` declares node C depending on A and B.
    fn parse(entry: &str) -> WorkflowReference {
        match entry.split_once(':') {
            Some((id, deps)) => node(id, &deps.split(',').collect::<Vec<_>>()),
            None => node(entry, &[]),
        }
    }

    #[test_case(&["A", "B:A", "C:B"], &["A", "B", "C"] ; "chain")]
    #[test_case(&["C:A,B", "B:A", "A"], &["A", "B", "C"] ; "declared backwards")]
    #[test_case(&["x", "y", "z:x"], &["x", "y", "z"] ; "independent nodes keep declaration order")]
    fn orders_dependencies_first(nodes: &[&str], expected: &[&str]) {
        let refs: Vec<_> = nodes.iter().map(|entry| parse(entry)).collect();
        let graph = DependencyGraph::build(&refs).unwrap();
        assert_eq!(graph.order(), expected);
    }

    #[test]
    fn cycle_names_remaining_nodes() {
        let refs = vec![node("A", &["B"]), node("B", &["A"])];
        match DependencyGraph::build(&refs) {
            Err(E2eError::CycleDetected { nodes }) => assert_eq!(nodes, vec!["A", "B"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let refs = vec![node("root", &[]), node("loop", &["loop"])];
        assert!(matches!(
            DependencyGraph::build(&refs),
            Err(E2eError::CycleDetected { nodes }) if nodes == vec!["loop"]
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let refs = vec![node("A", &["ghost"])];
        assert!(matches!(
            DependencyGraph::build(&refs),
            Err(E2eError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let refs = vec![node("A", &[]), node("A", &[])];
        assert!(matches!(DependencyGraph::build(&refs), Err(E2eError::DuplicateNodeId(id)) if id == "A"));
    }

    #[test]
    fn positional_ids_for_unnamed_nodes() {
        let mut second = WorkflowReference::new("second.yaml");
        second.depends_on = vec!["workflow-1".into()];
        let refs = vec![WorkflowReference::new("first.yaml"), second];
        let graph = DependencyGraph::build(&refs).unwrap();
        assert_eq!(graph.order(), vec!["workflow-1", "workflow-2"]);
    }
}
