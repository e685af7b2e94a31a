//! Structured results returned to the caller

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use tidyrun_cleanup::CleanupReport;
use tidyrun_common::{CleanupConfig, SessionId};

use crate::definition::Viewport;
use crate::step::StepRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// Not attempted because an earlier test failed
    NotRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

impl TestResult {
    pub fn not_run(id: impl Into<String>, viewport: Option<Viewport>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            status: TestStatus::NotRun,
            duration_ms: 0,
            steps: Vec::new(),
            error: None,
            viewport,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>, viewport: Option<Viewport>) -> Self {
        Self {
            status: TestStatus::Failed,
            error: Some(error.into()),
            ..Self::not_run(id, viewport)
        }
    }

    /// `name [WxH]` when a viewport is set
    pub fn label(&self) -> String {
        match &self.viewport {
            Some(v) => format!("{} [{}]", self.name, v),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Summary of the cleanup pass attached to a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub success: bool,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_path: Option<PathBuf>,
}

impl From<&CleanupReport> for CleanupSummary {
    fn from(report: &CleanupReport) -> Self {
        Self {
            success: report.success,
            deleted: report.deleted.clone(),
            failed: report.failed.clone(),
            record_path: report.record_path.clone(),
        }
    }
}

/// Cleanup a workflow would run, kept so a pipeline can run it once at
/// the end instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupPlan {
    pub config: Option<CleanupConfig>,
    pub on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub name: String,
    pub status: RunStatus,
    pub session_id: SessionId,
    pub tests: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSummary>,
    pub duration_ms: u64,
    #[serde(skip)]
    pub cleanup_plan: CleanupPlan,
}

impl WorkflowResult {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.tests.iter().filter(|t| t.status == status).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub id: String,
    pub file: PathBuf,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowResult>,
}

/// How a finished run should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Passed,
    TestsFailed,
    /// Tests passed but resources were left behind
    CleanupFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub name: String,
    pub status: RunStatus,
    pub session_id: SessionId,
    pub nodes: Vec<NodeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSummary>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn node(&self, id: &str) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Test failures take precedence over cleanup failures.
    pub fn exit_status(&self) -> ExitStatus {
        if self.status == RunStatus::Failed {
            ExitStatus::TestsFailed
        } else if self.cleanup.as_ref().is_some_and(|c| !c.success) {
            ExitStatus::CleanupFailed
        } else {
            ExitStatus::Passed
        }
    }

    /// Every test result across nodes, in execution order
    pub fn tests(&self) -> impl Iterator<Item = &TestResult> {
        self.nodes
            .iter()
            .filter_map(|n| n.workflow.as_ref())
            .flat_map(|w| w.tests.iter())
    }
}
