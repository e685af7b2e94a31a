//! Declarative YAML test, workflow and pipeline definitions

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tidyrun_common::{CleanupConfig, LegacyAppwriteSection};

use crate::error::{E2eError, E2eResult};

/// Ordered variable namespace
pub type Variables = IndexMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `"<width>x<height>"`
    pub fn label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport { width: 1280, height: 720 }
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Viewport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w.trim().parse().map_err(|_| format!("invalid width in '{}'", s))?;
        let height = h.trim().parse().map_err(|_| format!("invalid height in '{}'", s))?;
        Ok(Viewport { width, height })
    }
}

// ============================================================================
// Steps
// ============================================================================

/// One entry of a step list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    /// Inline branch, optionally guarded by a variable condition
    Group { group: GroupStep },

    /// Steps loaded from another file
    Include {
        include: PathBuf,
        #[serde(default)]
        variables: Variables,
    },

    /// A single action for the step executor
    Action(ActionStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStep {
    #[serde(default)]
    pub name: Option<String>,

    /// Run only if this interpolates to a truthy value
    #[serde(default)]
    pub when: Option<String>,

    pub steps: Vec<Step>,
}

/// An action the core does not interpret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Store the step's returned value in this variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Everything else, passed through to the executor after interpolation
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ActionStep {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            name: None,
            set: None,
            timeout_ms: None,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Short human-readable label
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let target = ["selector", "url", "text", "value"]
            .iter()
            .find_map(|k| self.params.get(*k).and_then(|v| v.as_str()));
        match target {
            Some(t) => format!("{}:{}", self.action, t),
            None => self.action.clone(),
        }
    }
}

/// A file that only contributes steps (the target of `include`)
#[derive(Debug, Clone, Deserialize)]
pub struct StepFile {
    #[serde(default)]
    pub variables: Variables,
    pub steps: Vec<Step>,
}

impl StepFile {
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        load_yaml(path)
    }
}

// ============================================================================
// Tests and workflows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,

    /// Id used for `${<id>.VAR}` lookups; defaults to the name
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub variables: Variables,

    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupConfig>,

    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl TestDefinition {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        serde_yaml::from_str(yaml).map_err(E2eError::from)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let mut test: Self = load_yaml(path)?;
        test.source = Some(path.to_path_buf());
        Ok(test)
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    /// Directory relative includes resolve against
    pub fn base_dir(&self) -> Option<&Path> {
        self.source.as_deref().and_then(Path::parent)
    }
}

/// A test within a workflow: inline or loaded from a file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRef {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub test: Option<TestDefinition>,

    /// Overrides applied before the test runs
    #[serde(default)]
    pub variables: Variables,
}

impl TestRef {
    pub fn inline(test: TestDefinition) -> Self {
        Self {
            test: Some(test),
            ..Self::default()
        }
    }

    /// Load the referenced test; relative files resolve against `base`.
    pub fn resolve(&self, base: &Path) -> E2eResult<TestDefinition> {
        let mut test = match (&self.test, &self.file) {
            (Some(test), _) => test.clone(),
            (None, Some(file)) => TestDefinition::from_file(&resolve_path(base, file))?,
            (None, None) => {
                return Err(E2eError::DefinitionLoad {
                    path: base.to_path_buf(),
                    message: "test reference needs 'file' or 'test'".to_string(),
                })
            }
        };
        if let Some(id) = &self.id {
            test.id = Some(id.clone());
        }
        Ok(test)
    }

    /// Label used before the test is loaded
    pub fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.test.as_ref().map(|t| t.id().to_string()))
            .or_else(|| {
                self.file
                    .as_ref()
                    .and_then(|f| f.file_stem())
                    .map(|s| s.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| format!("test-{}", index + 1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub variables: Variables,

    pub tests: Vec<TestRef>,

    #[serde(default)]
    pub continue_on_failure: Option<bool>,

    #[serde(default)]
    pub cleanup_on_failure: Option<bool>,

    /// Replay the whole workflow once per viewport
    #[serde(default)]
    pub viewports: Vec<Viewport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupConfig>,

    /// Legacy provider block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appwrite: Option<LegacyAppwriteSection>,

    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl WorkflowDefinition {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        serde_yaml::from_str(yaml).map_err(E2eError::from)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let mut workflow: Self = load_yaml(path)?;
        workflow.source = Some(path.to_path_buf());
        Ok(workflow)
    }

    /// Wrap a single test as a one-test workflow.
    pub fn from_test(test: TestDefinition) -> Self {
        Self {
            name: test.name.clone(),
            description: test.description.clone(),
            variables: Variables::new(),
            source: test.source.clone(),
            cleanup: None,
            tests: vec![TestRef::inline(test)],
            continue_on_failure: None,
            cleanup_on_failure: None,
            viewports: Vec::new(),
            appwrite: None,
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        self.source
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

// ============================================================================
// Pipelines
// ============================================================================

/// What to do with a node whose dependency failed or was skipped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Skip,
    Fail,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReference {
    pub file: PathBuf,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,

    #[serde(default)]
    pub variables: Variables,

    /// Already-loaded workflow, used when a bare workflow runs as a pipeline
    #[serde(skip)]
    pub loaded: Option<WorkflowDefinition>,
}

impl WorkflowReference {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            id: None,
            depends_on: Vec::new(),
            on_failure: None,
            variables: Variables::new(),
            loaded: None,
        }
    }

    /// Declared id, or `workflow-<position>` (1-based)
    pub fn node_id(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("workflow-{}", index + 1))
    }

    pub fn load(&self, base: &Path) -> E2eResult<WorkflowDefinition> {
        match &self.loaded {
            Some(workflow) => Ok(workflow.clone()),
            None => WorkflowDefinition::from_file(&resolve_path(base, &self.file)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub variables: Variables,

    pub workflows: Vec<WorkflowReference>,

    /// Default policy for nodes that do not declare one
    #[serde(default)]
    pub on_failure: FailurePolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appwrite: Option<LegacyAppwriteSection>,

    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl PipelineDefinition {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        serde_yaml::from_str(yaml).map_err(E2eError::from)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let mut pipeline: Self = load_yaml(path)?;
        pipeline.source = Some(path.to_path_buf());
        Ok(pipeline)
    }

    /// A bare workflow as a single-node pipeline. The workflow's own cleanup
    /// section becomes the pipeline-level one since cleanup runs at the end.
    pub fn from_workflow(workflow: WorkflowDefinition) -> Self {
        let id = workflow.name.clone();
        let mut reference = WorkflowReference::new(
            workflow.source.clone().unwrap_or_else(|| PathBuf::from(&id)),
        );
        reference.id = Some(id);
        Self {
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            variables: Variables::new(),
            on_failure: FailurePolicy::default(),
            cleanup: workflow.cleanup.clone(),
            appwrite: workflow.appwrite.clone(),
            source: workflow.source.clone(),
            workflows: vec![WorkflowReference {
                loaded: Some(workflow),
                ..reference
            }],
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        self.source
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Any loadable definition file
#[derive(Debug, Clone)]
pub enum Definition {
    Test(TestDefinition),
    Workflow(WorkflowDefinition),
    Pipeline(PipelineDefinition),
}

impl Definition {
    /// Load a file, deciding its kind by its top-level keys.
    pub fn load(path: &Path) -> E2eResult<Self> {
        let value: serde_yaml::Value = load_yaml(path)?;
        let has = |key: &str| value.get(key).is_some();
        if has("workflows") {
            Ok(Definition::Pipeline(PipelineDefinition::from_file(path)?))
        } else if has("tests") {
            Ok(Definition::Workflow(WorkflowDefinition::from_file(path)?))
        } else if has("steps") {
            Ok(Definition::Test(TestDefinition::from_file(path)?))
        } else {
            Err(E2eError::DefinitionLoad {
                path: path.to_path_buf(),
                message: "expected 'workflows', 'tests' or 'steps'".to_string(),
            })
        }
    }

    /// Everything runs as a pipeline.
    pub fn into_pipeline(self) -> PipelineDefinition {
        match self {
            Definition::Pipeline(p) => p,
            Definition::Workflow(w) => PipelineDefinition::from_workflow(w),
            Definition::Test(t) => {
                let cleanup = t.cleanup.clone();
                let mut workflow = WorkflowDefinition::from_test(t);
                workflow.cleanup = cleanup;
                PipelineDefinition::from_workflow(workflow)
            }
        }
    }
}

pub(crate) fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> E2eResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| E2eError::DefinitionLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_yaml::from_str(&content).map_err(|e| E2eError::DefinitionLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
