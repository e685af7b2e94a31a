//! tidyrun Workflow Runner and Pipeline Scheduler
//!
//! This crate runs declarative tests against a live application and keeps
//! track of every backend resource they create so it can be removed
//! afterwards:
//! - Loads test, workflow and pipeline definitions from YAML
//! - Orders pipeline nodes by dependency and applies per-node failure policy
//! - Drives a browser session through a pluggable [`StepExecutor`]
//! - Collects resources reported by the application under test
//! - Starts and stops the dev server
//! - Hands the resource ledger to the cleanup engine once at the end
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  PipelineRunner                                             │
//! │    ├── DependencyGraph::build(workflows) -> order | cycle   │
//! │    ├── for node in order: policy(skip | fail | ignore)      │
//! │    │     └── WorkflowRunner::run(workflow, ctx)             │
//! │    │           ├── open_page(viewport)                      │
//! │    │           └── for test: execute_steps(steps, ctx)      │
//! │    └── cleanup_session(ctx.ledger) -> CleanupExecutor       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ExecutionContext                                           │
//! │    ├── variables, ${node.VAR} outputs                       │
//! │    └── ResourceLedger <- steps, POST /track, track file     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod definition;
pub mod driver;
pub mod error;
pub mod interpolate;
pub mod marker;
pub mod pipeline;
pub mod result;
pub mod server;
pub mod step;
pub mod tracking;
pub mod workflow;

pub use context::ExecutionContext;
pub use definition::{
    Definition, FailurePolicy, PipelineDefinition, Step, TestDefinition, TestRef, Viewport,
    WorkflowDefinition, WorkflowReference,
};
pub use driver::{DriverConfig, ProcessStepExecutor};
pub use error::{E2eError, E2eResult};
pub use marker::SessionMarker;
pub use pipeline::{DependencyGraph, PipelineRunner};
pub use result::{
    CleanupSummary, ExitStatus, NodeResult, NodeStatus, PipelineResult, RunStatus, TestResult,
    TestStatus, WorkflowResult,
};
pub use server::DevServer;
pub use step::{execute_steps, StepExecutor, StepOutcome};
pub use tracking::{TrackingCollector, TrackingEndpoint, TrackingServer};
pub use workflow::{cleanup_session, RunEnvironment, RunOptions, WorkflowRunner};
