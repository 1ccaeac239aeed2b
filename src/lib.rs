//! RuleRunner - Rule-Based Workflow Execution Engine
//!
//! Workflows are sets of rules that say how to produce output files from
//! input files. Requested files are resolved backwards through the rules
//! into a graph of jobs, and only jobs whose outputs are missing or out of
//! date are run.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`workflow`]: Rule registry, directive application and YAML definitions
//! - [`execution`]: Run orchestration, job graph, scheduling and job execution
//! - [`environment`]: Conda/micromamba and container integration
//! - [`monitoring`]: Resource usage tracking and execution timeline
//! - [`error`]: The crate-wide error type
//!
//! # Example
//!
//! ```rust,no_run
//! use rulerunner::execution::{Collaborators, ExecuteRequest, Orchestrator};
//! use rulerunner::workflow::WorkflowSettings;
//! use rulerunner::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut settings = WorkflowSettings::default();
//!     settings.set_cores(4);
//!
//!     let registry = load_workflow("workflow.yaml", settings)?;
//!     let mut orchestrator = Orchestrator::new(registry, "/data/analysis", Collaborators::builtin());
//!
//!     let outcome = orchestrator.execute(&ExecuteRequest::new(["results/summary.txt"]))?;
//!     assert!(outcome.success);
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{Error, Result};
pub use execution::{ExecuteRequest, Orchestrator, RunOutcome};
pub use workflow::parser::load_workflow;
pub use workflow::{Registry, WorkflowSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RuleRunner";
