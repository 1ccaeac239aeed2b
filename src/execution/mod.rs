//! Workflow Execution Module
//!
//! Turns a finished registry into jobs and runs them.
//!
//! # Architecture
//!
//! - [`orchestrator`]: The run state machine, talking to collaborators through traits
//! - [`dag`]: Job graph contracts
//! - [`graph`] / [`inspect`]: The built-in file-based job graph and its reports
//! - [`scheduler`]: Scheduler contracts and the local thread-based scheduler
//! - [`step`]: Individual job execution logic

pub mod dag;
pub mod graph;
pub mod inspect;
pub mod orchestrator;
pub mod scheduler;
pub mod step;

pub use dag::{ChangeKind, Dag, DagBuilder, Job, TargetSets};
pub use graph::{FileDag, FileDagBuilder};
pub use orchestrator::{Collaborators, ExecuteRequest, Inspection, Orchestrator, RunOutcome, WorkflowLoader};
pub use scheduler::{Executor, LocalScheduler, Scheduler, SchedulerFactory, SchedulerPolicy};
