//! Workflow Definition Module
//!
//! Builds the rule registry a run operates on.
//!
//! # Structure
//!
//! - [`registry`]: Directive application, rule finalization and lookup
//! - [`ruleinfo`]: Directive values collected for a rule under construction
//! - [`rule`]: Finalized rules
//! - [`value`]: Tagged directive values and resolver functions
//! - [`modifier`] / [`module`]: Scopes for included modules and `use rule`
//! - [`parser`]: YAML workflow definitions
//! - [`settings`]: Run-wide settings and config handling
//! - [`state`]: Persistent run state (locks, metadata)
//! - [`wildcards`]: Wildcard patterns in file names

pub mod modifier;
pub mod module;
pub mod parser;
pub mod registry;
pub mod rule;
pub mod ruleinfo;
pub mod settings;
pub mod sourcecache;
pub mod state;
pub mod subworkflow;
pub mod value;
pub mod wildcards;

pub use modifier::Modifier;
pub use module::{ModuleInfo, RuleSource};
pub use parser::{load_workflow, YamlRuleSource};
pub use registry::{Hook, Registry, RuleHandle, UseRule};
pub use rule::{ExecMethod, Rule, ShadowMode};
pub use ruleinfo::{Directive, InOutput, IoPath, Params};
pub use settings::{RerunTrigger, WorkflowSettings};
pub use state::{Persistence, PersistenceFactory, StateStore};
pub use subworkflow::Subworkflow;
pub use value::{InlineFn, JobContext, Literal, ResourceValue, Resolver, Value};
pub use wildcards::has_wildcards;
