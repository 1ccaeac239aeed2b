//! Job Graph Contracts
//!
//! The orchestrator never resolves dependencies itself. It hands the
//! registry and the requested target sets to a [`DagBuilder`] and drives
//! the resulting [`Dag`] through its lifecycle: lock files, materialize,
//! inspect or provision, then hand it to a scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::workflow::rule::{ExecMethod, ShadowMode};
use crate::workflow::settings::RerunTrigger;
use crate::workflow::state::Persistence;
use crate::workflow::value::Literal;
use crate::workflow::Registry;

/// Target sets computed from the request, split into rules and files.
#[derive(Debug, Clone, Default)]
pub struct TargetSets {
    pub targetrules: BTreeSet<String>,
    pub targetfiles: BTreeSet<String>,
    pub forcerules: BTreeSet<String>,
    pub forcefiles: BTreeSet<String>,
    pub untilrules: BTreeSet<String>,
    pub untilfiles: BTreeSet<String>,
    pub omitrules: BTreeSet<String>,
    pub omitfiles: BTreeSet<String>,
    pub priorityrules: BTreeSet<String>,
    pub priorityfiles: BTreeSet<String>,
    pub forceall: bool,
    /// Force the target jobs themselves
    pub forcetargets: bool,
    /// Only these rules may produce jobs
    pub allowed_rules: Option<BTreeSet<String>>,
    /// Do not resolve dependencies; inputs are taken as given
    pub nodeps: bool,
    pub ignore_incomplete: bool,
    pub rerun_triggers: BTreeSet<RerunTrigger>,
}

/// Why a job has to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReason {
    pub forced: bool,
    pub missing_output: Vec<String>,
    pub incomplete_output: Vec<String>,
    pub updated_input: Vec<String>,
    pub updated_by_job: bool,
    pub no_output: bool,
    pub code_changed: bool,
    pub params_changed: bool,
    pub input_changed: bool,
    pub software_changed: bool,
}

impl RunReason {
    pub fn is_set(&self) -> bool {
        self.forced
            || !self.missing_output.is_empty()
            || !self.incomplete_output.is_empty()
            || !self.updated_input.is_empty()
            || self.updated_by_job
            || self.no_output
            || self.is_provenance()
    }

    fn is_provenance(&self) -> bool {
        self.code_changed || self.params_changed || self.input_changed || self.software_changed
    }

    /// The job runs only because recorded provenance changed.
    pub fn is_provenance_only(&self) -> bool {
        self.is_provenance()
            && !self.forced
            && self.missing_output.is_empty()
            && self.incomplete_output.is_empty()
            && self.updated_input.is_empty()
            && !self.updated_by_job
            && !self.no_output
    }
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.forced {
            parts.push("Forced execution".to_string());
        }
        if !self.missing_output.is_empty() {
            parts.push(format!("Missing output files: {}", self.missing_output.join(", ")));
        }
        if !self.incomplete_output.is_empty() {
            parts.push(format!(
                "Incomplete output files: {}",
                self.incomplete_output.join(", ")
            ));
        }
        if !self.updated_input.is_empty() {
            parts.push(format!("Updated input files: {}", self.updated_input.join(", ")));
        }
        if self.updated_by_job {
            parts.push("Input files updated by another job".to_string());
        }
        if self.no_output {
            parts.push("Rules with neither output nor a finished state are always executed".to_string());
        }
        if self.code_changed {
            parts.push("Code has changed since last execution".to_string());
        }
        if self.params_changed {
            parts.push("Params have changed since last execution".to_string());
        }
        if self.input_changed {
            parts.push("Set of input files has changed since last execution".to_string());
        }
        if self.software_changed {
            parts.push("Software environment definition has changed since last execution".to_string());
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// One concrete instance of a rule.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    pub rule: String,
    pub wildcards: BTreeMap<String, String>,
    pub input: Vec<String>,
    pub output: Vec<String>,
    /// Named inputs and outputs, as positions in `input` and `output`
    pub named_input: BTreeMap<String, usize>,
    pub named_output: BTreeMap<String, usize>,
    pub log: Vec<String>,
    pub benchmark: Option<String>,
    /// Outputs removed once every consumer finished
    pub temp_output: Vec<String>,
    /// Inputs provided by a sub-workflow, mapped to its name
    pub subworkflow_input: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub resources: BTreeMap<String, Literal>,
    pub threads: i64,
    pub priority: f64,
    pub restart_times: u32,
    pub shadow: ShadowMode,
    pub exec: ExecMethod,
    pub conda_env: Option<String>,
    pub container: Option<String>,
    pub env_modules: Vec<String>,
    pub message: Option<String>,
    pub version: Option<String>,
    pub group: Option<String>,
    pub is_checkpoint: bool,
    pub is_local: bool,
    /// Directory of the definition file of the rule
    pub basedir: Option<PathBuf>,
    /// Jobs producing this job's inputs
    pub dependencies: BTreeSet<usize>,
    pub needrun: bool,
    pub reason: RunReason,
}

impl Job {
    /// `rule` or `rule (a=1, b=2)`.
    pub fn label(&self) -> String {
        if self.wildcards.is_empty() {
            self.rule.clone()
        } else {
            let wildcards: Vec<String> = self
                .wildcards
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{} ({})", self.rule, wildcards.join(", "))
        }
    }

    /// Text identifying the job's code for provenance.
    pub fn code(&self) -> String {
        self.exec.code()
    }

    /// Rendered parameters for provenance.
    pub fn params_text(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn software_env(&self) -> Option<String> {
        match (&self.conda_env, &self.container) {
            (None, None) if self.env_modules.is_empty() => None,
            (conda, container) => Some(format!(
                "conda={};container={};modules={}",
                conda.as_deref().unwrap_or(""),
                container.as_deref().unwrap_or(""),
                self.env_modules.join(",")
            )),
        }
    }
}

/// Which provenance field a change listing compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Version,
    Code,
    Input,
    Params,
}

/// Builds a job graph for a registry.
pub trait DagBuilder: Send + Sync {
    fn build(&self, registry: &Registry, targets: &TargetSets, workdir: &Path) -> Result<Box<dyn Dag>>;
}

/// A resolved job graph.
pub trait Dag {
    /// Files read and written by the graph, for the run lock.
    fn lock_files(&self) -> (BTreeSet<String>, BTreeSet<String>);

    /// Decides which jobs need to run.
    fn init(&mut self, persistence: &dyn Persistence) -> Result<()>;

    fn update_checkpoint_dependencies(&mut self) -> Result<()>;

    /// Fails if any output still holds an unresolved placeholder.
    fn check_dynamic(&self) -> Result<()>;

    /// Stops reusing cached file modification times.
    fn deactivate_iocache(&mut self);

    fn jobs(&self) -> &[Job];

    fn needrun_jobs(&self) -> Vec<&Job> {
        self.jobs().iter().filter(|job| job.needrun).collect()
    }

    fn checkpoint_jobs(&self) -> Vec<&Job> {
        self.jobs().iter().filter(|job| job.is_checkpoint).collect()
    }

    /// Requested files reachable through the named sub-workflow.
    fn subworkflow_files(&self, name: &str) -> Vec<String>;

    /// Treats `files` as freshly updated and re-evaluates what needs to run.
    fn mark_updated(&mut self, files: &[String], persistence: &dyn Persistence) -> Result<()>;

    /// Inputs of target jobs that do not exist (for runs without dependency resolution).
    fn missing_inputs(&self) -> Vec<String>;

    /// Rules whose jobs only run because of provenance changes.
    fn provenance_triggered_rules(&self) -> BTreeSet<String> {
        self.needrun_jobs()
            .iter()
            .filter(|job| job.reason.is_provenance_only())
            .map(|job| job.rule.clone())
            .collect()
    }

    /// Job counts per rule.
    fn stats(&self) -> String;

    fn dot(&self) -> String;

    fn rule_dot(&self) -> String;

    fn filegraph_dot(&self) -> String;

    fn d3dag(&self) -> Result<String>;

    fn summary(&self, detailed: bool, persistence: &dyn Persistence) -> Vec<String>;

    fn changed_files(&self, kind: ChangeKind, persistence: &dyn Persistence) -> Vec<String>;

    fn untracked_files(&self) -> Result<Vec<String>>;

    fn archive(&self, path: &Path) -> Result<()>;

    /// Deletes outputs (or only temp outputs); returns the affected files.
    fn clean(&self, only_temp: bool, dryrun: bool) -> Result<Vec<String>>;

    /// Container definition installing every conda environment used.
    fn containerize(&self) -> Result<String>;

    fn pull_container_images(&self, dryrun: bool, prefix: &Path) -> Result<()>;

    fn create_conda_envs(&self, dryrun: bool, prefix: &Path) -> Result<()>;

    /// File-based conda environments: definition file, container image and location.
    fn conda_env_listing(&self, prefix: &Path) -> Result<Vec<(String, String, PathBuf)>>;

    /// Environment directories the jobs use.
    fn conda_env_addresses(&self, prefix: &Path) -> Result<BTreeSet<PathBuf>>;

    /// Image files the jobs use.
    fn container_images(&self, prefix: &Path) -> BTreeSet<PathBuf>;

    /// Removes empty directories left behind by missing files.
    fn cleanup_workdir(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_provenance_only() {
        let reason = RunReason {
            code_changed: true,
            ..Default::default()
        };
        assert!(reason.is_set());
        assert!(reason.is_provenance_only());

        let reason = RunReason {
            code_changed: true,
            missing_output: vec!["a.txt".to_string()],
            ..Default::default()
        };
        assert!(!reason.is_provenance_only());
        assert!(reason.to_string().contains("Missing output files: a.txt"));
    }

    #[test]
    fn test_reason_unset() {
        let reason = RunReason::default();
        assert!(!reason.is_set());
        assert_eq!(reason.to_string(), "");
    }
}
