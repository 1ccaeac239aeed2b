//! Run Orchestration
//!
//! [`Orchestrator::execute`] drives one run over a finished [`Registry`]:
//!
//! 1. validate `localrules` and `ruleorder`
//! 2. resolve the requested targets into rule and file sets
//! 3. build the job graph
//! 4. open the run state; metadata cleanup and unlocking exit here, before
//!    the lock is taken
//! 5. lock the working directory; shadow cleanup and containerization exit
//!    here
//! 6. materialize the graph
//! 7. run sub-workflows whose files are needed
//! 8. inspection reports (graphs, summaries, change lists, archive, clean)
//! 9. provision software environments; environment listing and cleanup
//!    exit here
//! 10. pre-flight checks
//! 11. hand the graph to the scheduler
//! 12. report, run hooks and clean up
//!
//! All collaborators are reached through traits bundled in
//! [`Collaborators`], so the state machine can be exercised without
//! touching the filesystem.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::workflow::parser::load_workflow;
use crate::workflow::settings::WorkflowSettings;
use crate::workflow::state::{Persistence, PersistenceFactory, StateStoreFactory};
use crate::workflow::Registry;

use super::dag::{ChangeKind, Dag, DagBuilder, TargetSets};
use super::graph::FileDagBuilder;
use super::scheduler::{Executor, LocalSchedulerFactory, SchedulerFactory, SchedulerPolicy};
use super::step::{wait_for_files, StepContext};

const NOTHING_TO_BE_DONE: &str = "Nothing to be done (all requested files are present and up to date).";

/// Loads a workflow definition into a registry.
pub trait WorkflowLoader: Send + Sync {
    fn load(&self, definition: &Path, settings: WorkflowSettings) -> Result<Registry>;
}

/// Loads YAML workflow definitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlWorkflowLoader;

impl WorkflowLoader for YamlWorkflowLoader {
    fn load(&self, definition: &Path, settings: WorkflowSettings) -> Result<Registry> {
        load_workflow(definition, settings)
    }
}

/// The external collaborators of a run.
#[derive(Clone)]
pub struct Collaborators {
    pub dag_builder: Arc<dyn DagBuilder>,
    pub scheduler: Arc<dyn SchedulerFactory>,
    pub state: Arc<dyn PersistenceFactory>,
    /// Used for sub-workflows
    pub loader: Arc<dyn WorkflowLoader>,
}

impl Collaborators {
    /// Graph resolution, local scheduling and run state on this machine.
    pub fn builtin() -> Self {
        Self {
            dag_builder: Arc::new(FileDagBuilder),
            scheduler: Arc::new(LocalSchedulerFactory),
            state: Arc::new(StateStoreFactory),
            loader: Arc::new(YamlWorkflowLoader),
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Read-only reports; none of them runs a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Inspection {
    Dag,
    RuleGraph,
    FileGraph,
    D3Dag,
    Summary,
    DetailedSummary,
    Changes(ChangeKind),
    Untracked,
    Archive(PathBuf),
    DeleteAllOutput,
    DeleteTempOutput,
}

impl Inspection {
    /// Graph renderings skip sub-workflows.
    fn is_graph(&self) -> bool {
        matches!(self, Self::Dag | Self::RuleGraph | Self::FileGraph)
    }
}

/// Everything a caller can ask of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub targets: Vec<String>,
    pub dryrun: bool,
    pub touch: bool,
    pub forcetargets: bool,
    pub forceall: bool,
    pub forcerun: Vec<String>,
    pub until: Vec<String>,
    pub omit_from: Vec<String>,
    pub prioritytargets: Vec<String>,
    pub allowed_rules: Option<Vec<String>>,
    pub nodeps: bool,
    pub ignore_incomplete: bool,
    pub keepgoing: bool,
    pub printreason: bool,
    pub printshellcmds: bool,
    pub max_jobs: Option<usize>,
    pub max_jobs_per_second: Option<f64>,
    pub executor: Executor,
    pub nolock: bool,
    pub unlock: bool,
    pub cleanup_metadata: Vec<String>,
    pub cleanup_shadow: bool,
    /// Print a container definition for the conda environments
    pub containerize: bool,
    pub inspection: Option<Inspection>,
    pub conda_create_envs_only: bool,
    /// Print the conda environments of the jobs and exit
    pub list_conda_envs: bool,
    /// Remove conda environments no job uses and exit
    pub conda_cleanup_envs: bool,
    /// Remove container images no job uses and exit
    pub cleanup_containers: bool,
    /// Files to wait for before building the graph
    pub wait_for_files: Vec<String>,
    pub stats: Option<PathBuf>,
    /// Log file handed to hooks and mentioned on completion
    pub logfile: Option<PathBuf>,
    pub no_hooks: bool,
}

impl ExecuteRequest {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Requests that tolerate a lock held by another run.
    fn warn_only(&self) -> bool {
        self.dryrun || self.inspection.is_some()
    }
}

/// Result of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub success: bool,
    /// Files the run (would have) produced
    pub updated_files: Vec<String>,
}

impl RunOutcome {
    fn done() -> Self {
        Self {
            success: true,
            updated_files: Vec::new(),
        }
    }

    fn failed() -> Self {
        Self::default()
    }
}

/// Drives a run of a finished registry.
pub struct Orchestrator {
    registry: Registry,
    workdir: PathBuf,
    collaborators: Collaborators,
}

impl Orchestrator {
    /// `base` is the directory relative working directories resolve against.
    pub fn new(registry: Registry, base: impl Into<PathBuf>, collaborators: Collaborators) -> Self {
        let base = base.into();
        let workdir = match registry.working_dir() {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => base.join(dir),
            None => base,
        };
        Self {
            registry,
            workdir,
            collaborators,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn settings(&self) -> &WorkflowSettings {
        self.registry.settings()
    }

    /// Splits the request into rule and file target sets.
    pub fn resolve_targets(&self, request: &ExecuteRequest) -> TargetSets {
        let registry = &self.registry;
        let targets: Vec<String> = if request.targets.is_empty() {
            registry.default_target().map(str::to_string).into_iter().collect()
        } else {
            request.targets.clone()
        };

        let split = |items: &[String]| -> (BTreeSet<String>, BTreeSet<String>) {
            items.iter().cloned().partition(|item| registry.is_rule(item))
        };
        let without_wildcards = |rules: &BTreeSet<String>| -> Vec<String> {
            rules
                .iter()
                .filter(|name| {
                    registry
                        .get_rule(name)
                        .map(|rule| !rule.has_wildcards())
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        let (mut targetrules, mut targetfiles) = split(&targets);
        let (priorityrules, priorityfiles) = split(&request.prioritytargets);
        let (mut forcerules, mut forcefiles) = split(&request.forcerun);
        let (untilrules, untilfiles) = split(&request.until);
        let (omitrules, omitfiles) = split(&request.omit_from);

        targetrules.extend(without_wildcards(&priorityrules));
        targetrules.extend(without_wildcards(&forcerules));
        targetrules.extend(without_wildcards(&untilrules));
        targetfiles.extend(priorityfiles.iter().cloned());
        targetfiles.extend(forcefiles.iter().cloned());
        targetfiles.extend(untilfiles.iter().cloned());

        if request.forcetargets {
            forcefiles.extend(targetfiles.iter().cloned());
            forcerules.extend(targetrules.iter().cloned());
        }

        TargetSets {
            targetrules,
            targetfiles,
            forcerules,
            forcefiles,
            untilrules,
            untilfiles,
            omitrules,
            omitfiles,
            priorityrules,
            priorityfiles,
            forceall: request.forceall,
            forcetargets: request.forcetargets,
            allowed_rules: request
                .allowed_rules
                .as_ref()
                .map(|rules| rules.iter().cloned().collect()),
            nodeps: request.nodeps,
            ignore_incomplete: request.ignore_incomplete
                || matches!(&request.inspection, Some(inspection) if inspection.is_graph()),
            rerun_triggers: self.settings().rerun_triggers.clone(),
        }
    }

    /// Runs the workflow for `request`.
    pub fn execute(&mut self, request: &ExecuteRequest) -> Result<RunOutcome> {
        self.registry.check_localrules();
        self.registry.check()?;

        if !self.workdir.exists() {
            fs::create_dir_all(&self.workdir)?;
            debug!("Created working directory {}", self.workdir.display());
        }

        let targets = self.resolve_targets(request);
        let latency = Duration::from_secs(self.settings().latency_wait);
        if !request.wait_for_files.is_empty() {
            wait_for_files(&request.wait_for_files, &self.workdir, latency)?;
        }

        info!("Building DAG of jobs...");
        let mut dag = self
            .collaborators
            .dag_builder
            .build(&self.registry, &targets, &self.workdir)?;

        let mut persistence = self.collaborators.state.open(&self.workdir, self.settings())?;

        if !request.cleanup_metadata.is_empty() {
            self.cleanup_metadata(persistence.as_mut(), &request.cleanup_metadata)?;
            return Ok(RunOutcome::done());
        }

        if request.unlock {
            return Ok(match persistence.cleanup_locks() {
                Ok(()) => {
                    info!("Unlocking working directory.");
                    RunOutcome::done()
                }
                Err(e) => {
                    error!(
                        "Error: Unlocking the directory {} failed. Maybe you don't have the permissions? ({})",
                        self.workdir.display(),
                        e
                    );
                    RunOutcome::failed()
                }
            });
        }

        dag.init(persistence.as_ref())?;
        dag.update_checkpoint_dependencies()?;
        dag.check_dynamic()?;

        if !(request.nolock || self.settings().nolock) {
            let (inputs, outputs) = dag.lock_files();
            match persistence.lock(&inputs, &outputs) {
                Ok(()) => {}
                Err(Error::LockConflict { path }) if request.warn_only() => {
                    warn!("Working directory is locked by another run ({})", path.display());
                }
                Err(e) => return Err(e),
            }
        }

        if request.cleanup_shadow {
            persistence.cleanup_shadow()?;
            return Ok(RunOutcome::done());
        }

        if request.containerize {
            println!("{}", dag.containerize()?);
            return Ok(RunOutcome::done());
        }

        let run_subworkflows = !matches!(&request.inspection, Some(inspection) if inspection.is_graph());
        if run_subworkflows && !self.run_subworkflows(dag.as_mut(), persistence.as_ref(), request)? {
            return Ok(RunOutcome::failed());
        }

        if !request.dryrun {
            dag.deactivate_iocache();
            persistence.deactivate_cache();
        }

        if request.nodeps {
            let missing = dag.missing_inputs();
            if !missing.is_empty() {
                return Err(Error::MissingDependency { files: missing });
            }
        }

        if self.settings().immediate_submit && !dag.checkpoint_jobs().is_empty() {
            return Err(Error::IncompatibleMode(
                "immediate submit may not be used for workflows with checkpoint jobs, \
                 as the dependencies cannot be determined before execution"
                    .to_string(),
            ));
        }

        let planned: Vec<String> = dag
            .needrun_jobs()
            .iter()
            .flat_map(|job| job.output.iter().cloned())
            .collect();

        if let Some(inspection) = &request.inspection {
            self.inspect(dag.as_ref(), persistence.as_ref(), inspection, request.dryrun)?;
            return Ok(RunOutcome {
                success: true,
                updated_files: planned,
            });
        }

        if self.settings().use_singularity {
            let dryrun = request.dryrun || request.list_conda_envs || request.cleanup_containers;
            dag.pull_container_images(dryrun, &persistence.container_prefix())?;
        }
        if self.settings().use_conda {
            let dryrun = request.dryrun || request.list_conda_envs || request.conda_cleanup_envs;
            dag.create_conda_envs(dryrun, &persistence.conda_prefix())?;
            if request.conda_create_envs_only {
                return Ok(RunOutcome::done());
            }
        }

        if request.list_conda_envs {
            println!("environment\tcontainer\tlocation");
            for (file, image, address) in dag.conda_env_listing(&persistence.conda_prefix())? {
                println!("{}\t{}\t{}", file, image, address.display());
            }
            return Ok(RunOutcome::done());
        }
        if request.conda_cleanup_envs {
            let in_use = dag.conda_env_addresses(&persistence.conda_prefix())?;
            let removed = persistence.conda_cleanup_envs(&in_use)?;
            info!("Removed {} unused conda environments.", removed.len());
            return Ok(RunOutcome::done());
        }
        if request.cleanup_containers {
            let in_use = dag.container_images(&persistence.container_prefix());
            let removed = persistence.cleanup_containers(&in_use)?;
            info!("Removed {} unused container images.", removed.len());
            return Ok(RunOutcome::done());
        }

        self.schedule(dag.as_ref(), persistence.as_mut(), request, planned)
    }

    fn cleanup_metadata(&self, persistence: &mut dyn Persistence, files: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        for file in files {
            if !persistence.cleanup_metadata(file)? {
                failed.push(file.as_str());
            }
        }
        if !failed.is_empty() {
            warn!(
                "Failed to clean up metadata for the following files because the metadata was not present.\n\
                 If this is expected, there is nothing to do.\nFiles:\n{}",
                failed.join("\n")
            );
        }
        Ok(())
    }

    /// Runs every sub-workflow the graph needs files from; false on failure.
    fn run_subworkflows(
        &self,
        dag: &mut dyn Dag,
        persistence: &dyn Persistence,
        request: &ExecuteRequest,
    ) -> Result<bool> {
        let subworkflows: Vec<_> = self.registry.subworkflows().cloned().collect();
        for subworkflow in &subworkflows {
            let files = dag.subworkflow_files(&subworkflow.name);
            if files.is_empty() {
                info!("Subworkflow {}: {}", subworkflow.name, NOTHING_TO_BE_DONE);
                continue;
            }
            let targets = subworkflow.targets(files.iter().map(String::as_str));
            debug!(
                "Files requested from subworkflow:\n    {}",
                targets.join("\n    ")
            );
            info!("Executing subworkflow {}.", subworkflow.name);

            let mut settings = self.settings().clone();
            settings.overwrite_workdir = None;
            settings.overwrite_configfiles = subworkflow.configfile.iter().cloned().collect();
            let registry = self
                .collaborators
                .loader
                .load(&subworkflow.snakefile(), settings)?;

            let mut nested = Orchestrator::new(registry, subworkflow.workdir(), self.collaborators.clone());
            let nested_request = ExecuteRequest {
                targets,
                dryrun: request.dryrun,
                touch: request.touch,
                keepgoing: request.keepgoing,
                printreason: request.printreason,
                printshellcmds: request.printshellcmds,
                max_jobs: request.max_jobs,
                executor: request.executor.clone(),
                nolock: request.nolock,
                no_hooks: true,
                ..Default::default()
            };
            let outcome = nested.execute(&nested_request)?;
            if !outcome.success {
                error!("Subworkflow {} failed", subworkflow.name);
                return Ok(false);
            }

            let updated: Vec<String> = outcome
                .updated_files
                .iter()
                .map(|file| subworkflow.target(file).pattern)
                .collect();
            dag.mark_updated(&updated, persistence)?;
        }
        if !subworkflows.is_empty() {
            info!("Executing main workflow.");
        }
        Ok(true)
    }

    fn inspect(
        &self,
        dag: &dyn Dag,
        persistence: &dyn Persistence,
        inspection: &Inspection,
        dryrun: bool,
    ) -> Result<()> {
        match inspection {
            Inspection::Dag => println!("{}", dag.dot()),
            Inspection::RuleGraph => println!("{}", dag.rule_dot()),
            Inspection::FileGraph => println!("{}", dag.filegraph_dot()),
            Inspection::D3Dag => println!("{}", dag.d3dag()?),
            Inspection::Summary => println!("{}", dag.summary(false, persistence).join("\n")),
            Inspection::DetailedSummary => println!("{}", dag.summary(true, persistence).join("\n")),
            Inspection::Changes(kind) => {
                let files = dag.changed_files(*kind, persistence);
                if !files.is_empty() {
                    println!("{}", files.join("\n"));
                }
            }
            Inspection::Untracked => {
                let files = dag.untracked_files()?;
                if !files.is_empty() {
                    println!("{}", files.join("\n"));
                }
            }
            Inspection::Archive(path) => dag.archive(path)?,
            Inspection::DeleteAllOutput => {
                dag.clean(false, dryrun)?;
            }
            Inspection::DeleteTempOutput => {
                dag.clean(true, dryrun)?;
            }
        }
        Ok(())
    }

    fn policy(&self, request: &ExecuteRequest, persistence: &dyn Persistence) -> SchedulerPolicy {
        let settings = self.settings();
        let mut step = StepContext::new(&self.workdir);
        step.conda_prefix = settings.use_conda.then(|| persistence.conda_prefix());
        step.singularity_prefix = settings.use_singularity.then(|| persistence.container_prefix());
        step.use_env_modules = settings.use_env_modules;
        step.wrapper_prefix = settings.wrapper_prefix.clone();
        step.shadow_prefix = persistence.shadow_prefix();
        step.latency_wait = Duration::from_secs(settings.latency_wait);
        step.printshellcmds = request.printshellcmds;

        let mut policy = SchedulerPolicy::new(step);
        policy.cores = settings.cores();
        policy.nodes = settings.nodes();
        policy.resources = settings.global_resources.clone();
        policy.max_jobs = request.max_jobs;
        policy.max_jobs_per_second = request.max_jobs_per_second;
        policy.keepgoing = request.keepgoing;
        policy.dryrun = request.dryrun;
        policy.touch = request.touch;
        policy.printreason = request.printreason || request.dryrun;
        policy.printshellcmds = request.printshellcmds;
        policy.immediate_submit = settings.immediate_submit;
        policy.executor = request.executor.clone();
        policy.stats = request.stats.clone();
        policy
    }

    fn schedule(
        &self,
        dag: &dyn Dag,
        persistence: &mut dyn Persistence,
        request: &ExecuteRequest,
        planned: Vec<String>,
    ) -> Result<RunOutcome> {
        let needrun = dag.needrun_jobs().len();
        if needrun == 0 {
            info!("{}", NOTHING_TO_BE_DONE);
            if request.dryrun {
                return Ok(RunOutcome::done());
            }
        } else {
            info!("{}", dag.stats());
            if !request.dryrun {
                let cores = self.settings().cores();
                let hint = if cores > 1 { "" } else { " (use --cores to define parallelism)" };
                info!("Provided cores: {}{}", cores, hint);
                info!("Rules claiming more threads will be scaled down.");
            }
        }

        let hooks = self.registry.hooks().clone();
        let logfile = request.logfile.as_deref();
        let run_hooks = !request.dryrun && !request.no_hooks;
        if run_hooks {
            if let Some(hook) = &hooks.onstart {
                hook(logfile);
            }
        }

        let has_checkpoints = !dag.checkpoint_jobs().is_empty();
        let policy = self.policy(request, persistence);
        let mut scheduler = self.collaborators.scheduler.create(policy)?;
        let result = scheduler.run(dag, persistence);

        if !self.settings().immediate_submit && !request.dryrun {
            dag.cleanup_workdir();
        }

        if !matches!(result, Ok(true)) {
            if run_hooks {
                if let Some(hook) = &hooks.onerror {
                    hook(logfile);
                }
            }
            self.logfile_hint(logfile);
            return result.map(|_| RunOutcome::failed());
        }

        if request.dryrun {
            if needrun > 0 {
                info!("{}", dag.stats());
                self.provenance_advisory(dag);
            }
            info!("This was a dry-run (flag -n). The order of jobs does not reflect the order of execution.");
            if has_checkpoints {
                info!(
                    "The run involves checkpoint jobs, which will result in alteration of the DAG of jobs \
                     (e.g. adding more jobs) after their completion."
                );
            }
        } else {
            self.logfile_hint(logfile);
        }
        if run_hooks {
            if let Some(hook) = &hooks.onsuccess {
                hook(logfile);
            }
        }

        let updated_files = if request.dryrun {
            planned
        } else {
            scheduler.updated_files().to_vec()
        };
        Ok(RunOutcome {
            success: true,
            updated_files,
        })
    }

    fn provenance_advisory(&self, dag: &dyn Dag) {
        let rules = dag.provenance_triggered_rules();
        if rules.is_empty() {
            return;
        }
        info!(
            "Some jobs were triggered by provenance information, see 'reason' section in the rule displays above.\n\
             If you prefer that only modification time is used to determine whether a job shall be executed, \
             restrict the rerun triggers to mtime.\n\
             If you are sure that a change for a certain output file won't change the result, \
             you can also wipe its metadata with --cleanup-metadata <outfile>."
        );
        info!(
            "Rules with provenance triggered jobs: {}",
            rules.into_iter().collect::<Vec<_>>().join(",")
        );
    }

    fn logfile_hint(&self, logfile: Option<&Path>) {
        if let Some(path) = logfile {
            info!("Complete log: {}", path.display());
        }
    }
}
